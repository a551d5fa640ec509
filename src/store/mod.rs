//! Persistence layer — libSQL-backed storage for messages, step traces and
//! channel access state.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, InsertOutcome, StoredMessage};
