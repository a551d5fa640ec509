//! Ingestion and classification pipeline.
//!
//! Every inbound event flows through:
//! 1. `Ingestor::ingest()`: persist, compute priority, enqueue
//! 2. `IngestionQueue`: bounded, non-blocking, one task per message
//! 3. `WorkerPool`: priority batches, shared rate limit, per-task timeout
//! 4. `MessageProcessor::process()`: the recorded stages, result published
//!
//! A message is never left in limbo: classification faults are stored as
//! the message's `processing_error`, and failed messages can be reprocessed.

pub mod ingest;
pub mod pool;
pub mod prefilter;
pub mod processor;
pub mod queue;
pub mod rate_limit;
pub mod tracker;
pub mod types;

pub use ingest::{IngestOutcome, IngestStats, Ingestor, ReprocessReport};
pub use pool::{PoolStats, WorkerPool};
pub use prefilter::Prefilter;
pub use processor::MessageProcessor;
pub use queue::{EnqueueError, IngestionQueue};
pub use rate_limit::RateLimiter;
pub use tracker::{WorkflowSummary, WorkflowTracker};
