//! Source channel discovery: access probing, blacklist and poll cycles.

pub mod access;
pub mod discovery;
pub mod poller;

pub use access::{ChannelAccessProbe, ChannelAccessRegistry, ChannelAccessState, ProbeOutcome};
pub use discovery::{CurrentUser, GuildChannel, GuildSummary};
pub use poller::{ChannelPoller, PollReport};
