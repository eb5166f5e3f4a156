//! Reply delivery runtime: buffering, dispatch, polling and send orchestration.

mod aliases;
mod buffer;
mod dispatcher;
mod orchestrator;
mod poller;

pub use aliases::IdentifierAliases;
pub use buffer::{BufferConfig, BufferEvent, ContentBuffer, SubscriberId};
pub use dispatcher::{MessageDispatcher, UpdateHandler};
pub use orchestrator::{
    MessageOrchestrator, NullObserver, ReplyHandle, ReplyObserver, SendOutcome, SendPhase,
    SendRequest,
};
pub use poller::{FallbackPoller, PollObserver, PollerConfig, SnapshotDelta, compute_delta};
