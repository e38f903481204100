//! Container log redirect engine.
//!
//! For every configured container a [`RedirectWorker`] follows the live log
//! stream, drops lines matching exclude keywords, and appends the rest to a
//! size-rotated file. The [`Supervisor`] keeps exactly one worker per
//! container, reconciling against fresh configuration on every reload.
//!
//! ```text
//! ConfigProvider --snapshot--> Supervisor --spawn/stop--> RedirectWorker
//!                                  ^                          |
//!                                  +------ WorkerEvent -------+
//!                                  |
//!                                  +--> NotifierHandle --> Notifier
//!
//! RedirectWorker: LogSource -> LogStream -> should_keep -> RotatingSink
//! ```

pub mod alert;
pub mod backoff;
pub mod filter;
pub mod follower;
pub mod notifier;
pub mod sink;
pub mod supervisor;
pub mod worker;

pub use alert::{AlertMatcher, PatternHit};
pub use backoff::Backoff;
pub use filter::should_keep;
pub use follower::{
    DockerLogSource, FollowSettings, FollowerCursor, LineEvent, LineSplitter, LogSource,
    LogStream,
};
pub use notifier::{Notification, Notifier, NotifierHandle};
pub use sink::{AppendOutcome, Rotation, RotatingSink};
pub use supervisor::{
    ConfigProvider, ReconcileSummary, Supervisor, SupervisorSettings, SupervisorStatus,
    WorkerStatus,
};
pub use worker::{RedirectWorker, WorkerEvent, WorkerSettings};
