mod engine;
mod error;
mod locks;
mod progress;
mod runner;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use engine::{
    CheckoutInfo, NoopInvalidator, SessionInvalidator, SyncAction, SyncEngine, SyncOptions,
    SyncOutcome,
};
pub use error::SyncError;
pub use locks::{Exclusive, PathLocks, PathSlot};
pub use progress::{BuildProgressLog, ProgressBoard, ProgressSnapshot};
pub use runner::{CommandRunner, CommandSpec, CommandStatus, ProcessRunner};
