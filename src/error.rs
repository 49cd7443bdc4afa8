use thiserror::Error;

use crate::runtime::ThreadId;

/// Failures reported to the host. Guest-level throwables never surface here; they travel
/// through the unwinding protocol and reach the host as [`crate::Completion::Threw`].
#[derive(Debug, Error)]
pub enum VmError {
    #[error("core class {0} is missing or could not be loaded synchronously")]
    MissingCoreClass(String),
    #[error("class {0} not found")]
    ClassNotFound(String),
    #[error("thread {0} does not exist")]
    ThreadNotFound(ThreadId),
    #[error("thread {0} cannot accept a new entry point in its current state")]
    ThreadBusy(ThreadId),
    #[error("argument list does not match descriptor {0}")]
    ArgumentMismatch(String),
    #[error("deadlock: threads {0:?} can never run again")]
    Deadlock(Vec<ThreadId>),
    #[error("machine halted with status {0}")]
    Halted(i32),
    #[error("asynchronous operation {0} is not pending")]
    UnknownAsyncToken(u64),
}
