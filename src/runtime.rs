pub(crate) mod class_loader;
pub(crate) mod famous_classes;
pub(crate) mod heap;
pub(crate) mod inheritance;
pub(crate) mod interpreter;
pub(crate) mod monitor;
pub(crate) mod native;
pub(crate) mod resolution;
pub(crate) mod scheduler;
pub(crate) mod structs;
pub(crate) mod thread;
pub(crate) mod vm;

pub use class_loader::{AsyncToken, ClassLookup, ClassProvider, LoaderId, MapProvider};
pub use famous_classes::core_library;
pub use heap::Heap;
pub use interpreter::{Completion, instructions};
pub use native::{NativeEnv, NativeFunction, NativeReturn, NativeVariable};
pub use structs::{Class, ClassState, Exception, Method, NULL, NativeResult, ObjRef};
pub use thread::{ThreadId, ThreadStatus};
pub use vm::{AsyncHandle, AsyncOutcome, Machine, RunState, StackTraceElement};

pub(crate) use class_loader::ClassLoader;
pub(crate) use interpreter::{
    ContinuationFrame, Flow, Frame, FrameLock, InterpretedFrame, NativeFrame, Next, ReturnValue,
};
pub(crate) use monitor::Enter;
pub(crate) use structs::*;
pub(crate) use thread::{BlockedOn, Thread};
pub(crate) use vm::PendingOp;
