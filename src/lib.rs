pub mod class;
pub mod config;
pub mod consts;
pub mod descriptor;
pub mod error;
pub mod runtime;

pub use config::VmConfig;
pub use error::VmError;
pub use runtime::{
    AsyncHandle, AsyncOutcome, AsyncToken, Class, ClassLookup, ClassProvider, ClassState,
    Completion, LoaderId, Machine, MapProvider, NativeEnv, NativeFunction, NativeResult,
    NativeReturn, NativeVariable, ObjRef, RunState, StackTraceElement, ThreadId, ThreadStatus,
};
