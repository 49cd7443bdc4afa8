use crate::runtime::{NativeEnv, NativeResult, NativeReturn, native::NativeRegistry};

// static native void halt0(int status);
fn native_shutdown_halt0(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let status = env.args[0].get_int();
    env.machine.halt(status);
    // every thread, the caller included, is terminated by now
    Ok(NativeReturn::Suspend)
}

pub(super) fn register_natives(registry: &NativeRegistry) {
    registry.register("java/lang/Shutdown", "halt0", "(I)V", native_shutdown_halt0);
}
