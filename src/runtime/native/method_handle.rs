use std::sync::Arc;

use crate::runtime::{
    NativeEnv, NativeResult, NativeReturn, NativeVariable, native::NativeRegistry,
};

const METHOD_HANDLE: &str = "java/lang/invoke/MethodHandle";

// public native MethodHandle withAppendix(Object appendix);
fn native_method_handle_with_appendix(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let this = env.args[0].get_ref();
    let appendix = env.args[1].get_ref();
    let Some((kind, method, _)) = env.machine.heap.method_handle(this) else {
        return Ok(NativeVariable::Reference(this).into());
    };
    let method = Arc::clone(method);
    let handle = env.machine.new_method_handle(kind, method, Some(appendix));
    Ok(NativeVariable::Reference(handle).into())
}

// public native MethodType type();
fn native_method_handle_type(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let this = env.args[0].get_ref();
    let Some((_, method, _)) = env.machine.heap.method_handle(this) else {
        return Ok(NativeVariable::Reference(0).into());
    };
    let descriptor = Arc::clone(&method.raw_descriptor);
    Ok(NativeVariable::Reference(env.machine.new_method_type(descriptor)).into())
}

pub(super) fn register_natives(registry: &NativeRegistry) {
    registry.register(
        METHOD_HANDLE,
        "withAppendix",
        "(Ljava/lang/Object;)Ljava/lang/invoke/MethodHandle;",
        native_method_handle_with_appendix,
    );
    registry.register(
        METHOD_HANDLE,
        "type",
        "()Ljava/lang/invoke/MethodType;",
        native_method_handle_type,
    );
}
