use std::sync::Arc;

use crate::runtime::{NativeEnv, NativeResult, NativeReturn, NativeVariable, native::NativeRegistry};

// public native String getName();
fn native_class_get_name(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let this = env.args[0].get_ref();
    let Some(class) = env.machine.heap.mirror_class(this) else {
        return Ok(NativeVariable::Reference(0).into());
    };
    let name = class.class_name.replace('/', ".");
    Ok(NativeVariable::Reference(env.machine.new_string(&name)).into())
}

// public native String toMethodDescriptorString();
fn native_method_type_descriptor(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let this = env.args[0].get_ref();
    let Some(descriptor) = env.machine.heap.method_type_descriptor(this) else {
        return Ok(NativeVariable::Reference(0).into());
    };
    let descriptor = Arc::clone(descriptor);
    Ok(NativeVariable::Reference(env.machine.intern(&descriptor)).into())
}

pub(super) fn register_natives(registry: &NativeRegistry) {
    registry.register(
        "java/lang/Class",
        "getName",
        "()Ljava/lang/String;",
        native_class_get_name,
    );
    registry.register(
        "java/lang/invoke/MethodType",
        "toMethodDescriptorString",
        "()Ljava/lang/String;",
        native_method_type_descriptor,
    );
}
