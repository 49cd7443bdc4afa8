use crate::runtime::{NativeEnv, NativeResult, NativeReturn, NativeVariable, native::NativeRegistry};

// public native String intern();
fn native_string_intern(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let this = env.args[0].get_ref();
    let canonical = env.machine.heap.intern_existing(this).unwrap_or(this);
    Ok(NativeVariable::Reference(canonical).into())
}

pub(super) fn register_natives(registry: &NativeRegistry) {
    registry.register(
        "java/lang/String",
        "intern",
        "()Ljava/lang/String;",
        native_string_intern,
    );
}
