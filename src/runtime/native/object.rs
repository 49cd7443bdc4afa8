use std::time::Duration;

use crate::runtime::{
    Exception, NativeEnv, NativeResult, NativeReturn, NativeVariable,
    famous_classes::{
        CLONE_NOT_SUPPORTED_EXCEPTION, ILLEGAL_ARGUMENT_EXCEPTION, INTERRUPTED_EXCEPTION,
    },
    native::NativeRegistry,
    resolution::all_interfaces,
};

const OBJECT: &str = "java/lang/Object";

// public native int hashCode();
pub(super) fn native_object_hash_code(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    Ok(NativeVariable::Int(env.args[0].get_ref() as i32).into())
}

// public final native Class<?> getClass();
fn native_object_get_class(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let this = env.args[0].get_ref();
    let class = std::sync::Arc::clone(env.machine.heap.class_of(this));
    Ok(NativeVariable::Reference(env.machine.class_mirror(&class)).into())
}

// protected native Object clone() throws CloneNotSupportedException;
fn native_object_clone(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let this = env.args[0].get_ref();
    let class = env.machine.heap.class_of(this);
    let cloneable = class.is_array()
        || all_interfaces(class)
            .iter()
            .any(|i| i.class_name.as_ref() == "java/lang/Cloneable");
    if !cloneable {
        return Err(Exception::new_vm_msg(
            CLONE_NOT_SUPPORTED_EXCEPTION,
            class.class_name.replace('/', "."),
        ));
    }
    Ok(NativeVariable::Reference(env.machine.heap.clone_object(this)).into())
}

// public final native void notify();
fn native_object_notify(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    env.machine
        .monitor_notify(env.thread, env.args[0].get_ref(), false)?;
    Ok(NativeReturn::VOID)
}

// public final native void notifyAll();
fn native_object_notify_all(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    env.machine
        .monitor_notify(env.thread, env.args[0].get_ref(), true)?;
    Ok(NativeReturn::VOID)
}

// public final native void wait(long timeoutMillis) throws InterruptedException;
fn native_object_wait(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let thread = env.thread;
    let interrupted = std::mem::take(&mut env.machine.thread_mut(thread).interrupted);
    if env.resumed {
        // the monitor is held again with the count it had before
        if interrupted {
            return Err(Exception::new_vm(INTERRUPTED_EXCEPTION));
        }
        return Ok(NativeReturn::VOID);
    }
    let timeout = env.args[1].get_long();
    if timeout < 0 {
        return Err(Exception::new_vm_msg(
            ILLEGAL_ARGUMENT_EXCEPTION,
            "timeout value is negative",
        ));
    }
    if interrupted {
        return Err(Exception::new_vm(INTERRUPTED_EXCEPTION));
    }
    let timeout = (timeout > 0).then(|| Duration::from_millis(timeout as u64));
    env.machine
        .monitor_wait(thread, env.args[0].get_ref(), timeout)?;
    Ok(NativeReturn::Suspend)
}

pub(super) fn register_natives(registry: &NativeRegistry) {
    registry.register(OBJECT, "hashCode", "()I", native_object_hash_code);
    registry.register(OBJECT, "getClass", "()Ljava/lang/Class;", native_object_get_class);
    registry.register(OBJECT, "clone", "()Ljava/lang/Object;", native_object_clone);
    registry.register(OBJECT, "notify", "()V", native_object_notify);
    registry.register(OBJECT, "notifyAll", "()V", native_object_notify_all);
    registry.register(OBJECT, "wait", "(J)V", native_object_wait);
}
