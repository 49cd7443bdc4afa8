use std::time::{Duration, Instant};

use crate::{
    consts::{MAX_PRIORITY, MIN_PRIORITY},
    runtime::{
        BlockedOn, Exception, NativeEnv, NativeResult, NativeReturn, NativeVariable,
        ThreadStatus,
        famous_classes::{
            ILLEGAL_ARGUMENT_EXCEPTION, ILLEGAL_THREAD_STATE_EXCEPTION, INTERRUPTED_EXCEPTION,
        },
        native::{NativeRegistry, null_pointer},
    },
};

const THREAD: &str = "java/lang/Thread";

// public static native Thread currentThread();
fn native_thread_current_thread(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    Ok(NativeVariable::Reference(env.machine.thread(env.thread).object).into())
}

// public static native void yield();
fn native_thread_yield(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    if env.resumed {
        return Ok(NativeReturn::VOID);
    }
    // still runnable: only the rest of the quantum is given up
    Ok(NativeReturn::Suspend)
}

// public static native void sleep(long millis) throws InterruptedException;
fn native_thread_sleep(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let thread = env.thread;
    let interrupted = std::mem::take(&mut env.machine.thread_mut(thread).interrupted);
    if interrupted {
        return Err(Exception::new_vm_msg(INTERRUPTED_EXCEPTION, "sleep interrupted"));
    }
    if env.resumed {
        return Ok(NativeReturn::VOID);
    }
    let millis = env.args[0].get_long();
    if millis < 0 {
        return Err(Exception::new_vm_msg(
            ILLEGAL_ARGUMENT_EXCEPTION,
            "timeout value is negative",
        ));
    }
    env.machine.block(
        thread,
        ThreadStatus::TimedWaiting,
        BlockedOn::Sleep,
        Some(Instant::now() + Duration::from_millis(millis as u64)),
    );
    Ok(NativeReturn::Suspend)
}

// private native void start0();
fn native_thread_start0(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let this = env.args[0].get_ref();
    if env.machine.thread_of(this).is_some() {
        return Err(Exception::new_vm(ILLEGAL_THREAD_STATE_EXCEPTION));
    }
    env.machine.start_thread(this)?;
    Ok(NativeReturn::VOID)
}

// public final native boolean isAlive();
fn native_thread_is_alive(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let alive = env
        .machine
        .thread_of(env.args[0].get_ref())
        .is_some_and(|id| env.machine.thread(id).status.is_alive());
    Ok(NativeVariable::Boolean(alive).into())
}

// private native boolean isInterrupted(boolean clearInterrupted);
fn native_thread_is_interrupted(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let clear = env.args[1].get_boolean();
    let Some(id) = env.machine.thread_of(env.args[0].get_ref()) else {
        return Ok(NativeVariable::Boolean(false).into());
    };
    let thread = env.machine.thread_mut(id);
    let interrupted = thread.interrupted;
    if clear {
        thread.interrupted = false;
    }
    Ok(NativeVariable::Boolean(interrupted).into())
}

// private native void interrupt0();
fn native_thread_interrupt0(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    if let Some(id) = env.machine.thread_of(env.args[0].get_ref()) {
        env.machine.interrupt(id);
    }
    Ok(NativeReturn::VOID)
}

// public static native boolean holdsLock(Object obj);
fn native_thread_holds_lock(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let obj = env.args[0].get_ref();
    if obj == 0 {
        return Err(null_pointer());
    }
    Ok(NativeVariable::Boolean(env.machine.holds_lock(env.thread, obj)).into())
}

// private native void setPriority0(int newPriority);
fn native_thread_set_priority0(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let priority = env.args[1].get_int();
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(Exception::new_vm(ILLEGAL_ARGUMENT_EXCEPTION));
    }
    if let Some(id) = env.machine.thread_of(env.args[0].get_ref()) {
        env.machine.thread_mut(id).priority = priority;
    }
    Ok(NativeReturn::VOID)
}

pub(super) fn register_natives(registry: &NativeRegistry) {
    registry.register(
        THREAD,
        "currentThread",
        "()Ljava/lang/Thread;",
        native_thread_current_thread,
    );
    registry.register(THREAD, "yield", "()V", native_thread_yield);
    registry.register(THREAD, "sleep", "(J)V", native_thread_sleep);
    registry.register(THREAD, "start0", "()V", native_thread_start0);
    registry.register(THREAD, "isAlive", "()Z", native_thread_is_alive);
    registry.register(THREAD, "isInterrupted", "(Z)Z", native_thread_is_interrupted);
    registry.register(THREAD, "interrupt0", "()V", native_thread_interrupt0);
    registry.register(
        THREAD,
        "holdsLock",
        "(Ljava/lang/Object;)Z",
        native_thread_holds_lock,
    );
    registry.register(THREAD, "setPriority0", "(I)V", native_thread_set_priority0);
}

#[cfg(test)]
mod tests {
    use crate::{
        Completion, MapProvider, VmConfig,
        class::{
            ClassFile,
            builder::{Assembler, ClassFileBuilder},
        },
        consts::{FieldAccessFlag as F, MethodAccessFlag as M},
        runtime::{Machine, NativeVariable, ThreadId, ThreadStatus, instructions as inst},
    };

    // t/Task.run() bumps a static counter; main starts it on a new thread and joins it
    fn task_classes(start_twice: bool) -> Vec<ClassFile> {
        let mut task = ClassFileBuilder::new("t/Task");
        task.interface("java/lang/Runnable")
            .field(F::PUBLIC | F::STATIC, "runs", "I");
        let object_init = task.method_ref("java/lang/Object", "<init>", "()V");
        let runs = task.field_ref("t/Task", "runs", "I");
        let mut asm = Assembler::new(1);
        asm.op(inst::ALOAD_0)
            .op_u16(inst::INVOKESPECIAL, object_init)
            .op(inst::RETURN);
        task.method(M::PUBLIC, "<init>", "()V", asm.finish().unwrap());
        let mut asm = Assembler::new(1);
        asm.op_u16(inst::GETSTATIC, runs)
            .op(inst::ICONST_1)
            .op(inst::IADD)
            .op_u16(inst::PUTSTATIC, runs)
            .op(inst::RETURN);
        task.method(M::PUBLIC, "run", "()V", asm.finish().unwrap());

        let mut main = ClassFileBuilder::new("t/Starter");
        let thread_class = main.class("java/lang/Thread");
        let task_class = main.class("t/Task");
        let thread_init =
            main.method_ref("java/lang/Thread", "<init>", "(Ljava/lang/Runnable;)V");
        let task_init = main.method_ref("t/Task", "<init>", "()V");
        let start = main.method_ref("java/lang/Thread", "start", "()V");
        let join = main.method_ref("java/lang/Thread", "join", "()V");
        let is_alive = main.method_ref("java/lang/Thread", "isAlive", "()Z");
        let runs = main.field_ref("t/Task", "runs", "I");
        let mut asm = Assembler::new(1);
        asm.op_u16(inst::NEW, thread_class)
            .op(inst::DUP)
            .op_u16(inst::NEW, task_class)
            .op(inst::DUP)
            .op_u16(inst::INVOKESPECIAL, task_init)
            .op_u16(inst::INVOKESPECIAL, thread_init)
            .op(inst::ASTORE_0)
            .op(inst::ALOAD_0)
            .op_u16(inst::INVOKEVIRTUAL, start)
            .op(inst::ALOAD_0)
            .op_u16(inst::INVOKEVIRTUAL, join);
        if start_twice {
            asm.op(inst::ALOAD_0).op_u16(inst::INVOKEVIRTUAL, start);
        }
        // runs * 10 + isAlive
        asm.op_u16(inst::GETSTATIC, runs)
            .bipush(10)
            .op(inst::IMUL)
            .op(inst::ALOAD_0)
            .op_u16(inst::INVOKEVIRTUAL, is_alive)
            .op(inst::IADD)
            .op(inst::IRETURN);
        main.method(M::PUBLIC | M::STATIC, "main", "()I", asm.finish().unwrap());
        vec![task.build(), main.build()]
    }

    fn machine(classes: Vec<ClassFile>) -> Machine {
        let provider = classes
            .into_iter()
            .fold(MapProvider::new(), |provider, class| provider.with(class));
        Machine::new(VmConfig::default(), provider).unwrap()
    }

    #[test]
    fn test_start_and_join_runnable() {
        let mut vm = machine(task_classes(false));
        let result = vm.invoke_static("t/Starter", "main", "()I", vec![]).unwrap();
        assert_eq!(result, Completion::Returned(Some(NativeVariable::Int(10))));
        assert_eq!(vm.thread_status(ThreadId(1)), Some(ThreadStatus::Terminated));
        assert_eq!(vm.uncaught_exception(ThreadId(1)).unwrap(), None);
    }

    #[test]
    fn test_thread_starts_once() {
        let mut vm = machine(task_classes(true));
        let result = vm.invoke_static("t/Starter", "main", "()I", vec![]).unwrap();
        let Completion::Threw(throwable) = result else {
            panic!("expected IllegalThreadStateException, got {result:?}");
        };
        assert_eq!(
            vm.describe_throwable(throwable),
            "java.lang.IllegalThreadStateException"
        );
    }
}
