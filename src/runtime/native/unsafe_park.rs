use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::runtime::{
    BlockedOn, NativeEnv, NativeResult, NativeReturn, ThreadStatus, native::NativeRegistry,
};

// public native void park(boolean isAbsolute, long time);
fn native_unsafe_park(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    if env.resumed {
        return Ok(NativeReturn::VOID);
    }
    let thread = env.thread;
    let is_absolute = env.args[1].get_boolean();
    let time = env.args[2].get_long();
    let state = env.machine.thread_mut(thread);
    if std::mem::take(&mut state.park_permit) || state.interrupted {
        return Ok(NativeReturn::VOID);
    }
    let deadline = if is_absolute {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        if time <= now {
            return Ok(NativeReturn::VOID);
        }
        Some(Instant::now() + Duration::from_millis((time - now) as u64))
    } else if time < 0 {
        return Ok(NativeReturn::VOID);
    } else if time == 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_nanos(time as u64))
    };
    env.machine
        .block(thread, ThreadStatus::Parked, BlockedOn::Park, deadline);
    Ok(NativeReturn::Suspend)
}

// public native void unpark(Object thread);
fn native_unsafe_unpark(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let Some(id) = env.machine.thread_of(env.args[1].get_ref()) else {
        return Ok(NativeReturn::VOID);
    };
    if env.machine.thread(id).status == ThreadStatus::Parked {
        env.machine.wake(id);
    } else {
        env.machine.thread_mut(id).park_permit = true;
    }
    Ok(NativeReturn::VOID)
}

pub(super) fn register_natives(registry: &NativeRegistry) {
    for class in ["sun/misc/Unsafe", "jdk/internal/misc/Unsafe"] {
        registry.register(class, "park", "(ZJ)V", native_unsafe_park);
        registry.register(class, "unpark", "(Ljava/lang/Object;)V", native_unsafe_unpark);
    }
}
