use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Instant,
};

use crate::{
    consts::NORM_PRIORITY,
    runtime::{AsyncOutcome, AsyncToken, Exception, Frame, Machine, ObjRef},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub(crate) usize);

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ThreadStatus {
    New,
    Runnable,
    /// Contending for a monitor; an interrupt gives up the attempt.
    Blocked,
    /// Contending for a monitor after `wait`, or waiting for another thread's class
    /// initialization. Interrupts only set the flag.
    UninterruptiblyBlocked,
    Waiting,
    TimedWaiting,
    AsyncWaiting,
    Parked,
    Terminated,
}

impl ThreadStatus {
    pub(crate) fn can_transition_to(self, to: ThreadStatus) -> bool {
        use ThreadStatus::*;
        if to == Terminated {
            return self != Terminated;
        }
        match self {
            New => to == Runnable,
            Runnable => matches!(
                to,
                Blocked | UninterruptiblyBlocked | Waiting | TimedWaiting | AsyncWaiting | Parked
            ),
            Blocked | UninterruptiblyBlocked | AsyncWaiting | Parked => to == Runnable,
            Waiting | TimedWaiting => matches!(to, Runnable | UninterruptiblyBlocked),
            Terminated => false,
        }
    }

    pub fn is_alive(self) -> bool {
        !matches!(self, ThreadStatus::New | ThreadStatus::Terminated)
    }
}

/// What a non-runnable thread is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BlockedOn {
    None,
    MonitorEnter(ObjRef),
    // re-acquiring after wait, with the count wait released
    WaitReacquire(ObjRef),
    Wait(ObjRef),
    Sleep,
    Park,
    ClassInit(Arc<str>),
    AsyncOp(AsyncToken),
    ClassLookup,
}

#[derive(Debug)]
pub(crate) struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) name: Arc<str>,
    pub(crate) status: ThreadStatus,
    pub(crate) priority: i32,
    // top of stack last; taken out while the thread runs its quantum
    pub(crate) stack: Vec<Frame>,
    pub(crate) interrupted: bool,
    // raised at the start of the next quantum
    pub(crate) pending_exception: Option<Exception>,
    // the java/lang/Thread instance
    pub(crate) object: ObjRef,
    pub(crate) uncaught: Option<ObjRef>,
    // set when a monitor is handed over while the thread is blocked on it
    pub(crate) granted_monitor: Option<ObjRef>,
    pub(crate) blocked_on: BlockedOn,
    pub(crate) deadline: Option<Instant>,
    pub(crate) park_permit: bool,
    pub(crate) async_result: Option<AsyncOutcome>,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, name: Arc<str>, object: ObjRef) -> Thread {
        Thread {
            id,
            name,
            status: ThreadStatus::New,
            priority: NORM_PRIORITY,
            stack: vec![],
            interrupted: false,
            pending_exception: None,
            object,
            uncaught: None,
            granted_monitor: None,
            blocked_on: BlockedOn::None,
            deadline: None,
            park_permit: false,
            async_result: None,
        }
    }
}

impl Machine {
    pub(crate) fn thread(&self, id: ThreadId) -> &Thread {
        &self.threads[id.0]
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
        &mut self.threads[id.0]
    }

    /// Validated status change. Threads that become runnable are queued; an invalid
    /// transition means the engine's bookkeeping is corrupt.
    pub(crate) fn set_status(&mut self, id: ThreadId, to: ThreadStatus) {
        let thread = &mut self.threads[id.0];
        let from = thread.status;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            tracing::error!(thread = %id, ?from, ?to, "invalid thread state transition");
            panic!("thread {id}: invalid transition {from:?} -> {to:?}");
        }
        thread.status = to;
        tracing::debug!(thread = %id, ?from, ?to, "thread state");
        if to == ThreadStatus::Runnable {
            self.threads[id.0].blocked_on = BlockedOn::None;
            self.threads[id.0].deadline = None;
            self.scheduler.enqueue(id);
        }
    }

    pub(crate) fn block(
        &mut self,
        id: ThreadId,
        status: ThreadStatus,
        on: BlockedOn,
        deadline: Option<Instant>,
    ) {
        self.set_status(id, status);
        let thread = &mut self.threads[id.0];
        thread.blocked_on = on;
        thread.deadline = deadline;
    }

    pub(crate) fn wake(&mut self, id: ThreadId) {
        self.set_status(id, ThreadStatus::Runnable);
    }

    /// Thread bound to a `java/lang/Thread` instance, if it was started.
    pub(crate) fn thread_of(&self, object: ObjRef) -> Option<ThreadId> {
        self.thread_objects.get(&object).copied()
    }

    /// Delivers an interrupt according to what the thread is doing.
    pub(crate) fn interrupt(&mut self, id: ThreadId) {
        let (status, on) = {
            let thread = self.thread(id);
            (thread.status, thread.blocked_on.clone())
        };
        match (status, on) {
            (ThreadStatus::Blocked, BlockedOn::MonitorEnter(obj)) => {
                self.monitors.leave_contention(obj, id);
                self.thread_mut(id).pending_exception = Some(Exception::new_vm(
                    crate::runtime::famous_classes::INTERRUPTED_EXCEPTION,
                ));
                self.wake(id);
            }
            (ThreadStatus::Waiting | ThreadStatus::TimedWaiting, BlockedOn::Wait(obj)) => {
                self.thread_mut(id).interrupted = true;
                self.wait_timeout_or_interrupt(id, obj);
            }
            (ThreadStatus::Parked, _) => {
                self.thread_mut(id).interrupted = true;
                self.wake(id);
            }
            (ThreadStatus::TimedWaiting, BlockedOn::Sleep) => {
                self.thread_mut(id).interrupted = true;
                self.wake(id);
            }
            _ => self.thread_mut(id).interrupted = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use ThreadStatus::*;
        assert!(New.can_transition_to(Runnable));
        assert!(!New.can_transition_to(Blocked));
        assert!(Runnable.can_transition_to(Blocked));
        assert!(Blocked.can_transition_to(Runnable));
        assert!(!Blocked.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(UninterruptiblyBlocked));
        assert!(!AsyncWaiting.can_transition_to(Blocked));
        for status in [New, Runnable, Blocked, Waiting, Parked, AsyncWaiting] {
            assert!(status.can_transition_to(Terminated));
        }
        assert!(!Terminated.can_transition_to(Runnable));
        assert!(!Terminated.can_transition_to(Terminated));
    }
}
