use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use crate::runtime::{
    BlockedOn, Exception, Machine, ObjRef, ThreadId, ThreadStatus,
    famous_classes::ILLEGAL_MONITOR_STATE_EXCEPTION,
};

/// Reentrant lock plus wait set of one object. Created on first use.
#[derive(Debug, Default)]
pub(crate) struct Monitor {
    owner: Option<ThreadId>,
    count: u32,
    blocked: Vec<Contender>,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug, Clone, Copy)]
struct Contender {
    thread: ThreadId,
    // count the thread holds once it owns the monitor
    count: u32,
    // coming back from wait: no grant is left for it to consume
    reacquire: bool,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    thread: ThreadId,
    saved_count: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Enter {
    Acquired,
    Blocked,
}

#[derive(Debug)]
pub(crate) struct MonitorTable {
    monitors: HashMap<ObjRef, Monitor>,
    rng: u64,
}

impl MonitorTable {
    pub(crate) fn new(seed: u64) -> MonitorTable {
        MonitorTable {
            monitors: HashMap::new(),
            rng: seed,
        }
    }

    fn get(&mut self, obj: ObjRef) -> &mut Monitor {
        self.monitors.entry(obj).or_default()
    }

    pub(crate) fn owner(&self, obj: ObjRef) -> Option<ThreadId> {
        self.monitors.get(&obj).and_then(|m| m.owner)
    }

    pub(crate) fn count(&self, obj: ObjRef) -> u32 {
        self.monitors.get(&obj).map(|m| m.count).unwrap_or(0)
    }

    /// Whether any thread owns, waits on or contends for the monitor of `obj`.
    pub(crate) fn in_use(&self, obj: ObjRef) -> bool {
        self.monitors.get(&obj).is_some_and(|m| {
            m.owner.is_some() || !m.blocked.is_empty() || !m.waiters.is_empty()
        })
    }

    pub(crate) fn forget(&mut self, obj: ObjRef) {
        self.monitors.remove(&obj);
    }

    pub(crate) fn leave_contention(&mut self, obj: ObjRef, thread: ThreadId) {
        if let Some(monitor) = self.monitors.get_mut(&obj) {
            monitor.blocked.retain(|c| c.thread != thread);
        }
    }

    fn next_random(&mut self, bound: usize) -> usize {
        self.rng = self
            .rng
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.rng >> 33) as usize) % bound
    }
}

impl Machine {
    /// Takes `obj`'s monitor `count` times, or queues the thread and blocks it.
    pub(crate) fn monitor_enter(&mut self, thread: ThreadId, obj: ObjRef, count: u32) -> Enter {
        if self.thread(thread).granted_monitor == Some(obj) {
            // ownership was handed over while the thread was blocked
            self.thread_mut(thread).granted_monitor = None;
            return Enter::Acquired;
        }
        let monitor = self.monitors.get(obj);
        match monitor.owner {
            None => {
                monitor.owner = Some(thread);
                monitor.count = count;
                Enter::Acquired
            }
            Some(owner) if owner == thread => {
                monitor.count += count;
                Enter::Acquired
            }
            Some(_) => {
                monitor.blocked.push(Contender {
                    thread,
                    count,
                    reacquire: false,
                });
                self.block(
                    thread,
                    ThreadStatus::Blocked,
                    BlockedOn::MonitorEnter(obj),
                    None,
                );
                Enter::Blocked
            }
        }
    }

    pub(crate) fn monitor_exit(&mut self, thread: ThreadId, obj: ObjRef) -> Result<(), Exception> {
        let monitor = self.monitors.get(obj);
        if monitor.owner != Some(thread) {
            return Err(Exception::new_vm_msg(
                ILLEGAL_MONITOR_STATE_EXCEPTION,
                "current thread is not owner",
            ));
        }
        monitor.count -= 1;
        if monitor.count == 0 {
            monitor.owner = None;
            self.hand_off(obj);
        }
        Ok(())
    }

    /// Gives a released monitor to one contender picked at random.
    fn hand_off(&mut self, obj: ObjRef) {
        let len = self.monitors.get(obj).blocked.len();
        if len == 0 {
            return;
        }
        let pick = self.monitors.next_random(len);
        let monitor = self.monitors.get(obj);
        let next = monitor.blocked.swap_remove(pick);
        monitor.owner = Some(next.thread);
        monitor.count = next.count;
        if !next.reacquire {
            self.thread_mut(next.thread).granted_monitor = Some(obj);
        }
        tracing::trace!(obj, thread = %next.thread, "monitor handed off");
        self.wake(next.thread);
    }

    pub(crate) fn holds_lock(&self, thread: ThreadId, obj: ObjRef) -> bool {
        self.monitors.owner(obj) == Some(thread)
    }

    /// Releases the monitor completely and parks the thread in the wait set.
    pub(crate) fn monitor_wait(
        &mut self,
        thread: ThreadId,
        obj: ObjRef,
        timeout: Option<Duration>,
    ) -> Result<(), Exception> {
        let monitor = self.monitors.get(obj);
        if monitor.owner != Some(thread) {
            return Err(Exception::new_vm_msg(
                ILLEGAL_MONITOR_STATE_EXCEPTION,
                "current thread is not owner",
            ));
        }
        let saved_count = monitor.count;
        monitor.owner = None;
        monitor.count = 0;
        monitor.waiters.push_back(Waiter {
            thread,
            saved_count,
        });
        self.hand_off(obj);
        let (status, deadline) = match timeout {
            Some(timeout) => (ThreadStatus::TimedWaiting, Some(Instant::now() + timeout)),
            None => (ThreadStatus::Waiting, None),
        };
        self.block(thread, status, BlockedOn::Wait(obj), deadline);
        Ok(())
    }

    pub(crate) fn monitor_notify(
        &mut self,
        thread: ThreadId,
        obj: ObjRef,
        all: bool,
    ) -> Result<(), Exception> {
        if !self.holds_lock(thread, obj) {
            return Err(Exception::new_vm_msg(
                ILLEGAL_MONITOR_STATE_EXCEPTION,
                "current thread is not owner",
            ));
        }
        self.notify_waiters(obj, all);
        Ok(())
    }

    /// Moves waiters into contention in wait order. No ownership check: also used when a
    /// thread terminates so that joiners wake up.
    pub(crate) fn notify_waiters(&mut self, obj: ObjRef, all: bool) {
        loop {
            let Some(waiter) = self.monitors.get(obj).waiters.pop_front() else {
                break;
            };
            self.reacquire(waiter, obj);
            if !all {
                break;
            }
        }
    }

    /// Called when a timed wait expires or a waiting thread is interrupted.
    pub(crate) fn wait_timeout_or_interrupt(&mut self, thread: ThreadId, obj: ObjRef) {
        let monitor = self.monitors.get(obj);
        let Some(position) = monitor.waiters.iter().position(|w| w.thread == thread) else {
            return;
        };
        if let Some(waiter) = monitor.waiters.remove(position) {
            self.reacquire(waiter, obj);
        }
    }

    fn reacquire(&mut self, waiter: Waiter, obj: ObjRef) {
        let monitor = self.monitors.get(obj);
        if monitor.owner.is_none() {
            monitor.owner = Some(waiter.thread);
            monitor.count = waiter.saved_count;
            self.wake(waiter.thread);
        } else {
            monitor.blocked.push(Contender {
                thread: waiter.thread,
                count: waiter.saved_count,
                reacquire: true,
            });
            self.block(
                waiter.thread,
                ThreadStatus::UninterruptiblyBlocked,
                BlockedOn::WaitReacquire(obj),
                None,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{VmConfig, runtime::MapProvider};

    fn machine_with_threads(n: usize) -> (Machine, Vec<ThreadId>) {
        let mut vm = Machine::new(VmConfig::default(), MapProvider::new()).unwrap();
        let threads = (0..n)
            .map(|i| {
                let id = vm.spawn_thread(&format!("t{i}"));
                vm.wake(id);
                id
            })
            .collect();
        (vm, threads)
    }

    #[test]
    fn test_reentrant_count_law() {
        let (mut vm, threads) = machine_with_threads(1);
        let t = threads[0];
        let obj = vm.new_string("lock");
        for expected in 1..=3 {
            assert_eq!(vm.monitor_enter(t, obj, 1), Enter::Acquired);
            assert_eq!(vm.monitors.count(obj), expected);
        }
        vm.monitor_exit(t, obj).unwrap();
        vm.monitor_exit(t, obj).unwrap();
        assert_eq!(vm.monitors.count(obj), 1);
        assert!(vm.holds_lock(t, obj));
        vm.monitor_exit(t, obj).unwrap();
        assert_eq!(vm.monitors.owner(obj), None);
        assert!(vm.monitor_exit(t, obj).is_err());
    }

    #[test]
    fn test_blocked_thread_gets_requested_count() {
        let (mut vm, threads) = machine_with_threads(2);
        let (a, b) = (threads[0], threads[1]);
        let obj = vm.new_string("lock");
        assert_eq!(vm.monitor_enter(a, obj, 1), Enter::Acquired);
        assert_eq!(vm.monitor_enter(b, obj, 2), Enter::Blocked);
        assert_eq!(vm.thread_status(b), Some(ThreadStatus::Blocked));

        vm.monitor_exit(a, obj).unwrap();
        assert_eq!(vm.thread_status(b), Some(ThreadStatus::Runnable));
        assert_eq!(vm.monitors.owner(obj), Some(b));
        assert_eq!(vm.monitors.count(obj), 2);
        // the retried enter consumes the grant without counting twice
        assert_eq!(vm.monitor_enter(b, obj, 2), Enter::Acquired);
        assert_eq!(vm.monitors.count(obj), 2);
    }

    #[test]
    fn test_wait_restores_count() {
        let (mut vm, threads) = machine_with_threads(2);
        let (a, b) = (threads[0], threads[1]);
        let obj = vm.new_string("lock");
        vm.monitor_enter(a, obj, 1);
        vm.monitor_enter(a, obj, 1);
        vm.monitor_wait(a, obj, None).unwrap();
        assert_eq!(vm.thread_status(a), Some(ThreadStatus::Waiting));
        assert_eq!(vm.monitors.owner(obj), None);

        vm.monitor_enter(b, obj, 1);
        vm.monitor_notify(b, obj, false).unwrap();
        assert_eq!(
            vm.thread_status(a),
            Some(ThreadStatus::UninterruptiblyBlocked)
        );
        vm.monitor_exit(b, obj).unwrap();
        assert_eq!(vm.thread_status(a), Some(ThreadStatus::Runnable));
        assert_eq!(vm.monitors.owner(obj), Some(a));
        assert_eq!(vm.monitors.count(obj), 2);
    }

    #[test]
    fn test_wait_requires_ownership() {
        let (mut vm, threads) = machine_with_threads(1);
        let obj = vm.new_string("lock");
        assert!(vm.monitor_wait(threads[0], obj, None).is_err());
        assert!(vm.monitor_notify(threads[0], obj, true).is_err());
    }

    #[test]
    fn test_interrupt_leaves_contention() {
        let (mut vm, threads) = machine_with_threads(2);
        let (a, b) = (threads[0], threads[1]);
        let obj = vm.new_string("lock");
        vm.monitor_enter(a, obj, 1);
        vm.monitor_enter(b, obj, 1);
        vm.interrupt(b);
        assert_eq!(vm.thread_status(b), Some(ThreadStatus::Runnable));
        assert!(vm.thread(b).pending_exception.is_some());
        vm.monitor_exit(a, obj).unwrap();
        assert_eq!(vm.monitors.owner(obj), None);
    }
}
