//! Round-robin queue of runnable threads. Quanta are counted in interpreter steps; their
//! size follows the measured step rate so that one quantum takes about
//! [`VmConfig::responsiveness`] of wall time.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::{
    VmConfig,
    consts::NORM_PRIORITY,
    runtime::{BlockedOn, Machine, ThreadId, ThreadStatus},
};

#[derive(Debug)]
pub(crate) struct Scheduler {
    queue: VecDeque<ThreadId>,
    quantum: usize,
    min_quantum: usize,
    max_quantum: usize,
    smoothing: f64,
    target: Duration,
    // steps per second, smoothed
    rate: Option<f64>,
}

impl Scheduler {
    pub(crate) fn new(config: &VmConfig) -> Scheduler {
        let min_quantum = config.min_quantum.max(1);
        let max_quantum = config.max_quantum.max(min_quantum);
        Scheduler {
            queue: VecDeque::new(),
            quantum: config.initial_quantum.clamp(min_quantum, max_quantum),
            min_quantum,
            max_quantum,
            smoothing: config.quantum_smoothing.clamp(0.0, 1.0),
            target: config.responsiveness,
            rate: None,
        }
    }

    /// Queues `id` at the back unless it is queued already.
    pub(crate) fn enqueue(&mut self, id: ThreadId) {
        if !self.queue.contains(&id) {
            self.queue.push_back(id);
        }
    }

    pub(crate) fn next(&mut self) -> Option<ThreadId> {
        self.queue.pop_front()
    }

    pub(crate) fn quantum(&self) -> usize {
        self.quantum
    }

    /// Feeds one finished quantum into the moving average and resizes the next ones.
    pub(crate) fn record(&mut self, steps: usize, elapsed: Duration) {
        // quanta cut short by blocking say little about throughput
        if steps < self.quantum / 2 || elapsed.is_zero() {
            return;
        }
        let sample = steps as f64 / elapsed.as_secs_f64();
        let rate = match self.rate {
            Some(rate) => rate + self.smoothing * (sample - rate),
            None => sample,
        };
        self.rate = Some(rate);
        let quantum = ((rate * self.target.as_secs_f64()).round() as usize)
            .clamp(self.min_quantum, self.max_quantum);
        if quantum != self.quantum {
            tracing::debug!(from = self.quantum, to = quantum, rate, "quantum recalibrated");
            self.quantum = quantum;
        }
    }
}

impl Machine {
    /// Next queued thread that is still runnable.
    pub(crate) fn next_runnable(&mut self) -> Option<ThreadId> {
        while let Some(id) = self.scheduler.next() {
            if self.thread(id).status == ThreadStatus::Runnable {
                return Some(id);
            }
        }
        None
    }

    /// The scheduler's quantum weighted by thread priority.
    pub(crate) fn quantum_for(&self, id: ThreadId) -> usize {
        let priority = self.thread(id).priority.max(1) as usize;
        (self.scheduler.quantum() * priority / NORM_PRIORITY as usize).max(1)
    }

    /// Wakes every thread whose timed wait, sleep or park has expired.
    pub(crate) fn fire_timers(&mut self, now: Instant) {
        let expired: Vec<(ThreadId, BlockedOn)> = self
            .threads
            .iter()
            .filter(|t| t.deadline.is_some_and(|deadline| deadline <= now))
            .map(|t| (t.id, t.blocked_on.clone()))
            .collect();
        for (id, on) in expired {
            tracing::trace!(thread = %id, ?on, "timer fired");
            self.thread_mut(id).deadline = None;
            match (self.thread(id).status, on) {
                (ThreadStatus::TimedWaiting, BlockedOn::Wait(obj)) => {
                    self.wait_timeout_or_interrupt(id, obj)
                }
                (ThreadStatus::TimedWaiting, BlockedOn::Sleep)
                | (ThreadStatus::Parked, BlockedOn::Park) => self.wake(id),
                _ => {}
            }
        }
    }

    /// Earliest pending timer.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.threads.iter().filter_map(|t| t.deadline).min()
    }
}
