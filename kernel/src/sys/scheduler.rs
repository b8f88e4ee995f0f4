//! Scheduler
//!
//! Priority-based preemptive scheduler with:
//! - 32 priority classes (0 = highest, 31 = lowest)
//! - Round-robin within a class through active/expired queue pairs
//! - Quantum based preemption
//! - One idle thread per CPU, never queued
//!
//! # Scheduling Algorithm
//!
//! 1. Always run the highest priority ready thread
//! 2. A thread whose quantum ran out goes to its class's expired queue
//!    with a fresh quantum; the expired queue becomes active once the
//!    active queue drains
//! 3. Blocking causes an immediate reschedule
//! 4. Waking a more urgent thread flags the CPU that should run it
//!
//! # Switch protocol
//!
//! The outgoing thread keeps `running_on` set until the incoming thread
//! has run [`Kernel::finish_switch`], so no other CPU can pick it up while
//! its registers are still being saved. `finish_switch` also requeues a
//! preempted thread and reclaims a zombie.

use super::thread::{Priority, Thread, ThreadId, ThreadState, WaitInfo, NUM_PRIORITIES};
use super::Kernel;
use crate::arch::{Arch, CpuId};
use crate::mm::PhysAddr;
use crate::sync::{Blocker, IrqSpinLockGuard, WaitNode, WaitObject, WaitQueue, WaitToken, WakeReason};
use crate::table::IdTable;
use crate::{KernelError, KernelResult};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use core::time::Duration;

/// Ready threads, one active and one expired FIFO per priority class
#[derive(Debug)]
pub struct RunQueue {
    active: Vec<VecDeque<ThreadId>>,
    expired: Vec<VecDeque<ThreadId>>,
    /// Bit `p` set when class `p` has a thread in either queue
    bitmap: u32,
    len: usize,
}

impl RunQueue {
    /// Create empty queue
    pub fn new() -> Self {
        Self {
            active: (0..NUM_PRIORITIES).map(|_| VecDeque::new()).collect(),
            expired: (0..NUM_PRIORITIES).map(|_| VecDeque::new()).collect(),
            bitmap: 0,
            len: 0,
        }
    }

    /// Queue a thread in the active queue of its class
    pub fn push(&mut self, tid: ThreadId, priority: Priority) {
        self.active[priority.index()].push_back(tid);
        self.bitmap |= 1 << priority.index();
        self.len += 1;
    }

    /// Queue a thread whose quantum ran out
    pub fn push_expired(&mut self, tid: ThreadId, priority: Priority) {
        self.expired[priority.index()].push_back(tid);
        self.bitmap |= 1 << priority.index();
        self.len += 1;
    }

    /// Most urgent class with a queued thread
    pub fn best_priority(&self) -> Option<Priority> {
        (self.bitmap != 0).then(|| Priority::new(self.bitmap.trailing_zeros() as u8).ok()).flatten()
    }

    /// Take the next thread of the most urgent class
    pub fn pop(&mut self) -> Option<ThreadId> {
        let class = self.best_priority()?.index();
        if self.active[class].is_empty() {
            core::mem::swap(&mut self.active[class], &mut self.expired[class]);
        }

        let tid = self.active[class].pop_front()?;
        if self.active[class].is_empty() && self.expired[class].is_empty() {
            self.bitmap &= !(1 << class);
        }
        self.len -= 1;
        Some(tid)
    }

    /// Drop a queued thread wherever it is
    pub fn remove(&mut self, tid: ThreadId, priority: Priority) -> bool {
        let class = priority.index();
        let found = [&mut self.active[class], &mut self.expired[class]].into_iter().any(|queue| {
            match queue.iter().position(|&t| t == tid) {
                Some(index) => {
                    queue.remove(index);
                    true
                }
                None => false,
            }
        });

        if found {
            self.len -= 1;
            if self.active[class].is_empty() && self.expired[class].is_empty() {
                self.bitmap &= !(1 << class);
            }
        }
        found
    }

    /// Number of queued threads
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-CPU scheduler state
#[derive(Debug, Clone)]
pub(crate) struct CpuState {
    pub current: ThreadId,
    pub idle: ThreadId,
    /// Thread switched off, awaiting `finish_switch`
    pub prev: Option<ThreadId>,
    pub need_resched: bool,
    /// Page-table root loaded on this CPU
    pub active_root: Option<PhysAddr>,
}

/// Everything the global scheduler lock protects
pub(crate) struct SchedState<A: Arch> {
    pub threads: IdTable<ThreadId, Thread<A>>,
    pub run_queue: RunQueue,
    pub cpus: Vec<CpuState>,
    /// Timed waits in deadline order
    pub sleepers: WaitQueue,
    pub next_token: u64,
    /// Threads that are neither idle nor zombie
    pub live: usize,
}

impl<A: Arch> SchedState<A> {
    pub fn new(max_threads: usize) -> Self {
        Self {
            threads: IdTable::new(max_threads),
            run_queue: RunQueue::new(),
            cpus: Vec::new(),
            sleepers: WaitQueue::new(),
            next_token: 1,
            live: 0,
        }
    }

    pub fn current(&self, cpu: CpuId) -> ThreadId {
        self.cpus[cpu].current
    }
}

/// Why the running thread reschedules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// The thread is waiting and must leave the CPU
    Block,
    /// Explicit yield: give way to queued threads of the same class
    Yield,
    /// Quantum expiry or a more urgent wake-up
    Preempt,
    /// Idle loop polling for work
    Idle,
}

/// Counters kept by the scheduler
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub context_switches: core::sync::atomic::AtomicU64,
    pub address_space_switches: core::sync::atomic::AtomicU64,
    pub extended_saves: core::sync::atomic::AtomicU64,
    pub extended_loads: core::sync::atomic::AtomicU64,
}

type SchedGuard<'a, A> = IrqSpinLockGuard<'a, SchedState<A>>;

impl<A: Arch> Kernel<A> {
    /// Mark a thread ready and queue it unless it is still on a CPU
    ///
    /// Flags (and kicks) the CPU that should run it: an idle one, or the
    /// one running the least urgent thread below its priority.
    pub(crate) fn make_ready(&self, sched: &mut SchedState<A>, tid: ThreadId) {
        let Some(thread) = sched.threads.get_mut(tid) else {
            return;
        };
        thread.state = ThreadState::Ready;
        if thread.running_on.is_some() || thread.queued || thread.idle {
            return;
        }

        let priority = thread.priority;
        self.enqueue(sched, tid);

        // An idle CPU, else the one running the least urgent thread below us
        let mut target = None;
        let mut worst = priority;
        for (cpu, state) in sched.cpus.iter().enumerate() {
            match sched.threads.get(state.current) {
                Some(running) if !running.idle => {
                    if running.priority > worst {
                        worst = running.priority;
                        target = Some(cpu);
                    }
                }
                _ => {
                    target = Some(cpu);
                    break;
                }
            }
        }

        if let Some(cpu) = target {
            sched.cpus[cpu].need_resched = true;
            if cpu != self.arch.current_cpu() {
                self.arch.kick_cpu(cpu);
            }
        }
    }

    /// Queue a ready thread: expired queue with a fresh quantum when its
    /// quantum ran out, active queue otherwise
    fn enqueue(&self, sched: &mut SchedState<A>, tid: ThreadId) {
        let Some(thread) = sched.threads.get_mut(tid) else {
            return;
        };
        thread.queued = true;
        let priority = thread.priority;
        if thread.quantum == 0 {
            thread.quantum = self.config.quantum_ticks;
            sched.run_queue.push_expired(tid, priority);
        } else {
            sched.run_queue.push(tid, priority);
        }
    }

    /// Reschedule the current CPU
    pub(crate) fn reschedule(&self, mode: Mode) {
        let sched = self.sched.lock();
        self.reschedule_locked(sched, mode);
    }

    fn reschedule_locked(&self, mut sched: SchedGuard<'_, A>, mode: Mode) {
        let cpu = self.arch.current_cpu();
        sched.cpus[cpu].need_resched = false;
        let current = sched.cpus[cpu].current;

        let (runnable, idle, priority, quantum) = match sched.threads.get(current) {
            Some(t) => {
                let runnable = t.idle
                    || t.state == ThreadState::Running
                    || (t.state == ThreadState::Ready && t.running_on == Some(cpu));
                (runnable, t.idle, t.priority, t.quantum)
            }
            None => self.fatal(&sched, "current thread missing from the thread table"),
        };

        let switch = match sched.run_queue.best_priority() {
            None => !runnable,
            Some(_) if idle => true,
            Some(best) if runnable => match mode {
                Mode::Yield => best <= priority,
                _ => best < priority || (quantum == 0 && best <= priority),
            },
            Some(_) => true,
        };

        if !switch {
            if let Some(thread) = sched.threads.get_mut(current) {
                thread.state = ThreadState::Running;
            }
            return;
        }

        let next = match sched.run_queue.pop() {
            Some(tid) => tid,
            None => sched.cpus[cpu].idle,
        };
        if next == current {
            self.fatal(&sched, "thread queued while running");
        }

        if let Some(thread) = sched.threads.get_mut(current) {
            if thread.state == ThreadState::Running {
                thread.state = ThreadState::Ready;
            }
        }

        let switch = self.prepare(&mut sched, cpu, current, next);
        drop(sched);

        log::trace!("CPU {} switch {} -> {}", cpu, current, next);
        unsafe { self.arch.switch(switch) };
        self.finish_switch();
    }

    /// Bookkeeping of a switch from `current` to `next` on `cpu`
    fn prepare(&self, sched: &mut SchedState<A>, cpu: CpuId, current: ThreadId, next: ThreadId) -> A::Switch {
        let idle_thread = sched.cpus[cpu].idle;
        let active_root = sched.cpus[cpu].active_root;

        let valid = sched.threads.get(next).is_some_and(|t| {
            (t.idle && next == idle_thread && t.running_on.is_none())
                || (!t.idle && t.state == ThreadState::Ready && t.running_on.is_none())
        });
        if !valid {
            self.fatal(sched, "picked thread is not ready");
        }

        let kernel_root = self.kernel_space.root();
        let Some((prev, incoming)) = sched.threads.get_pair_mut(current, next) else {
            self.fatal(sched, "switch between unknown threads");
        };

        if prev.extended_dirty {
            self.arch.save_extended(&mut prev.context);
            prev.extended_dirty = false;
            self.stats.extended_saves.fetch_add(1, Ordering::Relaxed);
        }

        incoming.state = ThreadState::Running;
        incoming.running_on = Some(cpu);
        incoming.queued = false;

        let mut new_root = None;
        if !incoming.idle && incoming.root != kernel_root && Some(incoming.root) != active_root {
            self.arch.switch_address_space(incoming.root);
            self.stats.address_space_switches.fetch_add(1, Ordering::Relaxed);
            new_root = Some(incoming.root);
        }

        let switch = unsafe { self.arch.prepare_switch(&mut prev.context, &mut incoming.context, cpu) };

        let state = &mut sched.cpus[cpu];
        state.prev = Some(current);
        state.current = next;
        if new_root.is_some() {
            state.active_root = new_root;
        }
        self.stats.context_switches.fetch_add(1, Ordering::Relaxed);
        switch
    }

    /// Complete the switch that brought the caller onto this CPU
    ///
    /// Runs on the incoming thread, first thing after the transfer.
    pub(crate) fn finish_switch(&self) {
        let reaped = {
            let mut sched = self.sched.lock();
            let cpu = self.arch.current_cpu();
            let Some(prev) = sched.cpus[cpu].prev.take() else {
                return;
            };

            let state = match sched.threads.get_mut(prev) {
                Some(thread) => {
                    thread.running_on = None;
                    (thread.state, thread.idle)
                }
                None => return,
            };

            match state {
                (ThreadState::Ready, false) => {
                    self.enqueue(&mut sched, prev);
                    None
                }
                (ThreadState::Zombie, _) => sched.threads.remove(prev),
                _ => None,
            }
        };

        // Stack and context go back outside the lock
        if let Some(thread) = reaped {
            log::trace!("Thread {} reclaimed", thread.id);
            drop(thread);
        }
    }

    /// Switch away from the current thread for good
    ///
    /// The thread becomes a zombie; the next thread on this CPU frees it.
    pub(crate) fn exit_final(&self) -> ! {
        let mut sched = self.sched.lock();
        let cpu = self.arch.current_cpu();
        let current = sched.cpus[cpu].current;

        match sched.threads.get_mut(current) {
            Some(thread) if !thread.idle => {
                thread.state = ThreadState::Zombie;
                thread.wait = None;
                thread.extended_dirty = false;
            }
            _ => self.fatal(&sched, "idle thread exited"),
        }
        sched.live -= 1;

        let next = match sched.run_queue.pop() {
            Some(tid) => tid,
            None => sched.cpus[cpu].idle,
        };
        let switch = self.prepare(&mut sched, cpu, current, next);
        drop(sched);

        log::trace!("CPU {} final switch {} -> {}", cpu, current, next);
        unsafe { self.arch.switch_final(switch) }
    }

    /// Reschedule if this CPU was flagged
    ///
    /// Idle threads only switch from their idle loop.
    pub(crate) fn preempt(&self) {
        let sched = self.sched.lock();
        let cpu = self.arch.current_cpu();
        let Some(cpu_state) = sched.cpus.get(cpu) else {
            return;
        };
        let idle = sched.threads.get(cpu_state.current).map_or(true, |t| t.idle);
        if cpu_state.need_resched && !idle {
            self.reschedule_locked(sched, Mode::Preempt);
        }
    }

    /// Timer tick on the current CPU
    ///
    /// CPU 0 advances global time and expires timed waits; every CPU charges
    /// its current thread.
    pub fn tick(&self) {
        let cpu = self.arch.current_cpu();
        let mut sched = self.sched.lock();

        if cpu == 0 {
            let now = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
            for node in sched.sleepers.pop_expired(now) {
                self.wake_locked(&mut sched, node.thread, node.token, WakeReason::TimedOut);
            }
        }

        let current = sched.cpus[cpu].current;
        let best = sched.run_queue.best_priority();
        let mut expired = false;
        if let Some(thread) = sched.threads.get_mut(current) {
            if !thread.idle {
                thread.cpu_time += 1;
                thread.quantum = thread.quantum.saturating_sub(1);
                expired = thread.quantum == 0 && best.is_some_and(|p| p <= thread.priority);
            }
        }
        if expired {
            sched.cpus[cpu].need_resched = true;
        }
    }

    /// Timer interrupt: tick, then preempt if the quantum ran out
    pub fn timer_interrupt(&self) {
        self.tick();
        self.preempt();
    }

    /// Give the CPU to a queued thread of the same or a more urgent class
    pub fn yield_now(&self) {
        let sched = self.sched.lock();
        let cpu = self.arch.current_cpu();
        if sched.threads.get(sched.current(cpu)).is_some_and(|t| t.idle) {
            return;
        }
        self.reschedule_locked(sched, Mode::Yield);
    }

    /// Block the current thread for `duration`
    ///
    /// Signals end the sleep early with `Interrupted`.
    pub fn sleep(&self, duration: Duration) -> KernelResult<()> {
        let ticks = self.config.duration_to_ticks(duration);
        if ticks == 0 {
            self.yield_now();
            return Ok(());
        }

        let deadline = self.now().saturating_add(ticks);
        let token = self.prepare_wait(WaitObject::Sleep, true, Some(deadline))?;
        match Blocker::wait(self, token) {
            WakeReason::TimedOut | WakeReason::Granted => Ok(()),
            reason => reason.into_result(),
        }
    }

    /// Idle loop of the current CPU; returns once the kernel halts
    pub(crate) fn idle_loop(&self) {
        let cpu = self.arch.current_cpu();
        let mut quiet: u64 = 0;
        let mut last_switches = self.stats.context_switches.load(Ordering::Relaxed);

        loop {
            if self.halted.load(Ordering::Acquire) {
                return;
            }
            self.reschedule(Mode::Idle);

            if cpu == 0 && self.sched.lock().live == 0 {
                self.halt();
                return;
            }

            if self.arch.idle() {
                self.tick();
            }

            if cpu == 0 {
                if let Some(limit) = self.arch.watchdog_limit() {
                    let switches = self.stats.context_switches.load(Ordering::Relaxed);
                    if switches != last_switches {
                        last_switches = switches;
                        quiet = 0;
                    } else {
                        quiet += 1;
                        if quiet > limit {
                            let sched = self.sched.lock();
                            self.fatal(&sched, "idle watchdog expired: every thread is blocked");
                        }
                    }
                }
            }
        }
    }

    /// Wake a waiting thread with the scheduler lock held
    pub(crate) fn wake_locked(
        &self,
        sched: &mut SchedState<A>,
        tid: ThreadId,
        token: WaitToken,
        reason: WakeReason,
    ) -> bool {
        let Some(thread) = sched.threads.get_mut(tid) else {
            return false;
        };
        let matches = thread.wait.is_some_and(|w| w.token == token);
        if !matches || thread.wake_reason.is_some() || thread.state != ThreadState::Waiting {
            return false;
        }

        thread.wake_reason = Some(reason);
        log::trace!("Thread {} woken: {:?}", tid, reason);
        self.make_ready(sched, tid);
        true
    }

    /// End an interruptible wait because a signal arrived
    pub(crate) fn interrupt_wait(&self, sched: &mut SchedState<A>, tid: ThreadId) {
        let wait = sched
            .threads
            .get(tid)
            .and_then(|t| t.wait)
            .filter(|w| w.interruptible);
        if let Some(wait) = wait {
            self.wake_locked(sched, tid, wait.token, WakeReason::Interrupted);
        }
    }

    /// Log the scheduler state and panic
    pub(crate) fn fatal(&self, sched: &SchedState<A>, reason: &str) -> ! {
        log::error!("FATAL: {}", reason);
        log::error!("tick {}, {} live threads, {} queued", self.now(), sched.live, sched.run_queue.len());
        for (cpu, state) in sched.cpus.iter().enumerate() {
            log::error!(
                "  cpu {}: current {} idle {} prev {:?} resched {}",
                cpu,
                state.current,
                state.idle,
                state.prev,
                state.need_resched
            );
        }
        for (tid, thread) in sched.threads.iter() {
            log::error!(
                "  thread {} {:?} {:?} prio {} on {:?} queued {} wait {:?}",
                tid,
                thread.name,
                thread.state,
                thread.priority.value(),
                thread.running_on,
                thread.queued,
                thread.wait.map(|w| w.on)
            );
        }
        panic!("scheduler invariant violated: {}", reason);
    }
}

impl<A: Arch> Blocker for Kernel<A> {
    fn current(&self) -> ThreadId {
        self.current_thread()
    }

    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    fn prepare_wait(
        &self,
        on: WaitObject,
        interruptible: bool,
        deadline: Option<u64>,
    ) -> KernelResult<WaitToken> {
        let mut sched = self.sched.lock();
        let cpu = self.arch.current_cpu();
        let tid = sched.current(cpu);

        let token = WaitToken(sched.next_token);
        let thread = sched.threads.get_mut(tid).ok_or(KernelError::InvalidHandle)?;
        if thread.idle {
            return Err(KernelError::WouldBlock);
        }
        if interruptible && thread.signals.is_pending() {
            return Err(KernelError::Interrupted);
        }

        thread.state = ThreadState::Waiting;
        thread.wait = Some(WaitInfo { token, on, interruptible });
        thread.wake_reason = None;
        sched.next_token += 1;

        if deadline.is_some() {
            sched
                .sleepers
                .insert_by_deadline(WaitNode::new(tid, token).with_deadline(deadline));
        }
        Ok(token)
    }

    fn wait(&self, token: WaitToken) -> WakeReason {
        loop {
            let mut sched = self.sched.lock();
            let cpu = self.arch.current_cpu();
            let tid = sched.current(cpu);

            let reason = match sched.threads.get_mut(tid) {
                Some(thread) if thread.wait.is_some_and(|w| w.token == token) => {
                    let reason = thread.wake_reason.take();
                    if reason.is_some() {
                        thread.wait = None;
                        thread.state = ThreadState::Running;
                    }
                    Ok(reason)
                }
                _ => Err(()),
            };

            let Ok(reason) = reason else {
                self.fatal(&sched, "wait on a token the thread does not hold");
            };
            if let Some(reason) = reason {
                sched.sleepers.remove(token);
                return reason;
            }
            self.reschedule_locked(sched, Mode::Block);
        }
    }

    fn wake(&self, thread: ThreadId, token: WaitToken, reason: WakeReason) -> bool {
        let mut sched = self.sched.lock();
        self.wake_locked(&mut sched, thread, token, reason)
    }
}
