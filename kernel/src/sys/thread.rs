//! Thread Management
//!
//! A thread is the unit of scheduling:
//! - Saved architecture context (boxed, so its address is stable)
//! - Kernel stack, freed only after the scheduler switched off it for good
//! - Belongs to a process (by id)
//! - Priority class and remaining quantum
//! - Signal state
//!
//! # States
//!
//! ```text
//!  New ──▶ Ready ◀──▶ Running ──▶ Zombie
//!            ▲           │
//!            └─ Waiting ◀┘
//! ```

use super::process::{Process, ProcessId, KERNEL_PID};
use super::signal::{SigSet, SignalState};
use super::Kernel;
use crate::arch::{Arch, CpuId, TrapFrame};
use crate::mm::{Backing, FramePool, FrameRun, PhysAddr, RegionFlags, RegionId, VirtAddr};
use crate::sync::{WaitObject, WaitToken, WakeReason};
use crate::{KernelError, KernelResult};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

crate::table_key!(
    /// Thread ID
    ThreadId
);

/// Number of priority classes
pub const NUM_PRIORITIES: usize = 32;

/// Priority class, 0 highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// Most urgent class
    pub const HIGHEST: Priority = Priority(0);
    /// Class of ordinary threads
    pub const NORMAL: Priority = Priority(16);
    /// Least urgent class
    pub const LOWEST: Priority = Priority(NUM_PRIORITIES as u8 - 1);

    /// Validate a priority class
    pub fn new(value: u8) -> KernelResult<Self> {
        if value as usize >= NUM_PRIORITIES {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Priority(value))
    }

    /// Raw class
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Queue index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, not yet runnable
    New,
    /// Runnable, waiting for a CPU
    Ready,
    /// Executing on a CPU
    Running,
    /// Blocked on a wait
    Waiting,
    /// Exited, reclaimed after the final switch
    Zombie,
}

/// Physically contiguous kernel stack
pub struct KernelStack {
    frames: FrameRun,
}

impl KernelStack {
    /// Allocate a stack of `pages` pages
    pub fn new(pool: &Arc<FramePool>, pages: usize) -> KernelResult<Self> {
        Ok(Self { frames: pool.allocate_run(pages)? })
    }

    /// Lowest physical address
    pub fn base(&self) -> PhysAddr {
        self.frames.start()
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.frames.size()
    }

    /// One past the highest physical address
    pub fn top(&self) -> PhysAddr {
        self.frames.start().offset(self.frames.size() as u64)
    }
}

impl core::fmt::Debug for KernelStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KernelStack({:#x}, {} bytes)", self.base().as_u64(), self.size())
    }
}

/// The wait a thread is blocked in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaitInfo {
    pub token: WaitToken,
    pub on: WaitObject,
    pub interruptible: bool,
}

/// Thread control block
pub(crate) struct Thread<A: Arch> {
    pub id: ThreadId,
    pub name: String,
    pub process: ProcessId,
    pub priority: Priority,
    pub state: ThreadState,
    pub context: Box<A::Context>,
    /// Owned until the thread is freed; None for the boot flow, which runs
    /// on the loader's stack
    pub _stack: Option<KernelStack>,
    pub signals: SignalState<A::Frame>,
    pub wait: Option<WaitInfo>,
    pub wake_reason: Option<WakeReason>,
    pub quantum: u32,
    pub cpu_time: u64,
    /// CPU the thread is on, until the switch off it completes
    pub running_on: Option<CpuId>,
    pub queued: bool,
    pub idle: bool,
    /// Page-table root of the owning process
    pub root: PhysAddr,
    /// Extended registers modified since last saved
    pub extended_dirty: bool,
    pub user_stack: Option<RegionId>,
}

impl<A: Arch> Thread<A> {
    pub fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.id,
            name: self.name.clone(),
            process: self.process,
            priority: self.priority,
            state: self.state,
            cpu_time: self.cpu_time,
            waiting_on: self.wait.map(|w| w.on),
            pending: self.signals.pending(),
            blocked: self.signals.blocked(),
            user_stack: self.user_stack,
        }
    }
}

/// Snapshot of a thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Thread ID
    pub id: ThreadId,
    /// Name
    pub name: String,
    /// Owning process
    pub process: ProcessId,
    /// Priority class
    pub priority: Priority,
    /// State
    pub state: ThreadState,
    /// Ticks spent running
    pub cpu_time: u64,
    /// Object the thread is blocked on
    pub waiting_on: Option<WaitObject>,
    /// Pending signals
    pub pending: SigSet,
    /// Blocked signals
    pub blocked: SigSet,
    /// User stack region
    pub user_stack: Option<RegionId>,
}

/// Everything a new thread is built from
pub(crate) struct NewThread<A: Arch> {
    pub name: String,
    pub priority: Priority,
    pub context: A::Context,
    pub stack: KernelStack,
    pub signals: SignalState<A::Frame>,
    pub user_stack: Option<RegionId>,
}

impl<A: Arch> Kernel<A> {
    /// Create a thread in the current process
    ///
    /// User processes get a stack region of `stack_size` bytes (the
    /// configured default when zero); the new thread's stack pointer starts
    /// at its top. Threads of the kernel process run on their kernel stack
    /// only.
    pub fn create_thread(
        &self,
        name: &str,
        entry: A::Entry,
        arg: usize,
        priority: Priority,
        stack_size: usize,
    ) -> KernelResult<ThreadId> {
        let process = self.current_process_ref()?;
        if process.id() == KERNEL_PID {
            return self.create_kernel_thread(name, entry, arg, priority);
        }

        let stack_size = match stack_size {
            0 => self.config.user_stack_size,
            size => crate::mm::page_align_up(size),
        };

        let (region, top) = {
            let mut memory = process.memory.lock(self);
            let region = memory.context.create_region(
                self.region_ids.next(),
                name,
                None,
                stack_size,
                RegionFlags::USER_STACK,
                Backing::Anonymous,
            )?;
            (region.id(), region.end())
        };

        let result = self.build_thread(&process, name, priority, Some(region), |kernel, stack, hooks| {
            let mut context = kernel.arch.new_context(entry, arg, stack, hooks)?;
            kernel.arch.frame_mut(&mut context).set_sp(top.as_u64());
            Ok(context)
        });

        if result.is_err() {
            match process.memory.lock(self).context.remove_region(region) {
                Ok(_) | Err(KernelError::InvalidHandle) => {}
                Err(err) => log::warn!("Stack region {} not released: {}", region, err),
            }
        }
        result
    }

    /// Create a thread of the kernel process
    pub fn create_kernel_thread(
        &self,
        name: &str,
        entry: A::Entry,
        arg: usize,
        priority: Priority,
    ) -> KernelResult<ThreadId> {
        let process = self.process(KERNEL_PID)?;
        self.build_thread(&process, name, priority, None, |kernel, stack, hooks| {
            kernel.arch.new_context(entry, arg, stack, hooks)
        })
    }

    /// Allocate a kernel stack, build the context and schedule the thread
    pub(crate) fn build_thread<F>(
        &self,
        process: &Arc<Process>,
        name: &str,
        priority: Priority,
        user_stack: Option<RegionId>,
        build: F,
    ) -> KernelResult<ThreadId>
    where
        F: FnOnce(&Self, &KernelStack, Arc<dyn crate::arch::KernelEntry>) -> KernelResult<A::Context>,
    {
        let stack = KernelStack::new(&self.pool, self.config.kernel_stack_pages)?;
        let context = build(self, &stack, self.hooks()?)?;
        let signals = self.current_signals_for_child();

        self.insert_thread(
            process,
            NewThread {
                name: String::from(name),
                priority,
                context,
                stack,
                signals,
                user_stack,
            },
        )
    }

    /// Signal state a new thread inherits from its creator
    fn current_signals_for_child(&self) -> SignalState<A::Frame> {
        let sched = self.sched.lock();
        let tid = sched.current(self.arch.current_cpu());
        match sched.threads.get(tid) {
            Some(thread) if !thread.idle => thread.signals.fork_copy(),
            _ => SignalState::new(),
        }
    }

    /// Register a built thread with its process and make it ready
    pub(crate) fn insert_thread(&self, process: &Arc<Process>, new: NewThread<A>) -> KernelResult<ThreadId> {
        let mut state = process.state.lock();
        if state.exiting {
            return Err(KernelError::InvalidHandle);
        }

        let tid = {
            let mut sched = self.sched.lock();
            let quantum = self.config.quantum_ticks;
            let tid = sched.threads.insert_with(|id| {
                Ok(Thread {
                    id,
                    name: new.name,
                    process: process.id(),
                    priority: new.priority,
                    state: ThreadState::New,
                    context: Box::new(new.context),
                    _stack: Some(new.stack),
                    signals: new.signals,
                    wait: None,
                    wake_reason: None,
                    quantum,
                    cpu_time: 0,
                    running_on: None,
                    queued: false,
                    idle: false,
                    root: process.root(),
                    extended_dirty: false,
                    user_stack: new.user_stack,
                })
            })?;
            sched.live += 1;
            self.make_ready(&mut sched, tid);
            tid
        };

        state.threads.push(tid);
        drop(state);

        log::debug!("Thread {} created in process {}", tid, process.id());
        self.preempt();
        Ok(tid)
    }

    /// Snapshot of one thread
    pub fn thread_info(&self, tid: ThreadId) -> KernelResult<ThreadInfo> {
        let sched = self.sched.lock();
        sched.threads.get(tid).map(Thread::info).ok_or(KernelError::InvalidHandle)
    }

    /// Snapshots of every thread, idle threads excluded
    pub fn list_threads(&self) -> Vec<ThreadInfo> {
        let sched = self.sched.lock();
        sched
            .threads
            .iter()
            .filter(|(_, t)| !t.idle)
            .map(|(_, t)| t.info())
            .collect()
    }

    /// Thread executing the caller
    pub fn current_thread(&self) -> ThreadId {
        self.sched.lock().current(self.arch.current_cpu())
    }

    /// Terminate the calling thread
    ///
    /// The last thread of a process takes the process down with it.
    pub fn exit(&self, code: i32) -> ! {
        self.exit_with(super::ExitStatus::Exited(code))
    }

    /// Simulated device-not-available trap: the current thread touches its
    /// extended registers
    ///
    /// Loads them into the CPU and marks them dirty so the next switch off
    /// the thread saves them.
    pub fn extended_state_trap(&self) {
        let mut sched = self.sched.lock();
        let tid = sched.current(self.arch.current_cpu());
        if let Some(thread) = sched.threads.get_mut(tid) {
            if !thread.extended_dirty {
                self.arch.load_extended(&mut thread.context);
                thread.extended_dirty = true;
                self.stats.extended_loads.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    /// Copy of a thread's saved user frame
    pub fn user_frame(&self, tid: ThreadId) -> KernelResult<A::Frame> {
        let sched = self.sched.lock();
        let thread = sched.threads.get(tid).ok_or(KernelError::InvalidHandle)?;
        Ok(self.arch.frame(&thread.context).clone())
    }

    /// Stack pointer a user thread starts with
    pub fn user_stack_top(&self, tid: ThreadId) -> KernelResult<VirtAddr> {
        let sched = self.sched.lock();
        let thread = sched.threads.get(tid).ok_or(KernelError::InvalidHandle)?;
        let sp = self.arch.frame(&thread.context).sp();
        Ok(VirtAddr::new(sp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bounds() {
        assert!(Priority::new(31).is_ok());
        assert_eq!(Priority::new(32), Err(KernelError::InvalidArgument));
        assert!(Priority::HIGHEST < Priority::NORMAL);
        assert_eq!(Priority::LOWEST.index(), NUM_PRIORITIES - 1);
    }
}
