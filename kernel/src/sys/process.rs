//! Process Management
//!
//! A process is a protection domain with:
//! - One memory context, behind a sleeping mutex
//! - One I/O context (owned by the VFS, opaque here)
//! - One lock namespace
//! - One or more threads
//!
//! Process 0 is the kernel itself. It owns the kernel half of the address
//! space, adopts orphans and never exits.
//!
//! A process that lost its last thread stays in the table as a zombie
//! until its parent collects it with [`Kernel::wait`]. Children of the
//! kernel process, and children of a parent ignoring `SIGCHLD`, are
//! reaped as soon as they exit.

use super::signal::{Signal, SignalState};
use super::thread::{KernelStack, NewThread, Priority, ThreadId};
use super::Kernel;
use crate::arch::{Arch, TrapFrame};
use crate::mm::{Backing, MemoryContext, MemoryUsage, PhysAddr, RegionFlags, RegionId, VirtAddr};
use crate::sync::{
    Blocker, IrqSpinLock, LockFlags, LockNamespace, SleepMutex, WaitNode, WaitObject, WaitQueue,
    WakeReason,
};
use crate::{KernelError, KernelResult};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::Ordering;

crate::table_key!(
    /// Process ID
    ProcessId
);

/// The kernel process
pub const KERNEL_PID: ProcessId = ProcessId(0);

/// Per-process I/O state (open files, working directory)
///
/// Owned by the VFS; the core only duplicates it on fork.
pub trait IoContext: Send + Sync {
    /// Copy for a forked child
    fn fork(&self) -> KernelResult<Arc<dyn IoContext>>;
}

/// I/O context with nothing in it
#[derive(Debug, Default)]
pub struct NullIo;

impl IoContext for NullIo {
    fn fork(&self) -> KernelResult<Arc<dyn IoContext>> {
        Ok(Arc::new(NullIo))
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Last thread exited with a code
    Exited(i32),
    /// Terminated by a signal
    Signaled(Signal),
}

impl ExitStatus {
    /// Status word in the usual `wait` encoding
    pub fn to_raw(self) -> u32 {
        match self {
            ExitStatus::Exited(code) => (code as u32 & 0xff) << 8,
            ExitStatus::Signaled(signal) => signal.number() & 0x7f,
        }
    }

    /// Decode a status word
    pub fn from_raw(raw: u32) -> KernelResult<Self> {
        match raw & 0x7f {
            0 => Ok(ExitStatus::Exited(((raw >> 8) & 0xff) as u8 as i8 as i32)),
            sig => Ok(ExitStatus::Signaled(Signal::new(sig)?)),
        }
    }
}

bitflags! {
    /// Options of [`Kernel::wait`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WaitOptions: u32 {
        /// Return immediately when no child has exited
        const NOHANG = 1 << 0;
    }
}

/// Which children [`Kernel::wait`] collects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    /// Any child
    Any,
    /// One child
    Process(ProcessId),
}

/// Program break state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Heap {
    pub region: RegionId,
    pub start: VirtAddr,
    pub brk: VirtAddr,
}

/// State guarded by the memory mutex
pub(crate) struct ProcessMemory {
    pub context: MemoryContext,
    pub heap: Option<Heap>,
}

/// Bookkeeping guarded by the process spinlock
pub(crate) struct ProcessState {
    pub parent: Option<ProcessId>,
    pub children: Vec<Arc<Process>>,
    pub threads: Vec<ThreadId>,
    pub exit: Option<ExitStatus>,
    /// Last thread gone, teardown in progress or done
    pub exiting: bool,
    pub child_waiters: WaitQueue,
    /// `SIGCHLD` explicitly ignored: children are reaped on exit
    pub reap_children: bool,
}

/// Process structure
pub struct Process {
    id: ProcessId,
    name: String,
    root: PhysAddr,
    pub(crate) memory: SleepMutex<ProcessMemory>,
    io: Arc<dyn IoContext>,
    pub(crate) locks: IrqSpinLock<LockNamespace>,
    pub(crate) state: IrqSpinLock<ProcessState>,
}

impl Process {
    fn new(
        id: ProcessId,
        name: &str,
        parent: Option<ProcessId>,
        context: MemoryContext,
        io: Arc<dyn IoContext>,
        locks: LockNamespace,
    ) -> Self {
        Self {
            id,
            name: String::from(name),
            root: context.root(),
            memory: SleepMutex::new(ProcessMemory { context, heap: None }),
            io,
            locks: IrqSpinLock::new(locks),
            state: IrqSpinLock::new(ProcessState {
                parent,
                children: Vec::new(),
                threads: Vec::new(),
                exit: None,
                exiting: false,
                child_waiters: WaitQueue::new(),
                reap_children: false,
            }),
        }
    }

    /// Process ID
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Page-table root of the memory context
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// I/O context
    pub fn io(&self) -> &Arc<dyn IoContext> {
        &self.io
    }

    /// Live threads
    pub fn threads(&self) -> Vec<ThreadId> {
        self.state.lock().threads.clone()
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        log::debug!("Process {} ({}) reclaimed", self.id, self.name);
    }
}

/// Snapshot of a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Process ID
    pub id: ProcessId,
    /// Name
    pub name: String,
    /// Parent process
    pub parent: Option<ProcessId>,
    /// Live threads
    pub threads: usize,
    /// Children not yet reaped
    pub children: Vec<ProcessId>,
    /// Exit status once a zombie
    pub exit: Option<ExitStatus>,
    /// Memory counters of the user half
    pub memory: MemoryUsage,
}

/// Removes a half-built child again unless disarmed
struct ProcessGuard<'a, A: Arch> {
    kernel: &'a Kernel<A>,
    parent: Arc<Process>,
    child: ProcessId,
    armed: bool,
}

impl<A: Arch> ProcessGuard<'_, A> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<A: Arch> Drop for ProcessGuard<'_, A> {
    fn drop(&mut self) {
        if self.armed {
            let child = self.child;
            self.parent.state.lock().children.retain(|c| c.id() != child);
            self.kernel.processes.lock().remove(child);
            log::debug!("Process {} creation unwound", child);
        }
    }
}

impl<A: Arch> Kernel<A> {
    /// Look up a process
    pub fn process(&self, pid: ProcessId) -> KernelResult<Arc<Process>> {
        self.processes.lock().get(pid).cloned().ok_or(KernelError::InvalidHandle)
    }

    /// Process of the calling thread
    pub fn current_process(&self) -> ProcessId {
        let sched = self.sched.lock();
        let tid = sched.current(self.arch.current_cpu());
        sched.threads.get(tid).map_or(KERNEL_PID, |t| t.process)
    }

    pub(crate) fn current_process_ref(&self) -> KernelResult<Arc<Process>> {
        self.process(self.current_process())
    }

    /// Add a process to the table and to its parent's children
    pub(crate) fn insert_process(
        &self,
        name: &str,
        parent: Option<&Arc<Process>>,
        context: MemoryContext,
        io: Arc<dyn IoContext>,
        locks: LockNamespace,
    ) -> KernelResult<Arc<Process>> {
        let parent_id = parent.map(|p| p.id());
        let process = {
            let mut table = self.processes.lock();
            let pid = table.insert_with(|id| {
                Ok(Arc::new(Process::new(id, name, parent_id, context, io, locks)))
            })?;
            table.get(pid).cloned().ok_or(KernelError::InvalidHandle)?
        };

        if let Some(parent) = parent {
            parent.state.lock().children.push(process.clone());
        }
        Ok(process)
    }

    /// Create a process with an empty address space and one thread
    ///
    /// The new process is a child of the caller's process and starts at
    /// `entry(arg)` on a fresh user stack.
    pub fn spawn_process(&self, name: &str, entry: A::Entry, arg: usize) -> KernelResult<ProcessId> {
        let parent = self.current_process_ref()?;
        let context = MemoryContext::new_user(&self.pool, &self.kernel_space)?;
        let io = parent.io.fork()?;
        let locks = LockNamespace::new(self.config.limits.max_locks);

        let child = self.insert_process(name, Some(&parent), context, io, locks)?;
        let guard = ProcessGuard { kernel: self, parent, child: child.id(), armed: true };

        let (region, top) = {
            let mut memory = child.memory.lock(self);
            let region = memory.context.create_region(
                self.region_ids.next(),
                "stack",
                None,
                self.config.user_stack_size,
                RegionFlags::USER_STACK,
                Backing::Anonymous,
            )?;
            (region.id(), region.end())
        };

        let priority = Priority::new(self.config.default_priority)?;
        let stack = KernelStack::new(&self.pool, self.config.kernel_stack_pages)?;
        let mut context = self.arch.new_context(entry, arg, &stack, self.hooks()?)?;
        self.arch.frame_mut(&mut context).set_sp(top.as_u64());

        self.insert_thread(
            &child,
            NewThread {
                name: String::from(name),
                priority,
                context,
                stack,
                signals: SignalState::new(),
                user_stack: Some(region),
            },
        )?;

        guard.disarm();
        log::info!("Process {} ({}) spawned", child.id(), name);
        Ok(child.id())
    }

    /// Duplicate the calling process
    ///
    /// The child gets a copy of the memory context, I/O context and lock
    /// namespace, and one thread with the caller's user frame, priority,
    /// signal actions and mask. The child thread starts in the kernel at
    /// `child_entry(arg)` and sees 0 as the return value of its frame.
    /// Any failure unwinds everything built so far.
    pub fn fork(&self, child_entry: A::Entry, arg: usize) -> KernelResult<ProcessId> {
        let parent = self.current_process_ref()?;
        if parent.id() == KERNEL_PID {
            return Err(KernelError::InvalidArgument);
        }
        let parent_tid = self.current_thread();

        let (name, priority, signals, stack_region) = {
            let sched = self.sched.lock();
            let thread = sched.threads.get(parent_tid).ok_or(KernelError::InvalidHandle)?;
            (thread.name.clone(), thread.priority, thread.signals.fork_copy(), thread.user_stack)
        };

        let (context, heap, user_stack) = {
            let memory = parent.memory.lock(self);
            let context = memory.context.fork(&self.region_ids)?;
            let heap = memory.heap.and_then(|heap| {
                let region = context.find_region(heap.start)?;
                Some(Heap { region: region.id(), ..heap })
            });
            let user_stack = stack_region
                .and_then(|id| memory.context.region(id))
                .and_then(|region| context.find_region(region.start()))
                .map(|region| region.id());
            (context, heap, user_stack)
        };

        let io = parent.io.fork()?;
        let locks = parent.locks.lock().fork()?;

        let child = self.insert_process(parent.name(), Some(&parent), context, io, locks)?;
        let guard = ProcessGuard { kernel: self, parent: parent.clone(), child: child.id(), armed: true };
        child.memory.lock(self).heap = heap;

        let stack = KernelStack::new(&self.pool, self.config.kernel_stack_pages)?;
        let hooks = self.hooks()?;
        let context = {
            let mut sched = self.sched.lock();
            let thread = sched.threads.get_mut(parent_tid).ok_or(KernelError::InvalidHandle)?;
            if thread.extended_dirty {
                self.arch.save_extended(&mut thread.context);
                self.stats.extended_saves.fetch_add(1, Ordering::Relaxed);
            }
            let mut context = self.arch.fork_context(&thread.context, child_entry, arg, &stack, hooks)?;
            self.arch.frame_mut(&mut context).set_return_value(0);
            context
        };

        self.insert_thread(
            &child,
            NewThread { name, priority, context, stack, signals, user_stack },
        )?;

        guard.disarm();
        log::info!("Process {} forked from {}", child.id(), parent.id());
        Ok(child.id())
    }

    /// Wait for a child to exit and reap it
    ///
    /// Returns `None` with [`WaitOptions::NOHANG`] when no matching child
    /// has exited yet.
    pub fn wait(
        &self,
        target: WaitTarget,
        options: WaitOptions,
    ) -> KernelResult<Option<(ProcessId, ExitStatus)>> {
        let me = self.current_process_ref()?;
        let tid = self.current_thread();
        let matches = |child: &Arc<Process>| match target {
            WaitTarget::Any => true,
            WaitTarget::Process(pid) => child.id() == pid,
        };

        loop {
            let mut state = me.state.lock();
            if !state.children.iter().any(&matches) {
                return Err(KernelError::NoChildren);
            }

            let found = state.children.iter().position(|child| {
                matches(child) && child.state.lock().exit.is_some()
            });

            if let Some(index) = found {
                let child = state.children.remove(index);
                drop(state);

                let status = child.state.lock().exit.ok_or(KernelError::InvalidHandle)?;
                self.processes.lock().remove(child.id());
                log::debug!("Process {} reaped by {}", child.id(), me.id());
                return Ok(Some((child.id(), status)));
            }

            if options.contains(WaitOptions::NOHANG) {
                return Ok(None);
            }

            let token = self.prepare_wait(WaitObject::Child, true, None)?;
            state.child_waiters.push_back(WaitNode::new(tid, token));
            drop(state);

            let reason = Blocker::wait(self, token);
            me.state.lock().child_waiters.remove(token);
            if reason == WakeReason::Interrupted {
                return Err(KernelError::Interrupted);
            }
        }
    }

    /// Snapshot of one process
    pub fn process_info(&self, pid: ProcessId) -> KernelResult<ProcessInfo> {
        let process = self.process(pid)?;
        let memory = process.memory.lock(self).context.usage();
        let state = process.state.lock();
        Ok(ProcessInfo {
            id: process.id,
            name: process.name.clone(),
            parent: state.parent,
            threads: state.threads.len(),
            children: state.children.iter().map(|c| c.id()).collect(),
            exit: state.exit,
            memory,
        })
    }

    /// Snapshots of every process
    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        let pids: Vec<ProcessId> = self.processes.lock().iter().map(|(pid, _)| pid).collect();
        pids.into_iter().filter_map(|pid| self.process_info(pid).ok()).collect()
    }

    /// Drop the user address space and handlers for a new program image
    ///
    /// Only a single-threaded user process may do this.
    pub fn exec_reset(&self) -> KernelResult<()> {
        let process = self.current_process_ref()?;
        if process.id() == KERNEL_PID {
            return Err(KernelError::InvalidArgument);
        }
        if process.state.lock().threads.len() > 1 {
            return Err(KernelError::Busy);
        }

        {
            let mut memory = process.memory.lock(self);
            memory.heap = None;
            memory.context.release_user_regions();
        }

        let mut sched = self.sched.lock();
        let tid = sched.current(self.arch.current_cpu());
        if let Some(thread) = sched.threads.get_mut(tid) {
            thread.user_stack = None;
            thread.signals.exec_reset();
        }
        log::debug!("Process {} reset for exec", process.id());
        Ok(())
    }

    /// Terminate the calling thread with `status`
    pub(crate) fn exit_with(&self, status: ExitStatus) -> ! {
        self.release_current(status);
        self.exit_final()
    }

    /// Detach the calling thread from its process, tearing the process
    /// down when it was the last thread
    fn release_current(&self, status: ExitStatus) {
        let (tid, pid, user_stack) = {
            let mut sched = self.sched.lock();
            let tid = sched.current(self.arch.current_cpu());
            match sched.threads.get_mut(tid) {
                Some(thread) if !thread.idle => (tid, thread.process, thread.user_stack.take()),
                _ => self.fatal(&sched, "idle thread exited"),
            }
        };

        let Ok(process) = self.process(pid) else {
            return;
        };

        let last = {
            let mut state = process.state.lock();
            state.threads.retain(|&t| t != tid);
            let last = state.threads.is_empty() && pid != KERNEL_PID;
            if last {
                state.exiting = true;
            }
            last
        };

        if last {
            log::info!("Process {} ({}) exited: {:?}", pid, process.name(), status);
            self.teardown(&process, status);
        } else if let Some(region) = user_stack {
            match process.memory.lock(self).context.remove_region(region) {
                Ok(_) | Err(KernelError::InvalidHandle) => {}
                Err(err) => log::warn!("Thread {} stack region {} not released: {}", tid, region, err),
            }
        }
        log::debug!("Thread {} exited", tid);
    }

    /// Release everything a dead process holds and notify its parent
    fn teardown(&self, process: &Arc<Process>, status: ExitStatus) {
        let pid = process.id();
        {
            let mut memory = process.memory.lock(self);
            memory.heap = None;
            memory.context.release_user_regions();
        }

        let locks = process.locks.lock().drain();
        for lock in locks {
            if !lock.flags().contains(LockFlags::SHARED) {
                lock.destroy(self);
            }
        }

        let (parent, children) = {
            let mut state = process.state.lock();
            state.exit = Some(status);
            (state.parent, core::mem::take(&mut state.children))
        };

        if !children.is_empty() {
            self.adopt_orphans(children);
        }

        let Some(parent) = parent.and_then(|ppid| self.process(ppid).ok()) else {
            self.processes.lock().remove(pid);
            return;
        };

        let (auto_reap, waiters) = {
            let mut state = parent.state.lock();
            let auto_reap = parent.id() == KERNEL_PID || state.reap_children;
            if auto_reap {
                state.children.retain(|c| c.id() != pid);
            }
            (auto_reap, state.child_waiters.drain())
        };

        if auto_reap {
            self.processes.lock().remove(pid);
            log::debug!("Process {} reaped automatically", pid);
        } else {
            match self.kill(parent.id(), Signal::SIGCHLD) {
                Ok(()) | Err(KernelError::InvalidHandle) => {}
                Err(err) => log::warn!("SIGCHLD to process {} failed: {}", parent.id(), err),
            }
        }

        for node in waiters {
            self.wake(node.thread, node.token, WakeReason::Granted);
        }
    }

    /// Re-parent children of a dead process to the kernel process
    fn adopt_orphans(&self, children: Vec<Arc<Process>>) {
        let Ok(kernel) = self.process(KERNEL_PID) else {
            return;
        };

        let mut zombies = Vec::new();
        {
            let mut state = kernel.state.lock();
            for child in children {
                let zombie = {
                    let mut child_state = child.state.lock();
                    child_state.parent = Some(KERNEL_PID);
                    child_state.exit.is_some()
                };
                if zombie {
                    zombies.push(child.id());
                } else {
                    state.children.push(child);
                }
            }
        }

        let mut table = self.processes.lock();
        for pid in zombies {
            table.remove(pid);
        }
    }
}
