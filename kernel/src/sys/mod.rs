//! Core Kernel Services
//!
//! Provides fundamental kernel services:
//! - Process management
//! - Thread management
//! - Scheduler
//! - Memory regions of the current process
//! - Locks and condition variables
//! - Signals
//! - System calls
//!
//! Everything hangs off one [`Kernel`] instance, created by
//! [`Kernel::boot`]. The flow that calls `boot` becomes the idle thread of
//! CPU 0 and hands the CPU to the scheduler with [`Kernel::run`].

pub mod locks;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod signal;
pub mod syscall;
pub mod thread;

pub use process::{
    ExitStatus, IoContext, NullIo, Process, ProcessId, ProcessInfo, WaitOptions, WaitTarget, KERNEL_PID,
};
pub use scheduler::RunQueue;
pub use signal::{SigAction, SigActionFlags, SigHandler, SigHow, SigSet, Signal};
pub use syscall::Syscall;
pub use thread::{KernelStack, Priority, ThreadId, ThreadInfo, ThreadState, NUM_PRIORITIES};

use crate::arch::{Arch, KernelEntry};
use crate::config::KernelConfig;
use crate::mm::context::KernelSpace;
use crate::mm::region::RegionIds;
use crate::mm::{AddressLayout, FramePool, MemoryContext, PhysAddr};
use crate::sync::{IrqSpinLock, LockNamespace};
use crate::table::IdTable;
use crate::{KernelError, KernelResult};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use scheduler::{Counters, CpuState, SchedState};
use serde::Serialize;
use signal::SignalState;
use thread::Thread;

/// Kernel instance
pub struct Kernel<A: Arch> {
    this: Weak<Self>,
    pub(crate) arch: A,
    pub(crate) config: KernelConfig,
    pub(crate) pool: Arc<FramePool>,
    pub(crate) kernel_space: KernelSpace,
    pub(crate) region_ids: RegionIds,
    pub(crate) processes: IrqSpinLock<IdTable<ProcessId, Arc<Process>>>,
    pub(crate) sched: IrqSpinLock<SchedState<A>>,
    pub(crate) ticks: AtomicU64,
    pub(crate) halted: AtomicBool,
    pub(crate) stats: Counters,
}

/// Kernel-wide counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct KernelStats {
    /// Timer ticks since boot
    pub ticks: u64,
    /// Context switches on all CPUs
    pub context_switches: u64,
    /// Page-table root loads
    pub address_space_switches: u64,
    /// Extended register saves
    pub extended_saves: u64,
    /// Extended register loads (lazy traps)
    pub extended_loads: u64,
    /// Threads that are neither idle nor exited
    pub threads: usize,
    /// Processes, zombies included
    pub processes: usize,
    /// Unallocated physical frames
    pub free_frames: usize,
}

impl<A: Arch> Kernel<A> {
    /// Bring up the kernel on `arch`
    ///
    /// Boot sequence:
    /// 1. Validate configuration
    /// 2. Frame pool and kernel memory context
    /// 3. Idle thread of CPU 0 (the calling flow)
    /// 4. Kernel process (pid 0)
    /// 5. Idle threads of the secondary CPUs, which start right away
    pub fn boot(config: KernelConfig, arch: A) -> KernelResult<Arc<Self>> {
        config.validate()?;

        let pool = FramePool::new(
            PhysAddr::new(config.memory.phys_base),
            config.memory.frames,
            arch.physical_memory(),
        )?;
        let layout = AddressLayout::from_config(&config.memory);
        let kernel_context = MemoryContext::new_kernel(&pool, layout)?;
        let kernel_space = kernel_context.kernel_space();
        let kernel_root = kernel_space.root();

        let mut sched = SchedState::new(config.limits.max_threads);
        let bootstrap = arch.bootstrap_context(0)?;
        let idle = sched.threads.insert_with(|id| {
            Ok(Self::idle_thread(id, 0, bootstrap, None, kernel_root))
        })?;
        sched.cpus.push(CpuState {
            current: idle,
            idle,
            prev: None,
            need_resched: false,
            active_root: Some(kernel_root),
        });

        let kernel = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            arch,
            processes: IrqSpinLock::new(IdTable::new(config.limits.max_processes)),
            sched: IrqSpinLock::new(sched),
            config,
            pool,
            kernel_space,
            region_ids: RegionIds::new(),
            ticks: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            stats: Counters::default(),
        });

        let locks = LockNamespace::new(kernel.config.limits.max_locks);
        let process = kernel.insert_process("kernel", None, kernel_context, Arc::new(NullIo), locks)?;
        if process.id() != KERNEL_PID {
            return Err(KernelError::InvalidHandle);
        }

        kernel.start_secondary_cpus()?;

        log::info!(
            "{} v{} booted: {} CPUs, {} frames, {} Hz",
            crate::NAME,
            crate::VERSION,
            kernel.arch.cpu_count(),
            kernel.pool.total_frames(),
            kernel.config.tick_rate
        );
        Ok(kernel)
    }

    fn idle_thread(
        id: ThreadId,
        cpu: usize,
        context: A::Context,
        stack: Option<KernelStack>,
        root: PhysAddr,
    ) -> Thread<A> {
        Thread {
            id,
            name: alloc::format!("idle/{}", cpu),
            process: KERNEL_PID,
            priority: Priority::LOWEST,
            state: ThreadState::Running,
            context: Box::new(context),
            _stack: stack,
            signals: SignalState::new(),
            wait: None,
            wake_reason: None,
            quantum: 0,
            cpu_time: 0,
            running_on: Some(cpu),
            queued: false,
            idle: true,
            root,
            extended_dirty: false,
            user_stack: None,
        }
    }

    fn start_secondary_cpus(&self) -> KernelResult<()> {
        let cpus = self.arch.cpu_count();
        if cpus <= 1 {
            return Ok(());
        }

        let root = self.kernel_space.root();
        let mut sched = self.sched.lock();
        for cpu in 1..cpus {
            let stack = KernelStack::new(&self.pool, self.config.kernel_stack_pages)?;
            let context = self.arch.idle_context(cpu, &stack, self.hooks()?)?;
            let idle = sched
                .threads
                .insert_with(|id| Ok(Self::idle_thread(id, cpu, context, Some(stack), root)))?;
            sched.cpus.push(CpuState {
                current: idle,
                idle,
                prev: None,
                need_resched: false,
                active_root: Some(root),
            });
        }

        for cpu in 1..cpus {
            let idle = sched.cpus[cpu].idle;
            if let Some(thread) = sched.threads.get(idle) {
                self.arch.start_cpu(cpu, &thread.context);
            }
        }
        Ok(())
    }

    /// Run the scheduler on CPU 0
    ///
    /// Must be called by the flow that booted the kernel. Returns once no
    /// thread is left or [`Kernel::halt`] was called.
    pub fn run(&self) {
        log::info!("Scheduler running");
        self.idle_loop();
        log::info!("Kernel halted after {} ticks", self.ticks());
    }

    /// Stop every CPU at its next idle iteration
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            self.arch.halt();
        }
    }

    /// Whether the kernel halted
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Callbacks handed to the architecture layer
    pub(crate) fn hooks(&self) -> KernelResult<Arc<dyn KernelEntry>> {
        let kernel: Arc<Self> = self.this.upgrade().ok_or(KernelError::InvalidHandle)?;
        Ok(kernel)
    }

    /// Architecture backend
    pub fn arch(&self) -> &A {
        &self.arch
    }

    /// Active configuration
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Physical frame pool
    pub fn frame_pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    /// Root of the kernel page tables
    pub fn kernel_root(&self) -> PhysAddr {
        self.kernel_space.root()
    }

    /// Timer ticks since boot
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Snapshot of the kernel counters
    pub fn stats(&self) -> KernelStats {
        let threads = self.sched.lock().live;
        let processes = self.processes.lock().len();
        KernelStats {
            ticks: self.ticks(),
            context_switches: self.stats.context_switches.load(Ordering::Relaxed),
            address_space_switches: self.stats.address_space_switches.load(Ordering::Relaxed),
            extended_saves: self.stats.extended_saves.load(Ordering::Relaxed),
            extended_loads: self.stats.extended_loads.load(Ordering::Relaxed),
            threads,
            processes,
            free_frames: self.pool.free_frames(),
        }
    }

    /// Name of a thread, for diagnostics
    pub fn thread_name(&self, tid: ThreadId) -> Option<String> {
        self.sched.lock().threads.get(tid).map(|t| t.name.clone())
    }
}

impl<A: Arch> KernelEntry for Kernel<A> {
    fn thread_started(&self) {
        self.finish_switch();
    }

    fn thread_returned(&self, code: i32) -> ! {
        self.exit(code)
    }

    fn idle_loop(&self) {
        Kernel::idle_loop(self);
    }
}
