//! Architecture Layer
//!
//! The kernel core never touches registers directly. Everything that
//! depends on the machine goes through [`Arch`]:
//!
//! - creating, saving and restoring thread contexts
//! - switching address spaces
//! - idling and waking CPUs
//! - transferring control between threads
//!
//! Two implementations exist. [`hosted::HostedArch`] runs every kernel
//! thread on its own host thread and is what the test suite uses.
//! `x86_64::X86_64` is the bare-metal port, built for `target_os = "none"`.

#[cfg(feature = "hosted")]
pub mod hosted;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

use crate::mm::{PhysAddr, PhysicalMemory};
use crate::sys::thread::KernelStack;
use crate::KernelResult;
use alloc::sync::Arc;

/// CPU index, dense from zero
pub type CpuId = usize;

/// Registers of the user-mode state a trap saved
///
/// Signal delivery rewrites this frame to enter a handler and restores
/// it on `sigreturn`.
pub trait TrapFrame: Clone + Send + core::fmt::Debug {
    /// Program counter
    fn pc(&self) -> u64;
    /// Set program counter
    fn set_pc(&mut self, pc: u64);
    /// Stack pointer
    fn sp(&self) -> u64;
    /// Set stack pointer
    fn set_sp(&mut self, sp: u64);
    /// Argument register `index` (0-based)
    fn arg(&self, index: usize) -> u64;
    /// Set argument register `index`
    fn set_arg(&mut self, index: usize, value: u64);
    /// Set the address the current function returns to
    fn set_return_address(&mut self, addr: u64);
    /// Set the value returned to user mode
    fn set_return_value(&mut self, value: u64);
}

/// Calls from the architecture layer back into the kernel
pub trait KernelEntry: Send + Sync {
    /// First code a new thread runs, before its entry function
    fn thread_started(&self);

    /// The entry function of a thread returned
    fn thread_returned(&self, code: i32) -> !;

    /// Idle loop of a secondary CPU; returns only when the kernel halts
    fn idle_loop(&self);
}

/// Machine interface used by the kernel core
///
/// # Switching
///
/// A switch happens in two steps. [`Arch::prepare_switch`] runs with the
/// scheduler lock held and captures what the transfer needs. The lock is
/// then dropped and [`Arch::switch`] transfers control. The call returns
/// when some CPU switches back to the outgoing thread.
pub trait Arch: Send + Sync + Sized + 'static {
    /// Saved state of one thread
    type Context: Send;
    /// Entry function of a new thread
    type Entry: Send;
    /// User-mode register frame
    type Frame: TrapFrame;
    /// Transfer prepared under the scheduler lock
    type Switch;

    /// Number of CPUs
    fn cpu_count(&self) -> usize;

    /// CPU executing the caller
    fn current_cpu(&self) -> CpuId;

    /// Wait for something to happen on an idle CPU
    ///
    /// Returns true if the caller must deliver the timer tick itself.
    fn idle(&self) -> bool;

    /// Make `cpu` notice a pending reschedule
    fn kick_cpu(&self, cpu: CpuId);

    /// Consecutive idle iterations without any context switch after which
    /// the kernel declares itself stuck
    fn watchdog_limit(&self) -> Option<u64> {
        None
    }

    /// Memory behind physical frames
    fn physical_memory(&self) -> Arc<dyn PhysicalMemory>;

    /// Context of the flow already running on `cpu` at boot
    fn bootstrap_context(&self, cpu: CpuId) -> KernelResult<Self::Context>;

    /// Context running the idle loop of a secondary CPU
    fn idle_context(
        &self,
        cpu: CpuId,
        stack: &KernelStack,
        hooks: Arc<dyn KernelEntry>,
    ) -> KernelResult<Self::Context>;

    /// Context of a new thread starting at `entry(arg)`
    fn new_context(
        &self,
        entry: Self::Entry,
        arg: usize,
        stack: &KernelStack,
        hooks: Arc<dyn KernelEntry>,
    ) -> KernelResult<Self::Context>;

    /// Context of a forked thread: the parent's user frame and extended
    /// state, starting in the kernel at `entry(arg)`
    fn fork_context(
        &self,
        parent: &Self::Context,
        entry: Self::Entry,
        arg: usize,
        stack: &KernelStack,
        hooks: Arc<dyn KernelEntry>,
    ) -> KernelResult<Self::Context>;

    /// Start a secondary CPU on its idle context
    fn start_cpu(&self, cpu: CpuId, context: &Self::Context);

    /// User frame of a context
    fn frame<'a>(&self, context: &'a Self::Context) -> &'a Self::Frame;

    /// User frame of a context, mutably
    fn frame_mut<'a>(&self, context: &'a mut Self::Context) -> &'a mut Self::Frame;

    /// Write the live extended (FPU/SIMD) registers into the context
    fn save_extended(&self, context: &mut Self::Context);

    /// Load the context's extended registers into the CPU
    fn load_extended(&self, context: &mut Self::Context);

    /// Load a page-table root
    fn switch_address_space(&self, root: PhysAddr);

    /// Capture a transfer from `from` to `to` on `cpu`
    ///
    /// # Safety
    /// Both contexts must stay alive until the transfer completes: the
    /// scheduler only frees a context after switching off it for good.
    unsafe fn prepare_switch(
        &self,
        from: &mut Self::Context,
        to: &mut Self::Context,
        cpu: CpuId,
    ) -> Self::Switch;

    /// Transfer control; returns when the outgoing thread runs again
    ///
    /// # Safety
    /// Must be called without any spinlock held.
    unsafe fn switch(&self, switch: Self::Switch);

    /// Transfer control away from a thread that never runs again
    ///
    /// # Safety
    /// Must be called without any spinlock held and with nothing left on
    /// the outgoing stack that needs dropping.
    unsafe fn switch_final(&self, switch: Self::Switch) -> !;

    /// The kernel halted; release anything still parked
    fn halt(&self) {}
}

/// Interrupt masking for the executing CPU
pub mod interrupts {
    /// Disable interrupts, returning whether they were enabled
    #[inline]
    pub fn disable() -> bool {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            super::x86_64::interrupts_disable()
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            false
        }
    }

    /// Restore the state returned by [`disable`]
    #[inline]
    pub fn restore(enabled: bool) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            if enabled {
                super::x86_64::interrupts_enable();
            }
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            let _ = enabled;
        }
    }
}
