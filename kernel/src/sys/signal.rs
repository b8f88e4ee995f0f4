//! Signals
//!
//! Each thread has a pending set, a blocked mask and an action table.
//! Signals are only acted upon at the kernel → user boundary
//! ([`Kernel::handle_signals`]); sending one merely marks it pending and
//! wakes the target out of an interruptible wait.
//!
//! Numbering follows the usual Unix layout (1..=64).

use super::thread::ThreadId;
use super::{Kernel, ProcessId};
use crate::arch::{Arch, TrapFrame};
use crate::{KernelError, KernelResult};
use alloc::vec::Vec;
use bitflags::bitflags;

/// Number of signals plus one
pub const NSIG: usize = 65;

/// Signal number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(u8);

impl Signal {
    /// Hangup
    pub const SIGHUP: Signal = Signal(1);
    /// Interrupt
    pub const SIGINT: Signal = Signal(2);
    /// Quit
    pub const SIGQUIT: Signal = Signal(3);
    /// Illegal instruction
    pub const SIGILL: Signal = Signal(4);
    /// Abort
    pub const SIGABRT: Signal = Signal(6);
    /// Kill, cannot be caught or blocked
    pub const SIGKILL: Signal = Signal(9);
    /// User signal 1
    pub const SIGUSR1: Signal = Signal(10);
    /// Segmentation fault
    pub const SIGSEGV: Signal = Signal(11);
    /// User signal 2
    pub const SIGUSR2: Signal = Signal(12);
    /// Broken pipe
    pub const SIGPIPE: Signal = Signal(13);
    /// Alarm
    pub const SIGALRM: Signal = Signal(14);
    /// Termination request
    pub const SIGTERM: Signal = Signal(15);
    /// Child changed state
    pub const SIGCHLD: Signal = Signal(17);
    /// Continue
    pub const SIGCONT: Signal = Signal(18);
    /// Stop, cannot be caught or blocked
    pub const SIGSTOP: Signal = Signal(19);
    /// Terminal stop
    pub const SIGTSTP: Signal = Signal(20);
    /// Background read
    pub const SIGTTIN: Signal = Signal(21);
    /// Background write
    pub const SIGTTOU: Signal = Signal(22);
    /// Urgent data
    pub const SIGURG: Signal = Signal(23);
    /// Window resized
    pub const SIGWINCH: Signal = Signal(28);

    /// Validate a signal number
    pub fn new(number: u32) -> KernelResult<Self> {
        if number == 0 || number as usize >= NSIG {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Signal(number as u8))
    }

    /// Signal number
    pub const fn number(self) -> u32 {
        self.0 as u32
    }

    /// Whether the action or mask of this signal can be changed
    pub fn is_catchable(self) -> bool {
        self != Self::SIGKILL && self != Self::SIGSTOP
    }

    /// Whether the default action does nothing
    pub fn default_ignored(self) -> bool {
        matches!(
            self,
            Self::SIGCHLD
                | Self::SIGCONT
                | Self::SIGURG
                | Self::SIGWINCH
                | Self::SIGSTOP
                | Self::SIGTSTP
                | Self::SIGTTIN
                | Self::SIGTTOU
        )
    }

    fn bit(self) -> u64 {
        1 << (self.0 - 1)
    }
}

impl core::fmt::Display for Signal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "signal {}", self.0)
    }
}

/// Set of signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SigSet(pub u64);

impl SigSet {
    /// Empty set
    pub const EMPTY: SigSet = SigSet(0);

    /// Signals that can never be blocked
    pub const UNBLOCKABLE: SigSet = SigSet((1 << 8) | (1 << 18));

    /// Set holding one signal
    pub fn of(signal: Signal) -> Self {
        SigSet(signal.bit())
    }

    /// Check membership
    pub fn contains(self, signal: Signal) -> bool {
        self.0 & signal.bit() != 0
    }

    /// Add a signal
    pub fn insert(&mut self, signal: Signal) {
        self.0 |= signal.bit();
    }

    /// Remove a signal
    pub fn remove(&mut self, signal: Signal) {
        self.0 &= !signal.bit();
    }

    /// Union
    pub fn union(self, other: SigSet) -> SigSet {
        SigSet(self.0 | other.0)
    }

    /// Members not in `other`
    pub fn difference(self, other: SigSet) -> SigSet {
        SigSet(self.0 & !other.0)
    }

    /// Check if empty
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Lowest-numbered member
    pub fn lowest(self) -> Option<Signal> {
        (self.0 != 0).then(|| Signal(self.0.trailing_zeros() as u8 + 1))
    }
}

/// What to do with a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigHandler {
    /// Default action
    #[default]
    Default,
    /// Discard
    Ignore,
    /// Run a user handler at this address
    User(u64),
}

bitflags! {
    /// Signal action flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct SigActionFlags: u32 {
        /// Reset to the default action once delivered
        const ONESHOT = 1 << 0;
        /// Do not block the signal while its handler runs
        const NODEFER = 1 << 1;
    }
}

/// Action installed for one signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigAction {
    /// Handler
    pub handler: SigHandler,
    /// Flags
    pub flags: SigActionFlags,
    /// Extra signals blocked while the handler runs
    pub mask: SigSet,
    /// Trampoline the handler returns to; it issues `sigreturn`
    pub restorer: u64,
}

impl SigAction {
    /// Action running a user handler
    pub fn handler(addr: u64, restorer: u64) -> Self {
        Self { handler: SigHandler::User(addr), restorer, ..Self::default() }
    }

    /// Action discarding the signal
    pub fn ignore() -> Self {
        Self { handler: SigHandler::Ignore, ..Self::default() }
    }
}

/// How `sigprocmask` combines the new set with the mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigHow {
    /// Add to the mask
    Block,
    /// Remove from the mask
    Unblock,
    /// Replace the mask
    SetMask,
}

impl SigHow {
    /// Decode the syscall encoding
    pub fn from_raw(raw: u64) -> KernelResult<Self> {
        match raw {
            0 => Ok(SigHow::Block),
            1 => Ok(SigHow::Unblock),
            2 => Ok(SigHow::SetMask),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// User state saved while a handler runs
#[derive(Debug, Clone)]
pub struct SignalFrame<F> {
    /// Interrupted user frame
    pub frame: F,
    /// Mask before delivery
    pub mask: SigSet,
}

/// Outcome of examining one pending signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing to do
    Ignore,
    /// Terminate the thread
    Terminate,
    /// Enter a user handler
    Handle(SigAction),
}

/// Per-thread signal state
#[derive(Debug, Clone)]
pub struct SignalState<F> {
    pending: SigSet,
    blocked: SigSet,
    actions: [SigAction; NSIG - 1],
    saved: Vec<SignalFrame<F>>,
}

impl<F> Default for SignalState<F> {
    fn default() -> Self {
        Self {
            pending: SigSet::EMPTY,
            blocked: SigSet::EMPTY,
            actions: [SigAction::default(); NSIG - 1],
            saved: Vec::new(),
        }
    }
}

impl<F: Clone> SignalState<F> {
    /// Fresh state: nothing pending, nothing blocked, default actions
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending signals
    pub fn pending(&self) -> SigSet {
        self.pending
    }

    /// Blocked mask
    pub fn blocked(&self) -> SigSet {
        self.blocked
    }

    /// Installed action
    pub fn action(&self, signal: Signal) -> SigAction {
        self.actions[signal.0 as usize - 1]
    }

    /// Whether a pending signal is not blocked
    pub fn is_pending(&self) -> bool {
        !self.pending.difference(self.blocked).is_empty()
    }

    fn ignores(&self, signal: Signal) -> bool {
        match self.action(signal).handler {
            SigHandler::Ignore => true,
            SigHandler::Default => signal.default_ignored(),
            SigHandler::User(_) => false,
        }
    }

    /// Mark a signal pending
    ///
    /// Returns whether it should interrupt a wait: it is neither blocked
    /// nor ignored. Ignored, unblocked signals are discarded.
    pub fn post(&mut self, signal: Signal) -> bool {
        let blocked = self.blocked.contains(signal);
        if self.ignores(signal) && !blocked {
            return false;
        }
        self.pending.insert(signal);
        !blocked
    }

    /// Install an action, returning the previous one
    pub fn set_action(&mut self, signal: Signal, action: SigAction) -> KernelResult<SigAction> {
        if !signal.is_catchable() {
            return Err(KernelError::InvalidArgument);
        }
        let previous = core::mem::replace(&mut self.actions[signal.0 as usize - 1], action);
        if self.ignores(signal) {
            self.pending.remove(signal);
        }
        Ok(previous)
    }

    /// Change the blocked mask, returning the previous one
    pub fn set_mask(&mut self, how: SigHow, set: SigSet) -> SigSet {
        let previous = self.blocked;
        self.blocked = match how {
            SigHow::Block => previous.union(set),
            SigHow::Unblock => previous.difference(set),
            SigHow::SetMask => set,
        }
        .difference(SigSet::UNBLOCKABLE);
        previous
    }

    /// Take the lowest deliverable signal and decide what to do with it
    pub fn next(&mut self) -> Option<(Signal, Disposition)> {
        let signal = self.pending.difference(self.blocked).lowest()?;
        self.pending.remove(signal);

        let action = self.action(signal);
        let disposition = match action.handler {
            SigHandler::Ignore => Disposition::Ignore,
            SigHandler::Default if signal.default_ignored() => Disposition::Ignore,
            SigHandler::Default => Disposition::Terminate,
            SigHandler::User(_) => Disposition::Handle(action),
        };
        Some((signal, disposition))
    }

    /// Enter a handler: save `frame` and the mask, block what the action says
    pub fn enter_handler(&mut self, signal: Signal, action: &SigAction, frame: F) {
        self.saved.push(SignalFrame { frame, mask: self.blocked });

        let mut block = action.mask;
        if !action.flags.contains(SigActionFlags::NODEFER) {
            block.insert(signal);
        }
        self.blocked = self.blocked.union(block).difference(SigSet::UNBLOCKABLE);

        if action.flags.contains(SigActionFlags::ONESHOT) {
            self.actions[signal.0 as usize - 1] = SigAction::default();
        }
    }

    /// Leave the innermost handler
    pub fn leave_handler(&mut self) -> Option<F> {
        let saved = self.saved.pop()?;
        self.blocked = saved.mask;
        Some(saved.frame)
    }

    /// Handlers currently entered
    pub fn depth(&self) -> usize {
        self.saved.len()
    }

    /// State inherited by a forked thread: actions and mask
    pub fn fork_copy(&self) -> Self {
        Self {
            pending: SigSet::EMPTY,
            blocked: self.blocked,
            actions: self.actions,
            saved: Vec::new(),
        }
    }

    /// Reset for a new program image: handlers go back to default,
    /// ignored signals stay ignored
    pub fn exec_reset(&mut self) {
        for action in self.actions.iter_mut() {
            if matches!(action.handler, SigHandler::User(_)) {
                *action = SigAction::default();
            }
        }
        self.saved.clear();
    }
}

impl<A: Arch> Kernel<A> {
    /// Send a signal to one thread
    pub fn send_signal(&self, tid: ThreadId, signal: Signal) -> KernelResult<()> {
        let mut sched = self.sched.lock();
        let thread = sched.threads.get_mut(tid).ok_or(KernelError::InvalidHandle)?;
        if thread.idle {
            return Err(KernelError::InvalidArgument);
        }
        if thread.signals.post(signal) {
            self.interrupt_wait(&mut sched, tid);
        }
        log::trace!("{} sent to thread {}", signal, tid);
        Ok(())
    }

    /// Send a signal to a process
    ///
    /// It goes to the first thread not blocking it, or to the first thread
    /// if all of them block it.
    pub fn kill(&self, pid: ProcessId, signal: Signal) -> KernelResult<()> {
        let process = self.process(pid)?;
        let threads = process.threads();
        if threads.is_empty() {
            return Err(KernelError::InvalidHandle);
        }

        let mut sched = self.sched.lock();
        let target = threads
            .iter()
            .copied()
            .find(|&tid| {
                sched
                    .threads
                    .get(tid)
                    .is_some_and(|t| !t.signals.blocked().contains(signal))
            })
            .unwrap_or(threads[0]);

        let thread = sched.threads.get_mut(target).ok_or(KernelError::InvalidHandle)?;
        if thread.signals.post(signal) {
            self.interrupt_wait(&mut sched, target);
        }
        log::trace!("{} sent to process {} (thread {})", signal, pid, target);
        Ok(())
    }

    /// Install a signal action for the current thread, returning the
    /// previous one
    pub fn install_handler(&self, signal: Signal, action: SigAction) -> KernelResult<SigAction> {
        let (previous, pid) = {
            let mut sched = self.sched.lock();
            let tid = sched.current(self.arch.current_cpu());
            let thread = sched.threads.get_mut(tid).ok_or(KernelError::InvalidHandle)?;
            (thread.signals.set_action(signal, action)?, thread.process)
        };

        if signal == Signal::SIGCHLD {
            let process = self.process(pid)?;
            process.state.lock().reap_children = action.handler == SigHandler::Ignore;
        }
        Ok(previous)
    }

    /// Change the current thread's blocked mask, returning the previous one
    pub fn sigprocmask(&self, how: SigHow, set: SigSet) -> SigSet {
        let mut sched = self.sched.lock();
        let tid = sched.current(self.arch.current_cpu());
        match sched.threads.get_mut(tid) {
            Some(thread) => thread.signals.set_mask(how, set),
            None => SigSet::EMPTY,
        }
    }

    /// Pending signals of the current thread
    pub fn pending_signals(&self) -> SigSet {
        let sched = self.sched.lock();
        let tid = sched.current(self.arch.current_cpu());
        sched.threads.get(tid).map(|t| t.signals.pending()).unwrap_or_default()
    }

    /// Act on pending signals before returning to user mode
    ///
    /// Ignored signals are dropped, a terminating signal ends the thread
    /// (this call does not return then), and at most one user handler is
    /// entered per call. Returns the signal whose handler was entered.
    pub fn handle_signals(&self) -> Option<Signal> {
        loop {
            let mut sched = self.sched.lock();
            let tid = sched.current(self.arch.current_cpu());
            let thread = sched.threads.get_mut(tid)?;
            if thread.idle {
                return None;
            }

            let (signal, disposition) = thread.signals.next()?;
            match disposition {
                Disposition::Ignore => continue,
                Disposition::Terminate => {
                    drop(sched);
                    log::debug!("Thread {} terminated by {}", tid, signal);
                    self.exit_with(super::ExitStatus::Signaled(signal));
                }
                Disposition::Handle(action) => {
                    let saved = self.arch.frame(&thread.context).clone();
                    thread.signals.enter_handler(signal, &action, saved);

                    let frame = self.arch.frame_mut(&mut thread.context);
                    if let SigHandler::User(addr) = action.handler {
                        frame.set_pc(addr);
                    }
                    frame.set_arg(0, signal.number() as u64);
                    frame.set_return_address(action.restorer);
                    log::trace!("Thread {} entering handler for {}", tid, signal);
                    return Some(signal);
                }
            }
        }
    }

    /// Return from a signal handler: restore the saved frame and mask
    pub fn sigreturn(&self) -> KernelResult<()> {
        let mut sched = self.sched.lock();
        let tid = sched.current(self.arch.current_cpu());
        let thread = sched.threads.get_mut(tid).ok_or(KernelError::InvalidHandle)?;
        let frame = thread.signals.leave_handler().ok_or(KernelError::InvalidArgument)?;
        *self.arch.frame_mut(&mut thread.context) = frame;
        Ok(())
    }
}
