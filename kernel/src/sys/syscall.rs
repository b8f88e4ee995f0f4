//! System Call Interface
//!
//! The syscall ABI uses:
//! - RAX: syscall number
//! - RDI, RSI, RDX, R10, R8, R9: arguments
//! - RAX: return value, or a negative error code
//!
//! Pending signals are acted on after every call, on the way back to user
//! mode.

use super::process::{ProcessId, WaitOptions, WaitTarget};
use super::signal::{SigAction, SigActionFlags, SigHandler, SigHow, SigSet, Signal};
use super::thread::ThreadId;
use super::Kernel;
use crate::arch::Arch;
use crate::mm::{Backing, RegionFlags, RegionId, VirtAddr};
use crate::sync::{LockFlags, LockId, LockKind};
use crate::{KernelError, KernelResult};
use core::time::Duration;

/// System call numbers
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    // Threads and processes (1-19)
    /// Exit the calling thread
    Exit = 1,
    /// Yield CPU
    Yield = 2,
    /// Sleep for a number of milliseconds
    Sleep = 3,
    /// Get thread ID
    GetTid = 4,
    /// Get process ID
    GetPid = 5,
    /// Wait for a child process
    Wait = 6,
    /// Signal a process
    Kill = 7,
    /// Signal a thread
    Tkill = 8,
    /// Install a signal action
    SigAction = 9,
    /// Change the blocked mask
    SigProcMask = 10,
    /// Get pending signals
    SigPending = 11,
    /// Return from a signal handler
    SigReturn = 12,

    // Memory (20-29)
    /// Create region
    CreateRegion = 20,
    /// Delete region
    DeleteRegion = 21,
    /// Resize region
    ResizeRegion = 22,
    /// Move the program break
    Sbrk = 23,

    // Locks (30-39)
    /// Create lock
    LockCreate = 30,
    /// Acquire lock
    Lock = 31,
    /// Acquire lock without waiting
    TryLock = 32,
    /// Release lock
    Unlock = 33,
    /// Delete lock
    LockDelete = 34,
    /// Wait on a condition
    CondWait = 35,
    /// Wake one condition waiter
    CondSignal = 36,
    /// Wake all condition waiters
    CondBroadcast = 37,
}

impl TryFrom<u64> for Syscall {
    type Error = KernelError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Exit),
            2 => Ok(Syscall::Yield),
            3 => Ok(Syscall::Sleep),
            4 => Ok(Syscall::GetTid),
            5 => Ok(Syscall::GetPid),
            6 => Ok(Syscall::Wait),
            7 => Ok(Syscall::Kill),
            8 => Ok(Syscall::Tkill),
            9 => Ok(Syscall::SigAction),
            10 => Ok(Syscall::SigProcMask),
            11 => Ok(Syscall::SigPending),
            12 => Ok(Syscall::SigReturn),
            20 => Ok(Syscall::CreateRegion),
            21 => Ok(Syscall::DeleteRegion),
            22 => Ok(Syscall::ResizeRegion),
            23 => Ok(Syscall::Sbrk),
            30 => Ok(Syscall::LockCreate),
            31 => Ok(Syscall::Lock),
            32 => Ok(Syscall::TryLock),
            33 => Ok(Syscall::Unlock),
            34 => Ok(Syscall::LockDelete),
            35 => Ok(Syscall::CondWait),
            36 => Ok(Syscall::CondSignal),
            37 => Ok(Syscall::CondBroadcast),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// Timeout argument meaning "wait forever"
pub const FOREVER: u64 = u64::MAX;

/// Handler argument of `SigAction` selecting the default action
pub const SIG_DFL: u64 = 0;

/// Handler argument of `SigAction` ignoring the signal
pub const SIG_IGN: u64 = 1;

/// `Wait` target argument for any child
pub const WAIT_ANY: u64 = u64::MAX;

fn timeout(ms: u64) -> Option<Duration> {
    (ms != FOREVER).then(|| Duration::from_millis(ms))
}

fn signal(raw: u64) -> KernelResult<Signal> {
    Signal::new(u32::try_from(raw).map_err(|_| KernelError::InvalidArgument)?)
}

fn id(raw: u64) -> KernelResult<u32> {
    u32::try_from(raw).map_err(|_| KernelError::InvalidArgument)
}

fn count(raw: u64) -> KernelResult<u32> {
    u32::try_from(raw).map_err(|_| KernelError::InvalidArgument)
}

fn handler_to_raw(handler: SigHandler) -> u64 {
    match handler {
        SigHandler::Default => SIG_DFL,
        SigHandler::Ignore => SIG_IGN,
        SigHandler::User(addr) => addr,
    }
}

impl<A: Arch> Kernel<A> {
    /// Syscall entry
    ///
    /// Called from the syscall trap with:
    /// - number: syscall number (from RAX)
    /// - args: arguments (RDI, RSI, RDX, R10, R8, R9)
    ///
    /// Returns the value to put in RAX.
    pub fn syscall(&self, number: u64, args: [u64; 6]) -> isize {
        let result = Syscall::try_from(number).and_then(|call| self.dispatch(call, args));
        self.handle_signals();

        match result {
            Ok(value) => value as isize,
            Err(err) => {
                log::trace!("syscall {} failed: {}", number, err);
                err.errno()
            }
        }
    }

    fn dispatch(&self, call: Syscall, args: [u64; 6]) -> KernelResult<u64> {
        match call {
            Syscall::Exit => self.exit(args[0] as i32),
            Syscall::Yield => {
                self.yield_now();
                Ok(0)
            }
            Syscall::Sleep => {
                self.sleep(Duration::from_millis(args[0]))?;
                Ok(0)
            }
            Syscall::GetTid => Ok(self.current_thread().value() as u64),
            Syscall::GetPid => Ok(self.current_process().value() as u64),
            Syscall::Wait => self.sys_wait(args),
            Syscall::Kill => {
                self.kill(ProcessId(id(args[0])?), signal(args[1])?)?;
                Ok(0)
            }
            Syscall::Tkill => {
                self.send_signal(ThreadId(id(args[0])?), signal(args[1])?)?;
                Ok(0)
            }
            Syscall::SigAction => self.sys_sigaction(args),
            Syscall::SigProcMask => {
                let how = SigHow::from_raw(args[0])?;
                Ok(self.sigprocmask(how, SigSet(args[1])).0)
            }
            Syscall::SigPending => Ok(self.pending_signals().0),
            Syscall::SigReturn => {
                self.sigreturn()?;
                Ok(0)
            }

            Syscall::CreateRegion => {
                let flags = RegionFlags::from_bits(count(args[1])?).ok_or(KernelError::InvalidArgument)?;
                let id = self.create_region("anon", args[0] as usize, flags, Backing::Anonymous)?;
                Ok(id.value() as u64)
            }
            Syscall::DeleteRegion => {
                self.delete_region(RegionId(id(args[0])?))?;
                Ok(0)
            }
            Syscall::ResizeRegion => {
                self.resize_region(RegionId(id(args[0])?), args[1] as usize)?;
                Ok(0)
            }
            Syscall::Sbrk => Ok(self.sbrk(args[0] as i64 as isize)?.as_u64()),

            Syscall::LockCreate => {
                let kind = match args[0] {
                    0 => LockKind::Binary,
                    1 => LockKind::Counting,
                    2 => LockKind::Condition,
                    _ => return Err(KernelError::InvalidArgument),
                };
                let flags = LockFlags::from_bits(count(args[1])?).ok_or(KernelError::InvalidArgument)?;
                let id = self.create_lock("user", kind, flags, count(args[2])?)?;
                Ok(id.value() as u64)
            }
            Syscall::Lock => {
                self.lock(LockId(id(args[0])?), count(args[1])?, timeout(args[2]))?;
                Ok(0)
            }
            Syscall::TryLock => {
                self.try_lock(LockId(id(args[0])?), count(args[1])?)?;
                Ok(0)
            }
            Syscall::Unlock => {
                self.unlock(LockId(id(args[0])?), count(args[1])?)?;
                Ok(0)
            }
            Syscall::LockDelete => {
                self.delete_lock(LockId(id(args[0])?))?;
                Ok(0)
            }
            Syscall::CondWait => {
                self.cond_wait(LockId(id(args[0])?), LockId(id(args[1])?), timeout(args[2]))?;
                Ok(0)
            }
            Syscall::CondSignal => Ok(self.cond_signal(LockId(id(args[0])?))? as u64),
            Syscall::CondBroadcast => Ok(self.cond_broadcast(LockId(id(args[0])?))? as u64),
        }
    }

    /// `wait(pid, options, status_ptr)`; returns 0 for NOHANG with nothing
    /// to collect
    fn sys_wait(&self, args: [u64; 6]) -> KernelResult<u64> {
        let target = match args[0] {
            WAIT_ANY => WaitTarget::Any,
            pid => WaitTarget::Process(ProcessId(id(pid)?)),
        };
        let options = WaitOptions::from_bits(count(args[1])?).ok_or(KernelError::InvalidArgument)?;

        let Some((pid, status)) = self.wait(target, options)? else {
            return Ok(0);
        };
        if args[2] != 0 {
            self.copy_to_user(VirtAddr::new(args[2]), &status.to_raw().to_ne_bytes())?;
        }
        Ok(pid.value() as u64)
    }

    /// `sigaction(sig, handler, flags, mask, restorer)`; returns the
    /// previous handler
    fn sys_sigaction(&self, args: [u64; 6]) -> KernelResult<u64> {
        let handler = match args[1] {
            SIG_DFL => SigHandler::Default,
            SIG_IGN => SigHandler::Ignore,
            addr => SigHandler::User(addr),
        };
        let flags = SigActionFlags::from_bits(count(args[2])?).ok_or(KernelError::InvalidArgument)?;
        let action = SigAction { handler, flags, mask: SigSet(args[3]), restorer: args[4] };
        let previous = self.install_handler(signal(args[0])?, action)?;
        Ok(handler_to_raw(previous.handler))
    }
}
