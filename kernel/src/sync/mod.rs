//! Synchronization
//!
//! Two families of locks live here:
//! - [`IrqSpinLock`]: short critical sections, interrupts off while held.
//!   Never held across a context switch.
//! - Sleeping primitives ([`lock::LockObject`], [`SleepMutex`]): contended
//!   callers block through the scheduler.
//!
//! Sleeping primitives do not know the scheduler's type. They talk to it
//! through [`Blocker`], which the kernel implements.

pub mod lock;
pub mod sleep_mutex;
pub mod wait_queue;

pub use lock::{LockFlags, LockId, LockInfo, LockKind, LockNamespace, LockObject};
pub use sleep_mutex::{SleepMutex, SleepMutexGuard};
pub use wait_queue::{WaitNode, WaitObject, WaitQueue, WaitToken, WakeReason};

use crate::arch::interrupts;
use crate::sys::thread::ThreadId;
use crate::KernelResult;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

/// Spinlock that keeps interrupts disabled while held
pub struct IrqSpinLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqSpinLock<T> {
    /// Create lock
    pub const fn new(value: T) -> Self {
        Self { inner: spin::Mutex::new(value) }
    }

    /// Acquire the lock
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let enabled = interrupts::disable();
        IrqSpinLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            enabled,
        }
    }

    /// Mutable access without locking
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Consume the lock
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Guard of an [`IrqSpinLock`]
pub struct IrqSpinLockGuard<'a, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    enabled: bool,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Unlock before interrupts come back on
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        interrupts::restore(self.enabled);
    }
}

/// Blocking services the scheduler offers to sleeping primitives
///
/// The protocol for blocking on an object:
///
/// 1. With the object's spinlock held, call [`Blocker::prepare_wait`] and
///    queue a [`WaitNode`] carrying the returned token.
/// 2. Drop the object's spinlock and call [`Blocker::wait`].
///
/// A wake-up between 1 and 2 is not lost: the thread is already marked
/// waiting, so the wake-up just makes it ready again.
pub trait Blocker {
    /// Thread executing the caller
    fn current(&self) -> ThreadId;

    /// Current tick
    fn now(&self) -> u64;

    /// Mark the current thread waiting on `on`
    ///
    /// Fails with `Interrupted` if the wait is interruptible and a signal
    /// is already pending, and with `WouldBlock` on threads that may not
    /// block (idle threads).
    fn prepare_wait(
        &self,
        on: WaitObject,
        interruptible: bool,
        deadline: Option<u64>,
    ) -> KernelResult<WaitToken>;

    /// Block until the prepared wait ends
    fn wait(&self, token: WaitToken) -> WakeReason;

    /// End the wait `token` of `thread`
    ///
    /// Returns false if that wait already ended; the caller then drops the
    /// node and moves on.
    fn wake(&self, thread: ThreadId, token: WaitToken, reason: WakeReason) -> bool;
}
