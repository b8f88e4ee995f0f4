//! Sleeping Mutex
//!
//! Guards state that is held across long operations (a process's memory
//! context: fork copies every page under it). Contended callers block
//! instead of spinning. Release hands ownership straight to the first
//! waiter.

use super::{Blocker, IrqSpinLock, WaitNode, WaitObject, WaitQueue, WakeReason};
use crate::sys::thread::ThreadId;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

struct MutexState {
    owner: Option<ThreadId>,
    waiters: WaitQueue,
}

/// Mutex whose contended callers sleep
pub struct SleepMutex<T> {
    state: IrqSpinLock<MutexState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SleepMutex<T> {}
unsafe impl<T: Send> Sync for SleepMutex<T> {}

impl<T> SleepMutex<T> {
    /// Create mutex
    pub const fn new(value: T) -> Self {
        Self {
            state: IrqSpinLock::new(MutexState { owner: None, waiters: WaitQueue::new() }),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire, sleeping while another thread owns the mutex
    ///
    /// Threads that may not sleep spin instead.
    ///
    /// # Panics
    /// If the calling thread already owns the mutex.
    pub fn lock<'a>(&'a self, blocker: &'a dyn Blocker) -> SleepMutexGuard<'a, T> {
        let me = blocker.current();
        loop {
            let mut state = self.state.lock();
            match state.owner {
                None => {
                    state.owner = Some(me);
                    return SleepMutexGuard { mutex: self, blocker };
                }
                Some(owner) if owner == me => panic!("sleep mutex re-entered by thread {}", me),
                Some(_) => {}
            }

            match blocker.prepare_wait(WaitObject::Mutex, false, None) {
                Ok(token) => {
                    state.waiters.push_back(WaitNode::new(me, token));
                    drop(state);
                    if blocker.wait(token) == WakeReason::Granted {
                        return SleepMutexGuard { mutex: self, blocker };
                    }
                    self.state.lock().waiters.remove(token);
                }
                Err(_) => {
                    drop(state);
                    core::hint::spin_loop();
                }
            }
        }
    }

    /// Acquire without waiting
    pub fn try_lock<'a>(&'a self, blocker: &'a dyn Blocker) -> Option<SleepMutexGuard<'a, T>> {
        let mut state = self.state.lock();
        if state.owner.is_some() {
            return None;
        }
        state.owner = Some(blocker.current());
        Some(SleepMutexGuard { mutex: self, blocker })
    }

    /// Check whether some thread owns the mutex
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Mutable access without locking
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self, blocker: &dyn Blocker) {
        let mut state = self.state.lock();
        while let Some(node) = state.waiters.pop_front() {
            state.owner = Some(node.thread);
            if blocker.wake(node.thread, node.token, WakeReason::Granted) {
                return;
            }
        }
        state.owner = None;
    }
}

/// Guard of a [`SleepMutex`]
pub struct SleepMutexGuard<'a, T> {
    mutex: &'a SleepMutex<T>,
    blocker: &'a dyn Blocker,
}

impl<T> Deref for SleepMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SleepMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SleepMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock(self.blocker);
    }
}
