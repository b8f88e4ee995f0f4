//! Lock Operations
//!
//! Locks live in the namespace of the process that created them and are
//! addressed by [`LockId`]. Timeouts are converted to an absolute tick
//! deadline once, on entry.

use super::process::Process;
use super::Kernel;
use crate::arch::Arch;
use crate::sync::{LockFlags, LockId, LockInfo, LockKind, LockObject};
use crate::{KernelError, KernelResult};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;

impl<A: Arch> Kernel<A> {
    fn lookup_lock(&self, id: LockId) -> KernelResult<(Arc<Process>, Arc<LockObject>)> {
        let process = self.current_process_ref()?;
        let lock = process.locks.lock().get(id)?;
        Ok((process, lock))
    }

    fn deadline(&self, timeout: Option<Duration>) -> Option<u64> {
        timeout.map(|t| self.ticks().saturating_add(self.config.duration_to_ticks(t)))
    }

    /// Create a lock in the caller's namespace
    ///
    /// A binary lock created with `initial == 0` starts held by the caller.
    pub fn create_lock(
        &self,
        name: &str,
        kind: LockKind,
        flags: LockFlags,
        initial: u32,
    ) -> KernelResult<LockId> {
        let process = self.current_process_ref()?;
        let me = self.current_thread();
        let id = process.locks.lock().create(name, kind, flags, initial, me)?;
        log::debug!("Lock {} ({}, {:?}) created in process {}", id, name, kind, process.id());
        Ok(id)
    }

    /// Acquire `count` units, waiting `timeout` at most (forever if `None`)
    ///
    /// A zero timeout only tries. A wait that ends because the lock was
    /// deleted meanwhile reports `InvalidHandle`.
    pub fn lock(&self, id: LockId, count: u32, timeout: Option<Duration>) -> KernelResult<()> {
        if timeout.is_some_and(|t| t.is_zero()) {
            return match self.try_lock(id, count) {
                Err(KernelError::WouldBlock) => Err(KernelError::TimedOut),
                other => other,
            };
        }

        let (process, lock) = self.lookup_lock(id)?;
        match lock.acquire(self, count, self.deadline(timeout)) {
            Err(KernelError::TimedOut | KernelError::Interrupted)
                if !process.locks.lock().is_current(id, &lock) =>
            {
                Err(KernelError::InvalidHandle)
            }
            other => other,
        }
    }

    /// Acquire `count` units without waiting
    pub fn try_lock(&self, id: LockId, count: u32) -> KernelResult<()> {
        let (_, lock) = self.lookup_lock(id)?;
        lock.try_acquire(self.current_thread(), count)
    }

    /// Release `count` units
    pub fn unlock(&self, id: LockId, count: u32) -> KernelResult<()> {
        let (_, lock) = self.lookup_lock(id)?;
        lock.release(self, count)?;
        self.preempt();
        Ok(())
    }

    /// Delete a lock; its waiters fail with `InvalidHandle`
    pub fn delete_lock(&self, id: LockId) -> KernelResult<()> {
        let process = self.current_process_ref()?;
        let lock = process.locks.lock().remove(id)?;
        lock.destroy(self);
        self.preempt();
        Ok(())
    }

    /// Snapshot of a lock
    pub fn lock_info(&self, id: LockId) -> KernelResult<LockInfo> {
        let (_, lock) = self.lookup_lock(id)?;
        Ok(lock.info())
    }

    /// Snapshots of every lock of the caller's process
    pub fn list_locks(&self) -> KernelResult<Vec<LockInfo>> {
        let process = self.current_process_ref()?;
        let namespace = process.locks.lock();
        Ok(namespace.ids().into_iter().filter_map(|id| namespace.get(id).ok()).map(|l| l.info()).collect())
    }

    /// Wait on condition `cond`, releasing binary lock `mutex` meanwhile
    ///
    /// `mutex` is held again when this returns, whatever the outcome.
    pub fn cond_wait(&self, cond: LockId, mutex: LockId, timeout: Option<Duration>) -> KernelResult<()> {
        let (_, condition) = self.lookup_lock(cond)?;
        let (_, mutex) = self.lookup_lock(mutex)?;
        condition.wait_condition(&mutex, self, self.deadline(timeout))
    }

    /// Wake one waiter of a condition, returning how many woke
    pub fn cond_signal(&self, cond: LockId) -> KernelResult<usize> {
        let (_, condition) = self.lookup_lock(cond)?;
        let woken = condition.notify(self, false)?;
        self.preempt();
        Ok(woken)
    }

    /// Wake every waiter of a condition, returning how many woke
    pub fn cond_broadcast(&self, cond: LockId) -> KernelResult<usize> {
        let (_, condition) = self.lookup_lock(cond)?;
        let woken = condition.notify(self, true)?;
        self.preempt();
        Ok(woken)
    }
}
