//! Lock Objects
//!
//! Blocking locks addressed by id through a per-process [`LockNamespace`].
//!
//! | Kind | Count meaning | Holder |
//! |------|---------------|--------|
//! | Binary | 1 = free, 0 = held | owning thread, recursion depth |
//! | Counting | units available | none |
//! | Condition | unused | none |
//!
//! Waiters queue in arrival order. A release hands units to waiters
//! directly: by the time a waiter observes its wake-up the units are
//! already its own.

use super::{Blocker, IrqSpinLock, WaitNode, WaitObject, WaitQueue, WakeReason};
use crate::sys::thread::ThreadId;
use crate::table::IdTable;
use crate::{KernelError, KernelResult};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

crate::table_key!(
    /// Lock ID, unique within one namespace
    LockId
);

/// Lock kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Mutual exclusion with an owner
    Binary,
    /// Semaphore
    Counting,
    /// Condition variable, used together with a binary lock
    Condition,
}

bitflags! {
    /// Lock flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LockFlags: u32 {
        /// Owner may re-acquire a binary lock
        const RECURSIVE = 1 << 0;
        /// Shared with forked children instead of copied
        const SHARED = 1 << 1;
        /// Waiters ignore signals
        const UNINTERRUPTIBLE = 1 << 2;
    }
}

/// Snapshot of a lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// Lock ID
    pub id: LockId,
    /// Name
    pub name: String,
    /// Kind
    pub kind: LockKind,
    /// Flags
    pub flags: LockFlags,
    /// Units available
    pub count: u32,
    /// Owner of a binary lock
    pub holder: Option<ThreadId>,
    /// Recursion depth of the owner
    pub depth: u32,
    /// Threads queued
    pub waiters: usize,
}

struct LockState {
    count: u32,
    holder: Option<ThreadId>,
    depth: u32,
    waiters: WaitQueue,
    destroyed: bool,
}

/// Blocking lock
pub struct LockObject {
    id: LockId,
    name: String,
    kind: LockKind,
    flags: LockFlags,
    state: IrqSpinLock<LockState>,
}

impl LockObject {
    /// Create lock
    ///
    /// A binary lock created with `initial == 0` starts held by `creator`.
    /// Condition variables take no initial count.
    pub fn new(
        id: LockId,
        name: &str,
        kind: LockKind,
        flags: LockFlags,
        initial: u32,
        creator: ThreadId,
    ) -> KernelResult<Self> {
        let (count, holder, depth) = match kind {
            LockKind::Binary if initial == 1 => (1, None, 0),
            LockKind::Binary if initial == 0 => (0, Some(creator), 1),
            LockKind::Counting => (initial, None, 0),
            LockKind::Condition if initial == 0 => (0, None, 0),
            _ => return Err(KernelError::InvalidArgument),
        };

        Ok(Self {
            id,
            name: String::from(name),
            kind,
            flags,
            state: IrqSpinLock::new(LockState {
                count,
                holder,
                depth,
                waiters: WaitQueue::new(),
                destroyed: false,
            }),
        })
    }

    /// Lock ID
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Flags
    pub fn flags(&self) -> LockFlags {
        self.flags
    }

    /// Check if the lock was destroyed
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Take `count` units if possible right now
    fn try_take(&self, state: &mut LockState, me: ThreadId, count: u32) -> KernelResult<bool> {
        if state.destroyed {
            return Err(KernelError::InvalidHandle);
        }

        match self.kind {
            LockKind::Condition => return Err(KernelError::InvalidArgument),
            LockKind::Binary => {
                if count != 1 {
                    return Err(KernelError::InvalidArgument);
                }
                if state.holder == Some(me) {
                    if !self.flags.contains(LockFlags::RECURSIVE) {
                        return Err(KernelError::Deadlock);
                    }
                    state.depth += 1;
                    return Ok(true);
                }
            }
            LockKind::Counting if count == 0 => return Err(KernelError::InvalidArgument),
            LockKind::Counting => {}
        }

        if state.count >= count && state.waiters.is_empty() {
            state.count -= count;
            if self.kind == LockKind::Binary {
                state.holder = Some(me);
                state.depth = 1;
            }
            return Ok(true);
        }

        Ok(false)
    }

    /// Acquire without waiting
    pub fn try_acquire(&self, me: ThreadId, count: u32) -> KernelResult<()> {
        let mut state = self.state.lock();
        if self.try_take(&mut state, me, count)? {
            Ok(())
        } else {
            Err(KernelError::WouldBlock)
        }
    }

    /// Acquire, waiting until `deadline` (tick) at most
    pub fn acquire(
        &self,
        blocker: &dyn Blocker,
        count: u32,
        deadline: Option<u64>,
    ) -> KernelResult<()> {
        let interruptible = !self.flags.contains(LockFlags::UNINTERRUPTIBLE);
        self.acquire_inner(blocker, count, deadline, interruptible)
    }

    fn acquire_inner(
        &self,
        blocker: &dyn Blocker,
        count: u32,
        deadline: Option<u64>,
        interruptible: bool,
    ) -> KernelResult<()> {
        let me = blocker.current();
        let mut state = self.state.lock();
        if self.try_take(&mut state, me, count)? {
            return Ok(());
        }
        if deadline.is_some_and(|d| d <= blocker.now()) {
            return Err(KernelError::TimedOut);
        }

        let token = blocker.prepare_wait(WaitObject::Lock(self.id), interruptible, deadline)?;
        state
            .waiters
            .push_back(WaitNode::new(me, token).with_count(count).with_deadline(deadline));
        drop(state);

        match blocker.wait(token) {
            WakeReason::Granted => Ok(()),
            reason => {
                let mut state = self.state.lock();
                state.waiters.remove(token);
                // Units held back behind this node go to the next waiters
                if !state.destroyed {
                    self.grant(&mut state, blocker);
                }
                reason.into_result()
            }
        }
    }

    /// Release `count` units, returning how many waiters were granted
    pub fn release(&self, blocker: &dyn Blocker, count: u32) -> KernelResult<usize> {
        let me = blocker.current();
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KernelError::InvalidHandle);
        }

        match self.kind {
            LockKind::Condition => return Err(KernelError::InvalidArgument),
            LockKind::Binary => {
                if count != 1 {
                    return Err(KernelError::InvalidArgument);
                }
                if state.holder != Some(me) {
                    return Err(KernelError::NotOwner);
                }
                state.depth -= 1;
                if state.depth > 0 {
                    return Ok(0);
                }
                state.holder = None;
                state.count = 1;
            }
            LockKind::Counting => {
                if count == 0 {
                    return Err(KernelError::InvalidArgument);
                }
                state.count = state.count.checked_add(count).ok_or(KernelError::InvalidArgument)?;
            }
        }

        Ok(self.grant(&mut state, blocker))
    }

    /// Hand units to waiters in arrival order while the count allows
    fn grant(&self, state: &mut LockState, blocker: &dyn Blocker) -> usize {
        let mut granted = 0;
        while let Some(&node) = state.waiters.front() {
            if state.count < node.count {
                break;
            }
            state.waiters.pop_front();

            state.count -= node.count;
            if self.kind == LockKind::Binary {
                state.holder = Some(node.thread);
                state.depth = 1;
            }

            if blocker.wake(node.thread, node.token, WakeReason::Granted) {
                granted += 1;
            } else {
                // Stale node: that wait already ended
                state.count += node.count;
                if self.kind == LockKind::Binary {
                    state.holder = None;
                    state.depth = 0;
                }
            }
        }
        granted
    }

    /// Mark destroyed and wake every waiter
    pub fn destroy(&self, blocker: &dyn Blocker) -> usize {
        let mut state = self.state.lock();
        if state.destroyed {
            return 0;
        }
        state.destroyed = true;

        let nodes = state.waiters.drain();
        let woken = nodes
            .iter()
            .filter(|node| blocker.wake(node.thread, node.token, WakeReason::Destroyed))
            .count();

        log::debug!("Lock {} ({}) destroyed, {} waiters woken", self.id, self.name, woken);
        woken
    }

    /// Wait on this condition variable, releasing `mutex` meanwhile
    ///
    /// The caller must hold `mutex`. It holds it again, at the same
    /// recursion depth, when this returns, whatever the outcome.
    pub fn wait_condition(
        &self,
        mutex: &LockObject,
        blocker: &dyn Blocker,
        deadline: Option<u64>,
    ) -> KernelResult<()> {
        if self.kind != LockKind::Condition || mutex.kind != LockKind::Binary {
            return Err(KernelError::InvalidArgument);
        }

        let me = blocker.current();
        if mutex.state.lock().holder != Some(me) {
            return Err(KernelError::NotOwner);
        }

        let token = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(KernelError::InvalidHandle);
            }
            let interruptible = !self.flags.contains(LockFlags::UNINTERRUPTIBLE);
            let token = blocker.prepare_wait(WaitObject::Condition(self.id), interruptible, deadline)?;
            state.waiters.push_back(WaitNode::new(me, token).with_deadline(deadline));
            token
        };

        // Queued before the mutex goes, so a signal in between is not lost
        let depth = {
            let mut state = mutex.state.lock();
            let depth = state.depth;
            state.depth = 1;
            depth
        };
        if let Err(err) = mutex.release(blocker, 1) {
            self.state.lock().waiters.remove(token);
            blocker.wake(me, token, WakeReason::Destroyed);
            blocker.wait(token);
            return Err(err);
        }

        let reason = blocker.wait(token);
        if reason != WakeReason::Granted {
            self.state.lock().waiters.remove(token);
        }

        mutex.acquire_inner(blocker, 1, None, false)?;
        mutex.state.lock().depth = depth;

        reason.into_result()
    }

    /// Wake one waiter of a condition variable, or all of them
    pub fn notify(&self, blocker: &dyn Blocker, all: bool) -> KernelResult<usize> {
        if self.kind != LockKind::Condition {
            return Err(KernelError::InvalidArgument);
        }

        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KernelError::InvalidHandle);
        }

        let mut woken = 0;
        while let Some(node) = state.waiters.pop_front() {
            if blocker.wake(node.thread, node.token, WakeReason::Granted) {
                woken += 1;
                if !all {
                    break;
                }
            }
        }
        Ok(woken)
    }

    /// Copy for a forked namespace
    ///
    /// Binary locks come out released, counting locks keep their count,
    /// condition variables start empty. Waiters are never copied.
    pub fn fork_copy(&self) -> LockObject {
        let state = self.state.lock();
        let count = match self.kind {
            LockKind::Binary => 1,
            LockKind::Counting => state.count,
            LockKind::Condition => 0,
        };

        LockObject {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            flags: self.flags,
            state: IrqSpinLock::new(LockState {
                count,
                holder: None,
                depth: 0,
                waiters: WaitQueue::new(),
                destroyed: state.destroyed,
            }),
        }
    }

    /// Snapshot
    pub fn info(&self) -> LockInfo {
        let state = self.state.lock();
        LockInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            flags: self.flags,
            count: state.count,
            holder: state.holder,
            depth: state.depth,
            waiters: state.waiters.len(),
        }
    }
}

impl core::fmt::Debug for LockObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockObject")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Locks of one process, by id
pub struct LockNamespace {
    locks: IdTable<LockId, Arc<LockObject>>,
}

impl LockNamespace {
    /// Create empty namespace
    pub fn new(capacity: usize) -> Self {
        Self { locks: IdTable::new(capacity) }
    }

    /// Create a lock
    pub fn create(
        &mut self,
        name: &str,
        kind: LockKind,
        flags: LockFlags,
        initial: u32,
        creator: ThreadId,
    ) -> KernelResult<LockId> {
        self.locks.insert_with(|id| {
            LockObject::new(id, name, kind, flags, initial, creator).map(Arc::new)
        })
    }

    /// Look up a lock
    pub fn get(&self, id: LockId) -> KernelResult<Arc<LockObject>> {
        self.locks.get(id).cloned().ok_or(KernelError::InvalidHandle)
    }

    /// Check that `id` still names `lock`
    pub fn is_current(&self, id: LockId, lock: &Arc<LockObject>) -> bool {
        self.locks.get(id).is_some_and(|current| Arc::ptr_eq(current, lock))
    }

    /// Remove a lock from the namespace
    pub fn remove(&mut self, id: LockId) -> KernelResult<Arc<LockObject>> {
        self.locks.remove(id).ok_or(KernelError::InvalidHandle)
    }

    /// Namespace for a forked process
    ///
    /// Ids stay the same. Locks flagged [`LockFlags::SHARED`] are the same
    /// objects in both namespaces; the rest are independent copies.
    pub fn fork(&self) -> KernelResult<LockNamespace> {
        let locks = self.locks.try_clone_with(|_, lock| {
            if lock.flags().contains(LockFlags::SHARED) {
                Ok(lock.clone())
            } else {
                Ok(Arc::new(lock.fork_copy()))
            }
        })?;
        Ok(Self { locks })
    }

    /// Remove every lock
    pub fn drain(&mut self) -> Vec<Arc<LockObject>> {
        self.locks.drain().into_iter().map(|(_, lock)| lock).collect()
    }

    /// Number of locks
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check if namespace is empty
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Ids in use
    pub fn ids(&self) -> Vec<LockId> {
        self.locks.iter().map(|(id, _)| id).collect()
    }
}

impl Drop for LockObject {
    fn drop(&mut self) {
        log::trace!("Lock {} ({}) freed", self.id, self.name);
    }
}
