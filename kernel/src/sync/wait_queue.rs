//! Wait Queues
//!
//! Ordered lists of blocked threads. Lock objects keep their waiters in
//! arrival order; the scheduler keeps timed waits in deadline order.
//!
//! A node carries the wait token of the wait it belongs to. Whoever wakes
//! a thread must present the same token, so a node left behind by a wait
//! that already ended (timed out, interrupted) can never wake the thread
//! out of a later wait.

use crate::sys::thread::ThreadId;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// Identifies one wait of one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitToken(pub u64);

/// Why a blocked thread resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The resource was handed over
    Granted,
    /// The deadline passed
    TimedOut,
    /// A signal arrived
    Interrupted,
    /// The object waited on was destroyed
    Destroyed,
}

impl WakeReason {
    /// Error for a wait that ended without the resource
    pub fn into_result(self) -> crate::KernelResult<()> {
        match self {
            WakeReason::Granted => Ok(()),
            WakeReason::TimedOut => Err(crate::KernelError::TimedOut),
            WakeReason::Interrupted => Err(crate::KernelError::Interrupted),
            WakeReason::Destroyed => Err(crate::KernelError::InvalidHandle),
        }
    }
}

/// What a thread is blocked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitObject {
    /// Lock acquisition
    Lock(crate::sync::lock::LockId),
    /// Condition variable
    Condition(crate::sync::lock::LockId),
    /// A child process changing state
    Child,
    /// Timed sleep
    Sleep,
    /// Contended sleeping mutex
    Mutex,
}

/// One blocked thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitNode {
    /// Blocked thread
    pub thread: ThreadId,
    /// Token of the wait
    pub token: WaitToken,
    /// Tick at which the wait times out
    pub deadline: Option<u64>,
    /// Units requested (counting locks)
    pub count: u32,
}

impl WaitNode {
    /// Node requesting one unit, without deadline
    pub fn new(thread: ThreadId, token: WaitToken) -> Self {
        Self { thread, token, deadline: None, count: 1 }
    }

    /// Set the requested count
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Set the deadline
    pub fn with_deadline(mut self, deadline: Option<u64>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Queue of blocked threads
#[derive(Debug, Default)]
pub struct WaitQueue {
    nodes: VecDeque<WaitNode>,
}

impl WaitQueue {
    /// Create empty queue
    pub const fn new() -> Self {
        Self { nodes: VecDeque::new() }
    }

    /// Append in arrival order
    pub fn push_back(&mut self, node: WaitNode) {
        self.nodes.push_back(node);
    }

    /// Insert in deadline order, after nodes with the same deadline
    pub fn insert_by_deadline(&mut self, node: WaitNode) {
        let deadline = node.deadline.unwrap_or(u64::MAX);
        let index = self
            .nodes
            .partition_point(|n| n.deadline.unwrap_or(u64::MAX) <= deadline);
        self.nodes.insert(index, node);
    }

    /// First node
    pub fn front(&self) -> Option<&WaitNode> {
        self.nodes.front()
    }

    /// Remove the first node
    pub fn pop_front(&mut self) -> Option<WaitNode> {
        self.nodes.pop_front()
    }

    /// Remove the node of a wait; a second call finds nothing
    pub fn remove(&mut self, token: WaitToken) -> Option<WaitNode> {
        let index = self.nodes.iter().position(|n| n.token == token)?;
        self.nodes.remove(index)
    }

    /// Remove every node whose deadline is at or before `now`
    ///
    /// Only meaningful on a deadline-ordered queue.
    pub fn pop_expired(&mut self, now: u64) -> Vec<WaitNode> {
        let mut expired = Vec::new();
        while let Some(node) = self.nodes.front() {
            match node.deadline {
                Some(deadline) if deadline <= now => {
                    if let Some(node) = self.nodes.pop_front() {
                        expired.push(node);
                    }
                }
                _ => break,
            }
        }
        expired
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check whether a thread is queued
    pub fn contains_thread(&self, thread: ThreadId) -> bool {
        self.nodes.iter().any(|n| n.thread == thread)
    }

    /// Remove every node
    pub fn drain(&mut self) -> Vec<WaitNode> {
        self.nodes.drain(..).collect()
    }

    /// Iterate in queue order
    pub fn iter(&self) -> impl Iterator<Item = &WaitNode> {
        self.nodes.iter()
    }
}
