//! Kernel Error Types
//!
//! Every fallible kernel operation returns [`KernelResult`]. Errors fall in
//! four classes:
//! - Resource exhaustion: nothing was allocated, partial work is unwound
//! - Invalid handle: a stale or unknown id
//! - Policy violation: the request was refused and had no effect
//! - Wait outcome: a blocking call ended without acquiring its resource
//!
//! Scheduler invariant violations are not represented here; they halt the
//! kernel (see [`crate::sys::Kernel`]).

use thiserror::Error;

/// Kernel result type
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    // ========== Resource Exhaustion ==========

    /// No physical memory left
    #[error("out of memory")]
    OutOfMemory,

    /// No free virtual address range large enough
    #[error("address space exhausted")]
    AddressSpaceExhausted,

    /// A kernel table reached its configured capacity
    #[error("kernel table full")]
    TableFull,

    // ========== Invalid Handle ==========

    /// Stale or unknown thread, process, lock or region id
    #[error("invalid handle")]
    InvalidHandle,

    /// Malformed argument (size, alignment, signal number, ...)
    #[error("invalid argument")]
    InvalidArgument,

    // ========== Policy Violation ==========

    /// Re-acquiring a non-recursive lock held by the caller
    #[error("resource deadlock avoided")]
    Deadlock,

    /// Releasing a lock the caller does not hold
    #[error("operation not permitted")]
    NotOwner,

    /// Address range overlaps an existing region
    #[error("address range in use")]
    AddressInUse,

    /// Resource is in use by another thread
    #[error("resource busy")]
    Busy,

    // ========== Wait Outcomes ==========

    /// Non-blocking request could not be satisfied
    #[error("operation would block")]
    WouldBlock,

    /// Deadline passed before the resource became available
    #[error("timed out")]
    TimedOut,

    /// A signal ended the wait
    #[error("interrupted")]
    Interrupted,

    /// No child matches the wait request
    #[error("no child processes")]
    NoChildren,
}

/// Error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Allocation failed
    ResourceExhaustion,
    /// Unknown or stale id
    InvalidHandle,
    /// Request refused, no effect
    PolicyViolation,
    /// Blocking operation ended early
    WaitOutcome,
}

impl KernelError {
    /// Classify error
    pub const fn class(self) -> ErrorClass {
        match self {
            KernelError::OutOfMemory
            | KernelError::AddressSpaceExhausted
            | KernelError::TableFull => ErrorClass::ResourceExhaustion,
            KernelError::InvalidHandle | KernelError::InvalidArgument => ErrorClass::InvalidHandle,
            KernelError::Deadlock
            | KernelError::NotOwner
            | KernelError::AddressInUse
            | KernelError::Busy => ErrorClass::PolicyViolation,
            KernelError::WouldBlock
            | KernelError::TimedOut
            | KernelError::Interrupted
            | KernelError::NoChildren => ErrorClass::WaitOutcome,
        }
    }

    /// Negative value returned to callers of the syscall interface
    pub const fn errno(self) -> isize {
        match self {
            KernelError::NotOwner => -1,
            KernelError::InvalidHandle => -3,
            KernelError::Interrupted => -4,
            KernelError::NoChildren => -10,
            KernelError::WouldBlock => -11,
            KernelError::OutOfMemory => -12,
            KernelError::Busy => -16,
            KernelError::AddressInUse => -17,
            KernelError::InvalidArgument => -22,
            KernelError::TableFull => -23,
            KernelError::Deadlock => -35,
            KernelError::TimedOut => -62,
            KernelError::AddressSpaceExhausted => -75,
        }
    }

    /// Inverse of [`KernelError::errno`]
    pub const fn from_errno(code: isize) -> Option<Self> {
        Some(match code {
            -1 => KernelError::NotOwner,
            -3 => KernelError::InvalidHandle,
            -4 => KernelError::Interrupted,
            -10 => KernelError::NoChildren,
            -11 => KernelError::WouldBlock,
            -12 => KernelError::OutOfMemory,
            -16 => KernelError::Busy,
            -17 => KernelError::AddressInUse,
            -22 => KernelError::InvalidArgument,
            -23 => KernelError::TableFull,
            -35 => KernelError::Deadlock,
            -62 => KernelError::TimedOut,
            -75 => KernelError::AddressSpaceExhausted,
            _ => return None,
        })
    }
}
