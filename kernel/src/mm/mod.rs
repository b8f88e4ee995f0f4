//! Memory Management Subsystem
//!
//! Provides per-process virtual memory management:
//! - Physical frame allocator (bitmap-based) with RAII frame handles
//! - Page-table bookkeeping for each memory context
//! - Memory regions with a backing policy
//! - Memory contexts: the sorted region set of one process
//!
//! # Address Space Layout
//!
//! ```text
//! Virtual Address Space (48-bit canonical):
//!
//! 0xFFFF_FFFF_FFFF_FFFF ┌──────────────────────┐
//!                       │    Kernel regions    │  shared by every context
//! 0xFFFF_8000_0000_0000 ├──────────────────────┤
//!                       │    (non-canonical)   │
//! 0x0000_7FFF_FFFF_FFFF ├──────────────────────┤
//!                       │    User regions      │  private to one process
//! 0x0000_0000_0040_0000 ├──────────────────────┤
//!                       │    (unmapped)        │
//! 0x0000_0000_0000_0000 └──────────────────────┘
//! ```
//!
//! The exact bounds of each half come from [`crate::config::MemoryConfig`].

pub mod context;
pub mod frame;
pub mod page;
pub mod region;

use crate::PAGE_SIZE;
use core::fmt;

pub use context::{AddressLayout, MemoryContext, MemoryUsage};
pub use frame::{Frame, FrameAllocator, FramePool, FrameRun, PhysicalMemory, SimulatedMemory};
pub use page::{PageFlags, PageTableEntry, PageTables, ENTRIES_PER_TABLE};
pub use region::{Backing, FileRef, Region, RegionFlags, RegionId, RegionInfo};

/// Round a byte count up to whole pages
pub const fn page_align_up(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Check page alignment of a byte count
pub const fn is_page_aligned(size: usize) -> bool {
    size & (PAGE_SIZE - 1) == 0
}

/// Physical address type (newtype for type safety)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create new physical address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Address `bytes` further on
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Offset within the page
    pub const fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE as u64 - 1)) as usize
    }

    /// Align down to page boundary
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    /// Align up to page boundary
    pub const fn align_up(self) -> Self {
        Self((self.0 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1))
    }

    /// Check if aligned to page boundary
    pub const fn is_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

/// Virtual address type
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create new virtual address
    pub const fn new(addr: u64) -> Self {
        // Ensure canonical form (sign-extend bit 47)
        let addr = if addr & (1 << 47) != 0 {
            addr | 0xFFFF_0000_0000_0000
        } else {
            addr & 0x0000_FFFF_FFFF_FFFF
        };
        Self(addr)
    }

    /// Get raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Address `bytes` further on
    pub const fn offset(self, bytes: u64) -> Self {
        Self::new(self.0 + bytes)
    }

    /// Address `bytes` further on, or `None` past the top of the space
    pub const fn checked_offset(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) => Some(Self::new(addr)),
            None => None,
        }
    }

    /// Offset within the page
    pub const fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE as u64 - 1)) as usize
    }

    /// Page number (address / page size)
    pub const fn page_number(self) -> u64 {
        self.0 / PAGE_SIZE as u64
    }

    /// Align down to page boundary
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    /// Align up to page boundary
    pub const fn align_up(self) -> Self {
        Self::new((self.0 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1))
    }

    /// Check if aligned
    pub const fn is_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }

    /// Get page table indices for this address
    pub fn page_table_indices(self) -> [usize; 4] {
        [
            ((self.0 >> 39) & 0x1FF) as usize, // PML4
            ((self.0 >> 30) & 0x1FF) as usize, // PDPT
            ((self.0 >> 21) & 0x1FF) as usize, // PD
            ((self.0 >> 12) & 0x1FF) as usize, // PT
        ]
    }

    /// Check if this is a user-space address
    pub const fn is_user(self) -> bool {
        self.0 < 0x0000_8000_0000_0000
    }

    /// Check if this is a kernel-space address
    pub const fn is_kernel(self) -> bool {
        self.0 >= 0xFFFF_8000_0000_0000
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}
