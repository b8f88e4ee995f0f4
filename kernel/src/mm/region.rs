//! Memory Regions
//!
//! A region is a contiguous, permission-tagged range of virtual addresses
//! inside one memory context. Regions are shared handles (`Arc<Region>`):
//! kernel regions are referenced from every context, and the frames a
//! region owns go back to the pool when its last handle drops.

use super::{Frame, PageFlags, PhysAddr, VirtAddr};
use crate::{KernelResult, PAGE_SIZE};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

crate::table_key!(
    /// Region ID, unique across the whole kernel
    RegionId
);

bitflags! {
    /// Region flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXEC = 1 << 2;
        /// Lives in the kernel half, shared by every context
        const KERNEL = 1 << 3;
        /// Thread stack
        const STACK = 1 << 4;
        /// Backed by frames at creation instead of on first access
        const EAGER = 1 << 5;
    }
}

impl RegionFlags {
    /// Private read-write data
    pub const DATA: Self = Self::READ.union(Self::WRITE);

    /// User stack: eagerly backed data
    pub const USER_STACK: Self = Self::DATA.union(Self::STACK).union(Self::EAGER);

    /// Page table flags for pages of a region with these flags
    pub fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::PRESENT;
        if self.contains(Self::WRITE) {
            flags |= PageFlags::WRITABLE;
        }
        if !self.contains(Self::EXEC) {
            flags |= PageFlags::NO_EXECUTE;
        }
        if self.contains(Self::KERNEL) {
            flags |= PageFlags::GLOBAL;
        } else {
            flags |= PageFlags::USER;
        }
        flags
    }
}

/// Opaque handle to a file owned by the VFS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileRef(pub u64);

/// Where a region's pages come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Zero-filled on first access
    Anonymous,
    /// Fixed physical range (device memory, framebuffers)
    Remapped {
        /// Physical address of the first page
        phys: PhysAddr,
    },
    /// Contents of a file, loaded on first access
    File {
        /// File handle
        file: FileRef,
        /// Offset of the first page in the file
        offset: u64,
    },
}

/// Snapshot of a region, for introspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    /// Region ID
    pub id: RegionId,
    /// Name
    pub name: String,
    /// Start address
    pub start: VirtAddr,
    /// Size in bytes
    pub size: usize,
    /// Flags
    pub flags: RegionFlags,
    /// Backing policy
    pub backing: Backing,
    /// Pages currently backed by owned frames
    pub resident_pages: usize,
}

struct RegionState {
    size: usize,
    /// Owned frames keyed by page index within the region
    pages: BTreeMap<u64, Frame>,
}

/// Virtual memory region
pub struct Region {
    id: RegionId,
    name: String,
    flags: RegionFlags,
    backing: Backing,
    start: VirtAddr,
    state: Mutex<RegionState>,
}

impl Region {
    /// Create new region
    pub fn new(
        id: RegionId,
        name: &str,
        start: VirtAddr,
        size: usize,
        flags: RegionFlags,
        backing: Backing,
    ) -> Self {
        Self {
            id,
            name: String::from(name),
            flags,
            backing,
            start,
            state: Mutex::new(RegionState { size, pages: BTreeMap::new() }),
        }
    }

    /// Region ID
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flags
    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    /// Backing policy
    pub fn backing(&self) -> Backing {
        self.backing
    }

    /// Start address
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// End address (exclusive)
    pub fn end(&self) -> VirtAddr {
        self.start.offset(self.size() as u64)
    }

    /// Number of pages
    pub fn page_count(&self) -> u64 {
        (self.size() / PAGE_SIZE) as u64
    }

    /// Check if address is in this region
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Check if `[start, end)` overlaps this region
    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.start < end && start < self.end()
    }

    /// Is this a kernel region
    pub fn is_kernel(&self) -> bool {
        self.flags.contains(RegionFlags::KERNEL)
    }

    /// Address of page `index`
    pub fn page_addr(&self, index: u64) -> VirtAddr {
        self.start.offset(index * PAGE_SIZE as u64)
    }

    /// Physical address backing page `index` of a remapped region
    pub fn remapped_phys(&self, index: u64) -> Option<PhysAddr> {
        match self.backing {
            Backing::Remapped { phys } => Some(phys.offset(index * PAGE_SIZE as u64)),
            _ => None,
        }
    }

    /// Owned frame at page `index`
    pub fn frame_at(&self, index: u64) -> Option<PhysAddr> {
        self.state.lock().pages.get(&index).map(Frame::addr)
    }

    /// Pages currently backed by owned frames
    pub fn resident_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Indices of owned pages
    pub fn resident_indices(&self) -> alloc::vec::Vec<u64> {
        self.state.lock().pages.keys().copied().collect()
    }

    pub(crate) fn insert_page(&self, index: u64, frame: Frame) {
        self.state.lock().pages.insert(index, frame);
    }

    pub(crate) fn remove_page(&self, index: u64) -> Option<Frame> {
        self.state.lock().pages.remove(&index)
    }

    pub(crate) fn set_size(&self, size: usize) {
        self.state.lock().size = size;
    }

    /// Drop owned pages at or past `first`, returning their indices
    pub(crate) fn truncate_pages(&self, first: u64) -> alloc::vec::Vec<u64> {
        let mut state = self.state.lock();
        let dropped = state.pages.split_off(&first);
        dropped.keys().copied().collect()
    }

    /// Copy this region for a forked context
    ///
    /// Anonymous regions and writable file mappings get their resident
    /// pages copied. Read-only file mappings start empty and refault.
    /// Remapped regions point at the same physical range.
    pub fn duplicate(&self, id: RegionId) -> KernelResult<Region> {
        let copy = Region::new(id, &self.name, self.start, self.size(), self.flags, self.backing);

        let copy_pages = match self.backing {
            Backing::Anonymous => true,
            Backing::File { .. } => self.flags.contains(RegionFlags::WRITE),
            Backing::Remapped { .. } => false,
        };

        if copy_pages {
            let state = self.state.lock();
            let mut pages = BTreeMap::new();
            for (&index, frame) in &state.pages {
                pages.insert(index, frame.duplicate()?);
            }
            copy.state.lock().pages = pages;
        }

        Ok(copy)
    }

    /// Snapshot for introspection
    pub fn info(&self) -> RegionInfo {
        let state = self.state.lock();
        RegionInfo {
            id: self.id,
            name: self.name.clone(),
            start: self.start,
            size: state.size,
            flags: self.flags,
            backing: self.backing,
            resident_pages: state.pages.len(),
        }
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("start", &self.start)
            .field("size", &self.size())
            .field("flags", &self.flags)
            .finish()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        log::debug!("Region {} ({}) released", self.id, self.name);
    }
}

/// Allocator of kernel-wide region ids
#[derive(Debug)]
pub struct RegionIds {
    next: AtomicU32,
}

impl RegionIds {
    /// Create allocator
    pub const fn new() -> Self {
        Self { next: AtomicU32::new(1) }
    }

    /// Next unused id
    pub fn next(&self) -> RegionId {
        RegionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RegionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a region
pub type RegionRef = Arc<Region>;
