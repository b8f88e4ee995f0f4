//! Page Table Management
//!
//! 4-level page tables for x86_64:
//! - PML4 (Page Map Level 4)
//! - PDPT (Page Directory Pointer Table)
//! - PD (Page Directory)
//! - PT (Page Table)
//!
//! Tables live in frames from the [`FramePool`] and are read and written
//! through [`PhysicalMemory`](super::PhysicalMemory), so the same walker runs
//! on hardware and in hosted builds. Intermediate tables are counted: a
//! table whose last entry is cleared is freed and unlinked from its parent.
//!
//! Kernel-half PDPTs are allocated once by the kernel context and linked
//! into every other root, which is how kernel mappings are shared.

use super::{Frame, FramePool, PhysAddr, VirtAddr};
use crate::{KernelError, KernelResult};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use bitflags::bitflags;

/// Number of entries per page table
pub const ENTRIES_PER_TABLE: usize = 512;

/// First PML4 slot of the kernel half
pub const KERNEL_PML4_START: usize = 256;

bitflags! {
    /// Page table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Page is present in memory
        const PRESENT = 1 << 0;
        /// Page is writable
        const WRITABLE = 1 << 1;
        /// Page is accessible from user mode
        const USER = 1 << 2;
        /// Write-through caching
        const WRITE_THROUGH = 1 << 3;
        /// Disable caching
        const NO_CACHE = 1 << 4;
        /// Page has been accessed
        const ACCESSED = 1 << 5;
        /// Page has been written to
        const DIRTY = 1 << 6;
        /// Huge page (2MB or 1GB)
        const HUGE = 1 << 7;
        /// Global (not flushed on CR3 switch)
        const GLOBAL = 1 << 8;
        /// No execute (requires NXE bit in EFER)
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    /// Kernel data flags (read-write, no execute)
    pub const KERNEL_DATA: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::GLOBAL).union(Self::NO_EXECUTE);

    /// User data flags
    pub const USER_DATA: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER).union(Self::NO_EXECUTE);
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Page table entry
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Create empty entry
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create entry with address and flags
    pub fn new(addr: PhysAddr, flags: PageFlags) -> Self {
        Self((addr.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Raw entry
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Get flags
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Get physical address
    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    /// Check if entry is present
    pub fn is_present(&self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    /// Check if entry is unused
    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("addr", &format_args!("{:#x}", self.addr().as_u64()))
            .field("flags", &self.flags())
            .finish()
    }
}

/// Bookkeeping for one intermediate table
struct TableFrame {
    frame: Frame,
    /// Present entries
    used: usize,
}

/// Page tables of one memory context
pub struct PageTables {
    pool: Arc<FramePool>,
    root: Frame,
    /// Intermediate tables owned by this context, keyed by physical address
    tables: BTreeMap<u64, TableFrame>,
    /// Leaf mappings
    mapped: usize,
}

impl PageTables {
    /// Create the kernel's tables with every kernel-half PDPT preallocated
    pub fn new_kernel(pool: &Arc<FramePool>, kernel_start: VirtAddr, kernel_end: VirtAddr) -> KernelResult<Self> {
        let mut tables = Self {
            pool: pool.clone(),
            root: pool.allocate()?,
            tables: BTreeMap::new(),
            mapped: 0,
        };

        let first = kernel_start.page_table_indices()[0].max(KERNEL_PML4_START);
        let last = VirtAddr::new(kernel_end.as_u64() - 1).page_table_indices()[0];
        for index in first..=last {
            let frame = pool.allocate()?;
            let entry = PageTableEntry::new(frame.addr(), PageFlags::PRESENT | PageFlags::WRITABLE);
            tables.write_entry(tables.root.addr(), index, entry);
            // Pinned: never counted down, so never freed while the kernel lives
            tables.tables.insert(frame.addr().as_u64(), TableFrame { frame, used: usize::MAX / 2 });
        }

        Ok(tables)
    }

    /// Create user tables sharing the kernel half of `kernel_root`
    pub fn new_user(pool: &Arc<FramePool>, kernel_root: PhysAddr) -> KernelResult<Self> {
        let tables = Self {
            pool: pool.clone(),
            root: pool.allocate()?,
            tables: BTreeMap::new(),
            mapped: 0,
        };

        for index in KERNEL_PML4_START..ENTRIES_PER_TABLE {
            let entry = tables.read_entry(kernel_root, index);
            if entry.is_present() {
                tables.write_entry(tables.root.addr(), index, entry);
            }
        }

        Ok(tables)
    }

    /// Physical address of the root table (for CR3)
    pub fn root(&self) -> PhysAddr {
        self.root.addr()
    }

    /// Number of leaf mappings
    pub fn mapped_pages(&self) -> usize {
        self.mapped
    }

    /// Number of intermediate table frames owned
    pub fn table_frames(&self) -> usize {
        self.tables.len()
    }

    fn read_entry(&self, table: PhysAddr, index: usize) -> PageTableEntry {
        let mut bytes = [0u8; 8];
        self.pool.memory().read(table.offset((index * 8) as u64), &mut bytes);
        PageTableEntry(u64::from_ne_bytes(bytes))
    }

    fn write_entry(&self, table: PhysAddr, index: usize, entry: PageTableEntry) {
        self.pool.memory().write(table.offset((index * 8) as u64), &entry.0.to_ne_bytes());
    }

    fn count(&mut self, table: PhysAddr, delta: isize) -> bool {
        match self.tables.get_mut(&table.as_u64()) {
            Some(record) => {
                record.used = record.used.saturating_add_signed(delta);
                record.used == 0
            }
            None => false,
        }
    }

    /// Map a page
    pub fn map(&mut self, virt: VirtAddr, phys: PhysAddr, flags: PageFlags) -> KernelResult<()> {
        let indices = virt.page_table_indices();
        let link = PageFlags::PRESENT | PageFlags::WRITABLE | (flags & PageFlags::USER);

        let mut table = self.root.addr();
        for &index in &indices[..3] {
            let entry = self.read_entry(table, index);
            table = if entry.is_present() {
                entry.addr()
            } else {
                let frame = self.pool.allocate()?;
                let next = frame.addr();
                self.write_entry(table, index, PageTableEntry::new(next, link));
                self.count(table, 1);
                self.tables.insert(next.as_u64(), TableFrame { frame, used: 0 });
                next
            };
        }

        if self.read_entry(table, indices[3]).is_present() {
            return Err(KernelError::AddressInUse);
        }

        self.write_entry(table, indices[3], PageTableEntry::new(phys, flags | PageFlags::PRESENT));
        self.count(table, 1);
        self.mapped += 1;
        Ok(())
    }

    /// Unmap a page, freeing tables left empty
    pub fn unmap(&mut self, virt: VirtAddr) -> Option<PhysAddr> {
        let indices = virt.page_table_indices();

        let mut path = [PhysAddr::new(0); 4];
        let mut table = self.root.addr();
        for level in 0..3 {
            path[level] = table;
            let entry = self.read_entry(table, indices[level]);
            if !entry.is_present() {
                return None;
            }
            table = entry.addr();
        }
        path[3] = table;

        let leaf = self.read_entry(table, indices[3]);
        if !leaf.is_present() {
            return None;
        }
        self.write_entry(table, indices[3], PageTableEntry::empty());
        self.mapped -= 1;

        // Walk back up while tables become empty
        for level in (1..4).rev() {
            if !self.count(path[level], -1) {
                break;
            }
            if let Some(record) = self.tables.remove(&path[level].as_u64()) {
                drop(record.frame);
            }
            self.write_entry(path[level - 1], indices[level - 1], PageTableEntry::empty());
            if level - 1 == 0 {
                break;
            }
        }

        Some(leaf.addr())
    }

    /// Translate virtual address to physical
    pub fn translate(&self, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        let indices = virt.page_table_indices();
        let mut table = self.root.addr();
        for &index in &indices[..3] {
            let entry = self.read_entry(table, index);
            if !entry.is_present() {
                return None;
            }
            table = entry.addr();
        }

        let leaf = self.read_entry(table, indices[3]);
        leaf.is_present()
            .then(|| (leaf.addr().offset(virt.page_offset() as u64), leaf.flags()))
    }
}
