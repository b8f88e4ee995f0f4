//! Memory Contexts
//!
//! A memory context is the address space of one process: the sorted set of
//! user regions it owns, a shared view of the kernel regions, and the page
//! tables that map both.
//!
//! ```text
//! MemoryContext (user)                 KernelSpace (shared)
//! ┌───────────────────────┐            ┌───────────────────────┐
//! │ regions: [text, heap, │            │ regions: RwLock<[..]> │
//! │           stack]      │──refers───▶│ root: PML4 of kernel  │
//! │ tables: PML4 ─────────┼──kernel────┤                       │
//! └───────────────────────┘  half      └───────────────────────┘
//! ```
//!
//! Only the kernel context creates, resizes or removes kernel regions.
//! User contexts see them through the shared list and the shared kernel
//! half of their page tables.

use super::region::{RegionIds, RegionRef};
use super::{
    is_page_aligned, Backing, FramePool, PageTables, PhysAddr, Region, RegionFlags, RegionId,
    VirtAddr,
};
use crate::config::MemoryConfig;
use crate::{KernelError, KernelResult, PAGE_SIZE};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

/// Sorted kernel regions, shared by every context
pub type SharedRegions = Arc<RwLock<Vec<RegionRef>>>;

/// Bounds of the two halves of the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLayout {
    /// First user address
    pub user_start: VirtAddr,
    /// End of user half (exclusive)
    pub user_end: VirtAddr,
    /// First kernel address
    pub kernel_start: VirtAddr,
    /// End of kernel half (exclusive)
    pub kernel_end: VirtAddr,
}

impl AddressLayout {
    /// Build from configuration
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            user_start: VirtAddr::new(config.user_start),
            user_end: VirtAddr::new(config.user_end),
            kernel_start: VirtAddr::new(config.kernel_start),
            kernel_end: VirtAddr::new(config.kernel_end),
        }
    }

    /// Bounds of one half
    pub fn half(&self, kernel: bool) -> (VirtAddr, VirtAddr) {
        if kernel {
            (self.kernel_start, self.kernel_end)
        } else {
            (self.user_start, self.user_end)
        }
    }

    /// Which half `[start, end)` lies in, if entirely inside one
    pub fn half_of(&self, start: VirtAddr, end: VirtAddr) -> Option<bool> {
        [false, true].into_iter().find(|&kernel| {
            let (lo, hi) = self.half(kernel);
            start >= lo && end <= hi && start < end
        })
    }
}

/// Handle to the kernel half, used to build new contexts
#[derive(Clone)]
pub struct KernelSpace {
    root: PhysAddr,
    regions: SharedRegions,
    layout: AddressLayout,
}

impl KernelSpace {
    /// Root of the kernel page tables
    pub fn root(&self) -> PhysAddr {
        self.root
    }
}

/// Memory usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Regions in the user half
    pub regions: usize,
    /// Bytes reserved by user regions
    pub virtual_bytes: usize,
    /// Bytes backed by frames owned by user regions
    pub resident_bytes: usize,
}

/// Address space of one process
pub struct MemoryContext {
    pool: Arc<FramePool>,
    layout: AddressLayout,
    tables: PageTables,
    kernel_root: PhysAddr,
    /// User regions, sorted by start address
    regions: Vec<RegionRef>,
    kernel: SharedRegions,
    /// Set for the kernel's own context
    owns_kernel_half: bool,
}

/// Index of the first region starting at or after `addr`
fn position(list: &[RegionRef], addr: VirtAddr) -> usize {
    list.partition_point(|r| r.start() < addr)
}

fn lookup(list: &[RegionRef], addr: VirtAddr) -> Option<&RegionRef> {
    let after = list.partition_point(|r| r.start() <= addr);
    after.checked_sub(1).map(|i| &list[i]).filter(|r| r.contains(addr))
}

fn check_free(list: &[RegionRef], start: VirtAddr, end: VirtAddr) -> KernelResult<()> {
    if list.iter().any(|r| r.overlaps(start, end)) {
        return Err(KernelError::AddressInUse);
    }
    Ok(())
}

fn first_fit(list: &[RegionRef], lo: VirtAddr, hi: VirtAddr, size: usize) -> KernelResult<VirtAddr> {
    let size = size as u64;
    let mut cursor = lo;
    for region in list {
        if region.end() <= cursor {
            continue;
        }
        if region.start() >= cursor && region.start().as_u64() - cursor.as_u64() >= size {
            return Ok(cursor);
        }
        cursor = cursor.max(region.end());
    }

    if hi > cursor && hi.as_u64() - cursor.as_u64() >= size {
        Ok(cursor)
    } else {
        Err(KernelError::AddressSpaceExhausted)
    }
}

impl MemoryContext {
    /// Create the kernel's context
    pub fn new_kernel(pool: &Arc<FramePool>, layout: AddressLayout) -> KernelResult<Self> {
        let tables = PageTables::new_kernel(pool, layout.kernel_start, layout.kernel_end)?;
        Ok(Self {
            pool: pool.clone(),
            layout,
            kernel_root: tables.root(),
            tables,
            regions: Vec::new(),
            kernel: Arc::new(RwLock::new(Vec::new())),
            owns_kernel_half: true,
        })
    }

    /// Create an empty user context with the kernel half pre-installed
    pub fn new_user(pool: &Arc<FramePool>, space: &KernelSpace) -> KernelResult<Self> {
        let tables = PageTables::new_user(pool, space.root)?;
        Ok(Self {
            pool: pool.clone(),
            layout: space.layout,
            tables,
            kernel_root: space.root,
            regions: Vec::new(),
            kernel: space.regions.clone(),
            owns_kernel_half: false,
        })
    }

    /// Handle used to create user contexts sharing this kernel half
    pub fn kernel_space(&self) -> KernelSpace {
        KernelSpace {
            root: self.kernel_root,
            regions: self.kernel.clone(),
            layout: self.layout,
        }
    }

    /// Root of the page tables (loaded on context switch)
    pub fn root(&self) -> PhysAddr {
        self.tables.root()
    }

    /// Address layout
    pub fn layout(&self) -> AddressLayout {
        self.layout
    }

    /// Page tables
    pub fn tables(&self) -> &PageTables {
        &self.tables
    }

    /// User regions in address order
    pub fn user_regions(&self) -> &[RegionRef] {
        &self.regions
    }

    /// Kernel regions in address order
    pub fn kernel_regions(&self) -> Vec<RegionRef> {
        self.kernel.read().clone()
    }

    /// Create a region and insert it
    ///
    /// With `at` unset the first unmapped range that fits is used.
    pub fn create_region(
        &mut self,
        id: RegionId,
        name: &str,
        at: Option<VirtAddr>,
        size: usize,
        flags: RegionFlags,
        backing: Backing,
    ) -> KernelResult<RegionRef> {
        if size == 0 || !is_page_aligned(size) {
            return Err(KernelError::InvalidArgument);
        }
        if let Backing::Remapped { phys } = backing {
            if !phys.is_aligned() {
                return Err(KernelError::InvalidArgument);
            }
        }

        let kernel = flags.contains(RegionFlags::KERNEL);
        let start = match at {
            Some(addr) if !addr.is_aligned() => return Err(KernelError::InvalidArgument),
            Some(addr) => addr,
            None => self.find_unmapped(size, kernel)?,
        };
        if start.checked_offset(size as u64).is_none() {
            return Err(KernelError::InvalidArgument);
        }

        let region = Arc::new(Region::new(id, name, start, size, flags, backing));
        self.insert_region(region.clone())?;

        log::debug!(
            "Region {} ({}) at {:#x}..{:#x} {:?}",
            id,
            name,
            start.as_u64(),
            region.end().as_u64(),
            flags
        );
        Ok(region)
    }

    /// Insert a region, mapping its eager, remapped and resident pages
    ///
    /// Rejected requests leave the context unchanged.
    pub fn insert_region(&mut self, region: RegionRef) -> KernelResult<()> {
        let kernel = region.is_kernel();
        if kernel && !self.owns_kernel_half {
            return Err(KernelError::InvalidArgument);
        }

        let (start, end) = (region.start(), region.end());
        if self.layout.half_of(start, end) != Some(kernel) {
            return Err(KernelError::InvalidArgument);
        }

        if kernel {
            check_free(&self.kernel.read(), start, end)?;
        } else {
            check_free(&self.regions, start, end)?;
        }

        self.map_pages(&region, 0)?;

        if kernel {
            let mut list = self.kernel.write();
            let index = position(&list, start);
            list.insert(index, region);
        } else {
            let index = position(&self.regions, start);
            self.regions.insert(index, region);
        }
        Ok(())
    }

    /// Map pages from `first` on; unmaps what it mapped on failure
    fn map_pages(&mut self, region: &Region, first: u64) -> KernelResult<()> {
        let flags = region.flags().page_flags();
        let eager = region.flags().contains(RegionFlags::EAGER);
        let mut mapped = Vec::new();

        for index in first..region.page_count() {
            let phys = if let Some(phys) = region.remapped_phys(index) {
                phys
            } else if let Some(phys) = region.frame_at(index) {
                phys
            } else if eager {
                match self.pool.allocate() {
                    Ok(frame) => {
                        let phys = frame.addr();
                        region.insert_page(index, frame);
                        phys
                    }
                    Err(err) => {
                        self.unmap_all(region, &mapped);
                        region.truncate_pages(first);
                        return Err(err);
                    }
                }
            } else {
                continue;
            };

            if let Err(err) = self.tables.map(region.page_addr(index), phys, flags) {
                self.unmap_all(region, &mapped);
                if eager {
                    region.truncate_pages(first);
                }
                return Err(err);
            }
            mapped.push(index);
        }

        Ok(())
    }

    fn unmap_all(&mut self, region: &Region, pages: &[u64]) {
        for &index in pages {
            self.tables.unmap(region.page_addr(index));
        }
    }

    fn unmap_range(&mut self, region: &Region, first: u64, last: u64) {
        for index in first..last {
            self.tables.unmap(region.page_addr(index));
        }
    }

    /// Remove a region by id, unmapping its pages
    pub fn remove_region(&mut self, id: RegionId) -> KernelResult<RegionRef> {
        let region = if let Some(index) = self.regions.iter().position(|r| r.id() == id) {
            self.regions.remove(index)
        } else if self.owns_kernel_half {
            let mut list = self.kernel.write();
            let index = list.iter().position(|r| r.id() == id).ok_or(KernelError::InvalidHandle)?;
            list.remove(index)
        } else {
            return Err(KernelError::InvalidHandle);
        };

        self.unmap_range(&region, 0, region.page_count());
        log::debug!("Region {} ({}) removed", region.id(), region.name());
        Ok(region)
    }

    /// Region containing `addr`
    pub fn find_region(&self, addr: VirtAddr) -> Option<RegionRef> {
        if addr >= self.layout.kernel_start {
            lookup(&self.kernel.read(), addr).cloned()
        } else {
            lookup(&self.regions, addr).cloned()
        }
    }

    /// Region by id
    pub fn region(&self, id: RegionId) -> Option<RegionRef> {
        self.regions
            .iter()
            .find(|r| r.id() == id)
            .cloned()
            .or_else(|| self.kernel.read().iter().find(|r| r.id() == id).cloned())
    }

    /// First unmapped range of `size` bytes in one half
    pub fn find_unmapped(&self, size: usize, kernel: bool) -> KernelResult<VirtAddr> {
        let (lo, hi) = self.layout.half(kernel);
        if kernel {
            first_fit(&self.kernel.read(), lo, hi, size)
        } else {
            first_fit(&self.regions, lo, hi, size)
        }
    }

    /// Grow or shrink a region in place
    pub fn resize_region(&mut self, id: RegionId, new_size: usize) -> KernelResult<()> {
        if new_size == 0 || !is_page_aligned(new_size) {
            return Err(KernelError::InvalidArgument);
        }

        let region = self.region(id).ok_or(KernelError::InvalidHandle)?;
        let kernel = region.is_kernel();
        if kernel && !self.owns_kernel_half {
            return Err(KernelError::InvalidArgument);
        }

        let old_size = region.size();
        let old_pages = region.page_count();
        let new_pages = (new_size / PAGE_SIZE) as u64;

        if new_size > old_size {
            let (_, hi) = self.layout.half(kernel);
            let new_end = match region.start().checked_offset(new_size as u64) {
                Some(end) if end <= hi => end,
                _ => return Err(KernelError::AddressSpaceExhausted),
            };

            let collides = |list: &[RegionRef]| {
                list.iter().any(|r| r.id() != id && r.overlaps(region.start(), new_end))
            };
            let blocked = if kernel { collides(&self.kernel.read()) } else { collides(&self.regions) };
            if blocked {
                return Err(KernelError::AddressInUse);
            }

            region.set_size(new_size);
            if let Err(err) = self.map_pages(&region, old_pages) {
                region.set_size(old_size);
                return Err(err);
            }
        } else if new_size < old_size {
            self.unmap_range(&region, new_pages, old_pages);
            region.truncate_pages(new_pages);
            region.set_size(new_size);
        }

        Ok(())
    }

    /// Back the page containing `addr`, returning the physical address
    ///
    /// This is the part of page-fault handling the core owns: anonymous and
    /// file pages get a zeroed frame, remapped pages their fixed frame.
    pub fn fault_in(&mut self, addr: VirtAddr, write: bool) -> KernelResult<PhysAddr> {
        let region = self.find_region(addr).ok_or(KernelError::InvalidArgument)?;
        if write && !region.flags().contains(RegionFlags::WRITE) {
            return Err(KernelError::InvalidArgument);
        }
        if region.is_kernel() && !self.owns_kernel_half {
            return Err(KernelError::InvalidArgument);
        }
        if let Some((phys, _)) = self.tables.translate(addr) {
            return Ok(phys);
        }

        let index = (addr.align_down().as_u64() - region.start().as_u64()) / PAGE_SIZE as u64;
        let phys = match region.remapped_phys(index) {
            Some(phys) => phys,
            None => {
                let frame = self.pool.allocate()?;
                let phys = frame.addr();
                region.insert_page(index, frame);
                phys
            }
        };

        if let Err(err) = self.tables.map(region.page_addr(index), phys, region.flags().page_flags()) {
            region.remove_page(index);
            return Err(err);
        }

        log::trace!("Faulted in {:#x} -> {:#x}", addr.align_down().as_u64(), phys.as_u64());
        Ok(phys.offset(addr.page_offset() as u64))
    }

    /// Copy bytes into the address space, faulting pages in as needed
    pub fn write_bytes(&mut self, addr: VirtAddr, data: &[u8]) -> KernelResult<()> {
        let mut done = 0;
        while done < data.len() {
            let at = addr.offset(done as u64);
            let chunk = (PAGE_SIZE - at.page_offset()).min(data.len() - done);
            let phys = self.fault_in(at, true)?;
            self.pool.memory().write(phys, &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copy bytes out of the address space, faulting pages in as needed
    pub fn read_bytes(&mut self, addr: VirtAddr, buf: &mut [u8]) -> KernelResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let at = addr.offset(done as u64);
            let chunk = (PAGE_SIZE - at.page_offset()).min(buf.len() - done);
            let phys = self.fault_in(at, false)?;
            self.pool.memory().read(phys, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Clone for a forked process
    ///
    /// Kernel regions are shared; each user region is duplicated under a
    /// fresh id according to its backing policy. On failure everything
    /// built so far is released.
    pub fn fork(&self, ids: &RegionIds) -> KernelResult<MemoryContext> {
        let mut child = MemoryContext::new_user(&self.pool, &self.kernel_space())?;
        for region in &self.regions {
            let copy = Arc::new(region.duplicate(ids.next())?);
            child.insert_region(copy)?;
        }
        Ok(child)
    }

    /// Remove every user region, keeping the kernel half
    pub fn release_user_regions(&mut self) {
        let regions = core::mem::take(&mut self.regions);
        for region in &regions {
            self.unmap_range(region, 0, region.page_count());
        }
        if !regions.is_empty() {
            log::debug!("Released {} user regions", regions.len());
        }
    }

    /// Usage counters for the user half
    pub fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            regions: self.regions.len(),
            virtual_bytes: self.regions.iter().map(|r| r.size()).sum(),
            resident_bytes: self.regions.iter().map(|r| r.resident_pages() * PAGE_SIZE).sum(),
        }
    }

    /// Verify structural invariants
    ///
    /// Regions are sorted, disjoint and inside their half, and every owned
    /// frame is mapped at its page.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        let check_list = |list: &[RegionRef], kernel: bool| -> Result<(), &'static str> {
            for pair in list.windows(2) {
                if pair[0].end() > pair[1].start() {
                    return Err("regions overlap or are unsorted");
                }
            }
            for region in list {
                if self.layout.half_of(region.start(), region.end()) != Some(kernel) {
                    return Err("region outside its half");
                }
                if region.is_kernel() != kernel {
                    return Err("region in the wrong half");
                }
            }
            Ok(())
        };

        check_list(&self.regions, false)?;
        check_list(&self.kernel.read(), true)?;

        for region in &self.regions {
            for index in region.resident_indices() {
                let mapped = self.tables.translate(region.page_addr(index)).map(|(phys, _)| phys);
                if mapped != region.frame_at(index) {
                    return Err("resident page not mapped to its frame");
                }
            }
        }
        Ok(())
    }
}

impl Drop for MemoryContext {
    fn drop(&mut self) {
        self.release_user_regions();
        if self.owns_kernel_half {
            let regions = core::mem::take(&mut *self.kernel.write());
            for region in &regions {
                self.unmap_range(region, 0, region.page_count());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{FileRef, SimulatedMemory};
    use crate::KernelConfig;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Fixture {
        pool: Arc<FramePool>,
        kernel: MemoryContext,
        ids: RegionIds,
    }

    fn fixture(frames: usize) -> Fixture {
        let config = KernelConfig::small();
        let pool = FramePool::new(
            PhysAddr::new(config.memory.phys_base),
            frames,
            Arc::new(SimulatedMemory::new()),
        )
        .unwrap();
        let kernel = MemoryContext::new_kernel(&pool, AddressLayout::from_config(&config.memory)).unwrap();
        Fixture { pool, kernel, ids: RegionIds::new() }
    }

    impl Fixture {
        fn user(&self) -> MemoryContext {
            MemoryContext::new_user(&self.pool, &self.kernel.kernel_space()).unwrap()
        }
    }

    const PAGE: usize = PAGE_SIZE;

    #[test]
    fn test_first_fit_between_regions() {
        let f = fixture(256);
        let mut ctx = f.user();
        let base = ctx.layout().user_start;

        let a = ctx.create_region(f.ids.next(), "a", None, 2 * PAGE, RegionFlags::DATA, Backing::Anonymous).unwrap();
        assert_eq!(a.start(), base);
        let b = ctx.create_region(f.ids.next(), "b", None, PAGE, RegionFlags::DATA, Backing::Anonymous).unwrap();
        assert_eq!(b.start(), base.offset(2 * PAGE as u64));

        ctx.remove_region(a.id()).unwrap();
        let c = ctx.create_region(f.ids.next(), "c", None, PAGE, RegionFlags::DATA, Backing::Anonymous).unwrap();
        assert_eq!(c.start(), base);

        // Too big for the hole, goes after b
        let d = ctx.create_region(f.ids.next(), "d", None, 2 * PAGE, RegionFlags::DATA, Backing::Anonymous).unwrap();
        assert_eq!(d.start(), b.end());
        ctx.check_invariants().unwrap();
    }

    #[test]
    fn test_overlap_rejected_without_effect() {
        let f = fixture(256);
        let mut ctx = f.user();
        let base = ctx.layout().user_start;
        ctx.create_region(f.ids.next(), "a", Some(base), 4 * PAGE, RegionFlags::DATA, Backing::Anonymous).unwrap();

        let err = ctx.create_region(
            f.ids.next(),
            "b",
            Some(base.offset(3 * PAGE as u64)),
            2 * PAGE,
            RegionFlags::DATA,
            Backing::Anonymous,
        );
        assert_eq!(err.unwrap_err(), KernelError::AddressInUse);
        assert_eq!(ctx.user_regions().len(), 1);
    }

    #[test]
    fn test_bad_sizes() {
        let f = fixture(64);
        let mut ctx = f.user();
        for size in [0, 100, PAGE + 1] {
            let err = ctx.create_region(f.ids.next(), "x", None, size, RegionFlags::DATA, Backing::Anonymous);
            assert_eq!(err.unwrap_err(), KernelError::InvalidArgument);
        }
    }

    #[test]
    fn test_user_context_cannot_create_kernel_region() {
        let f = fixture(64);
        let mut ctx = f.user();
        let err = ctx.create_region(
            f.ids.next(),
            "k",
            None,
            PAGE,
            RegionFlags::DATA | RegionFlags::KERNEL,
            Backing::Anonymous,
        );
        assert_eq!(err.unwrap_err(), KernelError::InvalidArgument);
    }

    #[test]
    fn test_eager_region_backed_and_unwound() {
        let f = fixture(64);
        let mut ctx = f.user();
        let stack = ctx.create_region(f.ids.next(), "stack", None, 4 * PAGE, RegionFlags::USER_STACK, Backing::Anonymous).unwrap();
        assert_eq!(stack.resident_pages(), 4);
        assert_eq!(ctx.tables().mapped_pages(), 4);

        // Not enough frames left for a huge eager region
        let free = f.pool.free_frames();
        let err = ctx.create_region(f.ids.next(), "big", None, 128 * PAGE, RegionFlags::USER_STACK, Backing::Anonymous);
        assert_eq!(err.unwrap_err(), KernelError::OutOfMemory);
        assert_eq!(f.pool.free_frames(), free);
        assert_eq!(ctx.user_regions().len(), 1);
        ctx.check_invariants().unwrap();
    }

    #[test]
    fn test_lazy_fault_in() {
        let f = fixture(64);
        let mut ctx = f.user();
        let heap = ctx.create_region(f.ids.next(), "heap", None, 4 * PAGE, RegionFlags::DATA, Backing::Anonymous).unwrap();
        assert_eq!(heap.resident_pages(), 0);

        ctx.write_bytes(heap.start().offset(PAGE as u64 + 10), b"hello").unwrap();
        assert_eq!(heap.resident_pages(), 1);

        let mut buf = [0u8; 5];
        ctx.read_bytes(heap.start().offset(PAGE as u64 + 10), &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // Unmapped address
        let err = ctx.read_bytes(heap.end().offset(PAGE as u64), &mut buf);
        assert_eq!(err.unwrap_err(), KernelError::InvalidArgument);
        ctx.check_invariants().unwrap();
    }

    #[test]
    fn test_write_to_read_only_region_rejected() {
        let f = fixture(64);
        let mut ctx = f.user();
        let text = ctx
            .create_region(f.ids.next(), "text", None, PAGE, RegionFlags::READ | RegionFlags::EXEC, Backing::File { file: FileRef(3), offset: 0 })
            .unwrap();
        assert_eq!(ctx.write_bytes(text.start(), b"x").unwrap_err(), KernelError::InvalidArgument);
        let mut buf = [1u8; 4];
        ctx.read_bytes(text.start(), &mut buf).unwrap();
        assert_eq!(buf, [0u8; 4]);
    }

    #[test]
    fn test_resize_checks_neighbour() {
        let f = fixture(64);
        let mut ctx = f.user();
        let base = ctx.layout().user_start;
        let a = ctx.create_region(f.ids.next(), "a", Some(base), PAGE, RegionFlags::DATA, Backing::Anonymous).unwrap();
        ctx.create_region(f.ids.next(), "b", Some(base.offset(3 * PAGE as u64)), PAGE, RegionFlags::DATA, Backing::Anonymous).unwrap();

        ctx.resize_region(a.id(), 3 * PAGE).unwrap();
        assert_eq!(a.size(), 3 * PAGE);
        assert_eq!(ctx.resize_region(a.id(), 4 * PAGE), Err(KernelError::AddressInUse));
        assert_eq!(a.size(), 3 * PAGE);
        assert_eq!(ctx.resize_region(a.id(), 0), Err(KernelError::InvalidArgument));
        assert_eq!(ctx.resize_region(RegionId(999), PAGE), Err(KernelError::InvalidHandle));
        ctx.check_invariants().unwrap();
    }

    #[test]
    fn test_sizes_past_top_of_space_rejected() {
        let f = fixture(64);
        let mut ctx = f.user();
        let a = ctx.create_region(f.ids.next(), "a", None, PAGE, RegionFlags::DATA, Backing::Anonymous).unwrap();

        for size in [0xFFFF_FFFF_FFFF_0000, usize::MAX & !(PAGE - 1)] {
            assert_eq!(ctx.resize_region(a.id(), size), Err(KernelError::AddressSpaceExhausted));
            assert_eq!(a.size(), PAGE);
        }

        let top = VirtAddr::new(0xFFFF_FFFF_FFFF_F000);
        assert_eq!(top.checked_offset(2 * PAGE as u64), None);
        let err = ctx.create_region(f.ids.next(), "top", Some(top), 2 * PAGE, RegionFlags::DATA, Backing::Anonymous);
        assert_eq!(err.err(), Some(KernelError::InvalidArgument));
        assert_eq!(ctx.user_regions().len(), 1);
        ctx.check_invariants().unwrap();
    }

    #[test]
    fn test_shrink_releases_frames() {
        let f = fixture(64);
        let mut ctx = f.user();
        let stack = ctx.create_region(f.ids.next(), "stack", None, 4 * PAGE, RegionFlags::USER_STACK, Backing::Anonymous).unwrap();
        let free = f.pool.free_frames();
        ctx.resize_region(stack.id(), PAGE).unwrap();
        assert_eq!(stack.resident_pages(), 1);
        assert!(f.pool.free_frames() >= free + 3);
        ctx.resize_region(stack.id(), 2 * PAGE).unwrap();
        assert_eq!(stack.resident_pages(), 2);
        ctx.check_invariants().unwrap();
    }

    #[test]
    fn test_remapped_region_maps_fixed_frames() {
        let f = fixture(64);
        let mut ctx = f.user();
        let phys = PhysAddr::new(0xFD00_0000);
        let fb = ctx.create_region(f.ids.next(), "fb", None, 2 * PAGE, RegionFlags::DATA, Backing::Remapped { phys }).unwrap();
        assert_eq!(ctx.tables().translate(fb.start().offset(PAGE as u64)).unwrap().0, phys.offset(PAGE as u64));
        assert_eq!(fb.resident_pages(), 0);
        ctx.check_invariants().unwrap();
    }

    #[test]
    fn test_kernel_regions_visible_in_user_contexts() {
        let mut f = fixture(64);
        let user = f.user();
        let id = f.ids.next();
        let heap = f
            .kernel
            .create_region(id, "kheap", None, 2 * PAGE, RegionFlags::DATA | RegionFlags::KERNEL | RegionFlags::EAGER, Backing::Anonymous)
            .unwrap();

        let seen = user.find_region(heap.start()).unwrap();
        assert!(Arc::ptr_eq(&seen, &heap));
        assert!(user.tables().translate(heap.start()).is_some());

        f.kernel.remove_region(id).unwrap();
        assert!(user.find_region(heap.start()).is_none());
    }

    #[test]
    fn test_fork_copies_not_aliases() {
        let f = fixture(128);
        let mut parent = f.user();
        let heap = parent.create_region(f.ids.next(), "heap", None, 4 * PAGE, RegionFlags::DATA, Backing::Anonymous).unwrap();
        parent.create_region(f.ids.next(), "stack", None, 2 * PAGE, RegionFlags::USER_STACK, Backing::Anonymous).unwrap();
        parent.write_bytes(heap.start(), b"parent").unwrap();

        let mut child = parent.fork(&f.ids).unwrap();
        assert_eq!(child.user_regions().len(), 2);
        for (p, c) in parent.user_regions().iter().zip(child.user_regions()) {
            assert_eq!(p.start(), c.start());
            assert_eq!(p.size(), c.size());
            assert_eq!(p.flags(), c.flags());
            assert_eq!(p.resident_pages(), c.resident_pages());
            assert_ne!(p.id(), c.id());
        }

        child.write_bytes(heap.start(), b"child!").unwrap();
        let mut buf = [0u8; 6];
        parent.read_bytes(heap.start(), &mut buf).unwrap();
        assert_eq!(&buf, b"parent");

        let child_heap = child.find_region(heap.start()).unwrap();
        child.resize_region(child_heap.id(), 8 * PAGE).unwrap();
        assert_eq!(heap.size(), 4 * PAGE);

        parent.check_invariants().unwrap();
        child.check_invariants().unwrap();
    }

    #[test]
    fn test_fork_failure_releases_everything() {
        let f = fixture(36);
        let mut parent = f.user();
        parent.create_region(f.ids.next(), "stack", None, 16 * PAGE, RegionFlags::USER_STACK, Backing::Anonymous).unwrap();
        let free = f.pool.free_frames();
        assert!(free < 16);

        assert_eq!(parent.fork(&f.ids).err(), Some(KernelError::OutOfMemory));
        assert_eq!(f.pool.free_frames(), free);
    }

    #[test]
    fn test_release_user_regions_keeps_kernel_half() {
        let mut f = fixture(64);
        f.kernel
            .create_region(f.ids.next(), "kdata", None, PAGE, RegionFlags::DATA | RegionFlags::KERNEL | RegionFlags::EAGER, Backing::Anonymous)
            .unwrap();
        let mut user = f.user();
        user.create_region(f.ids.next(), "heap", None, 2 * PAGE, RegionFlags::USER_STACK, Backing::Anonymous).unwrap();

        user.release_user_regions();
        assert!(user.user_regions().is_empty());
        assert_eq!(user.kernel_regions().len(), 1);
        assert_eq!(user.usage(), MemoryUsage::default());
    }

    #[test]
    fn test_dropping_context_returns_frames() {
        let f = fixture(64);
        let free = f.pool.free_frames();
        {
            let mut ctx = f.user();
            ctx.create_region(f.ids.next(), "stack", None, 4 * PAGE, RegionFlags::USER_STACK, Backing::Anonymous).unwrap();
            ctx.write_bytes(ctx.layout().user_start.offset(0x10), b"x").unwrap();
        }
        assert_eq!(f.pool.free_frames(), free);
    }

    #[test]
    fn test_random_operations_never_overlap() {
        let f = fixture(512);
        let mut ctx = f.user();
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut live: Vec<RegionId> = Vec::new();
        let (lo, hi) = ctx.layout().half(false);
        let span_pages = ((hi.as_u64() - lo.as_u64()) / PAGE as u64) as usize;

        for _ in 0..2000 {
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let pages = rng.gen_range(1..8);
                    let at = if rng.gen_bool(0.5) {
                        Some(lo.offset((rng.gen_range(0..span_pages) * PAGE) as u64))
                    } else {
                        None
                    };
                    if let Ok(region) = ctx.create_region(f.ids.next(), "r", at, pages * PAGE, RegionFlags::DATA, Backing::Anonymous) {
                        live.push(region.id());
                    }
                }
                2 if !live.is_empty() => {
                    let id = live.swap_remove(rng.gen_range(0..live.len()));
                    ctx.remove_region(id).unwrap();
                }
                3 if !live.is_empty() => {
                    let id = live[rng.gen_range(0..live.len())];
                    let _ = ctx.resize_region(id, rng.gen_range(1..8) * PAGE);
                }
                _ => {}
            }
            ctx.check_invariants().unwrap();
            assert_eq!(ctx.user_regions().len(), live.len());
        }
    }
}
