//! Memory Operations of the Current Process
//!
//! Thin layer over [`MemoryContext`](crate::mm::MemoryContext): every call
//! takes the calling process's memory mutex, so region changes of one
//! process are serialized while other processes proceed.
//!
//! Regions created by kernel threads land in the kernel half.

use super::process::{Heap, KERNEL_PID};
use super::Kernel;
use crate::arch::Arch;
use crate::mm::{page_align_up, Backing, PhysAddr, RegionFlags, RegionId, RegionInfo, VirtAddr};
use crate::{KernelError, KernelResult, PAGE_SIZE};

impl<A: Arch> Kernel<A> {
    fn region_flags(&self, flags: RegionFlags, kernel: bool) -> KernelResult<RegionFlags> {
        match (kernel, flags.contains(RegionFlags::KERNEL)) {
            (true, _) => Ok(flags | RegionFlags::KERNEL),
            (false, true) => Err(KernelError::InvalidArgument),
            (false, false) => Ok(flags),
        }
    }

    /// Create a region anywhere in the caller's half
    pub fn create_region(
        &self,
        name: &str,
        size: usize,
        flags: RegionFlags,
        backing: Backing,
    ) -> KernelResult<RegionId> {
        self.place_region(name, None, size, flags, backing)
    }

    /// Create a region at a fixed address
    pub fn create_region_at(
        &self,
        name: &str,
        addr: VirtAddr,
        size: usize,
        flags: RegionFlags,
        backing: Backing,
    ) -> KernelResult<RegionId> {
        self.place_region(name, Some(addr), size, flags, backing)
    }

    fn place_region(
        &self,
        name: &str,
        at: Option<VirtAddr>,
        size: usize,
        flags: RegionFlags,
        backing: Backing,
    ) -> KernelResult<RegionId> {
        let process = self.current_process_ref()?;
        let flags = self.region_flags(flags, process.id() == KERNEL_PID)?;
        let mut memory = process.memory.lock(self);
        let region = memory
            .context
            .create_region(self.region_ids.next(), name, at, size, flags, backing)?;
        Ok(region.id())
    }

    /// Grow or shrink a region of the caller
    pub fn resize_region(&self, id: RegionId, size: usize) -> KernelResult<()> {
        let process = self.current_process_ref()?;
        let mut memory = process.memory.lock(self);
        if memory.heap.is_some_and(|heap| heap.region == id) {
            return Err(KernelError::Busy);
        }
        memory.context.resize_region(id, size)
    }

    /// Delete a region of the caller, releasing its frames
    pub fn delete_region(&self, id: RegionId) -> KernelResult<()> {
        let process = self.current_process_ref()?;
        let mut memory = process.memory.lock(self);
        memory.context.remove_region(id)?;
        if memory.heap.is_some_and(|heap| heap.region == id) {
            memory.heap = None;
        }
        Ok(())
    }

    /// Snapshot of a region of the caller
    pub fn region_info(&self, id: RegionId) -> KernelResult<RegionInfo> {
        let process = self.current_process_ref()?;
        let memory = process.memory.lock(self);
        let region = memory.context.region(id).ok_or(KernelError::InvalidHandle)?;
        Ok(region.info())
    }

    /// Region of the caller containing `addr`
    pub fn find_region_for(&self, addr: VirtAddr) -> KernelResult<RegionInfo> {
        let process = self.current_process_ref()?;
        let memory = process.memory.lock(self);
        let region = memory.context.find_region(addr).ok_or(KernelError::InvalidArgument)?;
        Ok(region.info())
    }

    /// Page fault in the caller's address space
    pub fn fault_in(&self, addr: VirtAddr, write: bool) -> KernelResult<PhysAddr> {
        let process = self.current_process_ref()?;
        let mut memory = process.memory.lock(self);
        memory.context.fault_in(addr, write)
    }

    /// Copy bytes into the caller's address space
    pub fn copy_to_user(&self, addr: VirtAddr, data: &[u8]) -> KernelResult<()> {
        let process = self.current_process_ref()?;
        let mut memory = process.memory.lock(self);
        memory.context.write_bytes(addr, data)
    }

    /// Copy bytes out of the caller's address space
    pub fn copy_from_user(&self, addr: VirtAddr, buf: &mut [u8]) -> KernelResult<()> {
        let process = self.current_process_ref()?;
        let mut memory = process.memory.lock(self);
        memory.context.read_bytes(addr, buf)
    }

    /// Move the program break by `increment` bytes, returning the old break
    ///
    /// The first call creates the heap region. The region always covers the
    /// break rounded up to a page and never shrinks below one page.
    pub fn sbrk(&self, increment: isize) -> KernelResult<VirtAddr> {
        let process = self.current_process_ref()?;
        if process.id() == KERNEL_PID {
            return Err(KernelError::InvalidArgument);
        }
        let mut memory = process.memory.lock(self);

        let heap = match memory.heap {
            Some(heap) => heap,
            None => {
                if increment < 0 {
                    return Err(KernelError::InvalidArgument);
                }
                let size = page_align_up(increment as usize).max(PAGE_SIZE);
                let region = memory.context.create_region(
                    self.region_ids.next(),
                    "heap",
                    None,
                    size,
                    RegionFlags::DATA,
                    Backing::Anonymous,
                )?;
                let heap = Heap { region: region.id(), start: region.start(), brk: region.start() };
                memory.heap = Some(heap);
                heap
            }
        };

        let old = heap.brk;
        let used = (old.as_u64() - heap.start.as_u64()) as i128 + increment as i128;
        if used < 0 {
            return Err(KernelError::InvalidArgument);
        }
        let used = usize::try_from(used).map_err(|_| KernelError::AddressSpaceExhausted)?;

        let size = page_align_up(used).max(PAGE_SIZE);
        let current = memory.context.region(heap.region).map(|r| r.size()).ok_or(KernelError::InvalidHandle)?;
        if size != current {
            memory.context.resize_region(heap.region, size)?;
        }

        let brk = heap.start.offset(used as u64);
        memory.heap = Some(Heap { brk, ..heap });
        log::trace!("Process {} break {:#x} -> {:#x}", process.id(), old.as_u64(), brk.as_u64());
        Ok(old)
    }
}
