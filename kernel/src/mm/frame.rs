//! Physical Frame Allocator
//!
//! Bitmap-based allocator for physical memory frames, wrapped in a shared
//! [`FramePool`] that hands out RAII [`Frame`] handles. Dropping a handle
//! returns the frame, so unwinding a half-finished allocation is just
//! dropping what was built so far.

use super::PhysAddr;
use crate::{KernelError, KernelResult, PAGE_SIZE};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

/// Physical frame allocator using a bitmap
pub struct FrameAllocator {
    /// Bitmap of frame usage (1 = free, 0 = used)
    bitmap: Vec<u64>,
    /// Base physical address
    base: u64,
    /// Total number of frames
    total_frames: usize,
    /// Number of free frames
    free_count: usize,
    /// Next frame to check (for allocation speedup)
    next_free: usize,
}

impl FrameAllocator {
    /// Create allocator managing `frames` frames starting at `base`
    pub fn new(base: PhysAddr, frames: usize) -> KernelResult<Self> {
        if !base.is_aligned() || frames == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let mut bitmap = vec![u64::MAX; frames.div_ceil(64)];

        // Tail bits past the last frame stay used
        let tail = frames % 64;
        if tail != 0 {
            if let Some(last) = bitmap.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }

        Ok(Self {
            bitmap,
            base: base.as_u64(),
            total_frames: frames,
            free_count: frames,
            next_free: 0,
        })
    }

    fn addr_of(&self, frame: usize) -> u64 {
        (frame * PAGE_SIZE) as u64 + self.base
    }

    /// Allocate a single frame
    pub fn allocate(&mut self) -> KernelResult<u64> {
        // Start searching from hint
        let start = self.next_free / 64;

        for i in 0..self.bitmap.len() {
            let idx = (start + i) % self.bitmap.len();
            let entry = self.bitmap[idx];

            if entry != 0 {
                let bit = entry.trailing_zeros() as usize;
                let frame = idx * 64 + bit;

                self.bitmap[idx] &= !(1 << bit);
                self.free_count -= 1;
                self.next_free = frame + 1;

                return Ok(self.addr_of(frame));
            }
        }

        Err(KernelError::OutOfMemory)
    }

    /// Allocate contiguous frames
    pub fn allocate_contiguous(&mut self, count: usize) -> KernelResult<u64> {
        if count == 0 {
            return Err(KernelError::InvalidArgument);
        }

        if count == 1 {
            return self.allocate();
        }

        let mut run_start = 0;
        let mut run_length = 0;

        for frame in 0..self.total_frames {
            let idx = frame / 64;
            let bit = frame % 64;

            if self.bitmap[idx] & (1 << bit) != 0 {
                if run_length == 0 {
                    run_start = frame;
                }
                run_length += 1;

                if run_length >= count {
                    for f in run_start..run_start + count {
                        self.bitmap[f / 64] &= !(1 << (f % 64));
                    }
                    self.free_count -= count;
                    self.next_free = run_start + count;

                    return Ok(self.addr_of(run_start));
                }
            } else {
                run_length = 0;
            }
        }

        Err(KernelError::OutOfMemory)
    }

    /// Deallocate a frame
    pub fn deallocate(&mut self, addr: u64) -> KernelResult<()> {
        if addr < self.base {
            return Err(KernelError::InvalidArgument);
        }

        let frame = ((addr - self.base) as usize) / PAGE_SIZE;

        if frame >= self.total_frames {
            return Err(KernelError::InvalidArgument);
        }

        let idx = frame / 64;
        let bit = frame % 64;

        if self.bitmap[idx] & (1 << bit) != 0 {
            log::warn!("Double free of frame at {:#x}", addr);
            return Err(KernelError::InvalidArgument);
        }

        self.bitmap[idx] |= 1 << bit;
        self.free_count += 1;

        if frame < self.next_free {
            self.next_free = frame;
        }

        Ok(())
    }

    /// Get number of free frames
    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    /// Get total number of frames
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }
}

/// Access to the bytes behind physical frames
pub trait PhysicalMemory: Send + Sync {
    /// Fill a frame with zeroes
    fn zero(&self, frame: PhysAddr);

    /// Copy one whole frame onto another
    fn copy(&self, dst: PhysAddr, src: PhysAddr);

    /// Read bytes starting at `addr`; must not cross a frame boundary
    fn read(&self, addr: PhysAddr, buf: &mut [u8]);

    /// Write bytes starting at `addr`; must not cross a frame boundary
    fn write(&self, addr: PhysAddr, data: &[u8]);
}

/// Frame contents kept on the heap, for hosted kernels
///
/// Frames never written read back as zeroes.
#[derive(Default)]
pub struct SimulatedMemory {
    frames: Mutex<BTreeMap<u64, Box<[u8]>>>,
}

impl SimulatedMemory {
    /// Create empty memory
    pub fn new() -> Self {
        Self::default()
    }
}

impl PhysicalMemory for SimulatedMemory {
    fn zero(&self, frame: PhysAddr) {
        self.frames.lock().remove(&frame.align_down().as_u64());
    }

    fn copy(&self, dst: PhysAddr, src: PhysAddr) {
        let mut frames = self.frames.lock();
        match frames.get(&src.align_down().as_u64()).cloned() {
            Some(bytes) => {
                frames.insert(dst.align_down().as_u64(), bytes);
            }
            None => {
                frames.remove(&dst.align_down().as_u64());
            }
        }
    }

    fn read(&self, addr: PhysAddr, buf: &mut [u8]) {
        let offset = addr.page_offset();
        let frames = self.frames.lock();
        match frames.get(&addr.align_down().as_u64()) {
            Some(bytes) => buf.copy_from_slice(&bytes[offset..offset + buf.len()]),
            None => buf.fill(0),
        }
    }

    fn write(&self, addr: PhysAddr, data: &[u8]) {
        let offset = addr.page_offset();
        let mut frames = self.frames.lock();
        let bytes = frames
            .entry(addr.align_down().as_u64())
            .or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// Physical memory reached through the kernel's direct mapping
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    /// Create accessor for a direct mapping at `offset`
    ///
    /// # Safety
    /// All managed physical memory must be mapped writable at `offset`.
    pub const unsafe fn new(offset: u64) -> Self {
        Self { offset }
    }

    fn ptr(&self, addr: PhysAddr) -> *mut u8 {
        (addr.as_u64() + self.offset) as *mut u8
    }
}

impl PhysicalMemory for DirectMap {
    fn zero(&self, frame: PhysAddr) {
        unsafe { core::ptr::write_bytes(self.ptr(frame.align_down()), 0, PAGE_SIZE) }
    }

    fn copy(&self, dst: PhysAddr, src: PhysAddr) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.ptr(src.align_down()),
                self.ptr(dst.align_down()),
                PAGE_SIZE,
            )
        }
    }

    fn read(&self, addr: PhysAddr, buf: &mut [u8]) {
        unsafe { core::ptr::copy_nonoverlapping(self.ptr(addr), buf.as_mut_ptr(), buf.len()) }
    }

    fn write(&self, addr: PhysAddr, data: &[u8]) {
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr(addr), data.len()) }
    }
}

/// Shared frame allocator plus the memory behind it
pub struct FramePool {
    allocator: Mutex<FrameAllocator>,
    memory: Arc<dyn PhysicalMemory>,
}

impl FramePool {
    /// Create pool
    pub fn new(
        base: PhysAddr,
        frames: usize,
        memory: Arc<dyn PhysicalMemory>,
    ) -> KernelResult<Arc<Self>> {
        Ok(Arc::new(Self {
            allocator: Mutex::new(FrameAllocator::new(base, frames)?),
            memory,
        }))
    }

    /// Allocate one zeroed frame
    pub fn allocate(self: &Arc<Self>) -> KernelResult<Frame> {
        let addr = PhysAddr::new(self.allocator.lock().allocate()?);
        self.memory.zero(addr);
        Ok(Frame { addr, pool: self.clone() })
    }

    /// Allocate `count` physically contiguous zeroed frames
    pub fn allocate_run(self: &Arc<Self>, count: usize) -> KernelResult<FrameRun> {
        let start = PhysAddr::new(self.allocator.lock().allocate_contiguous(count)?);
        for i in 0..count {
            self.memory.zero(start.offset((i * PAGE_SIZE) as u64));
        }
        Ok(FrameRun { start, count, pool: self.clone() })
    }

    /// Memory behind the frames
    pub fn memory(&self) -> &dyn PhysicalMemory {
        &*self.memory
    }

    /// Frames currently free
    pub fn free_frames(&self) -> usize {
        self.allocator.lock().free_frames()
    }

    /// Frames managed
    pub fn total_frames(&self) -> usize {
        self.allocator.lock().total_frames()
    }

    fn release(&self, addr: PhysAddr) {
        // Double frees are logged by the allocator
        let _ = self.allocator.lock().deallocate(addr.as_u64());
    }
}

/// One owned physical frame, returned to its pool on drop
pub struct Frame {
    addr: PhysAddr,
    pool: Arc<FramePool>,
}

impl Frame {
    /// Physical address
    pub fn addr(&self) -> PhysAddr {
        self.addr
    }

    /// Allocate a new frame holding a copy of this one
    pub fn duplicate(&self) -> KernelResult<Frame> {
        let copy = self.pool.allocate()?;
        self.pool.memory.copy(copy.addr, self.addr);
        Ok(copy)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#x})", self.addr.as_u64())
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.pool.release(self.addr);
    }
}

/// Physically contiguous owned frames
pub struct FrameRun {
    start: PhysAddr,
    count: usize,
    pool: Arc<FramePool>,
}

impl FrameRun {
    /// First frame
    pub fn start(&self) -> PhysAddr {
        self.start
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.count * PAGE_SIZE
    }
}

impl fmt::Debug for FrameRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameRun({:#x}, {} frames)", self.start.as_u64(), self.count)
    }
}

impl Drop for FrameRun {
    fn drop(&mut self) {
        for i in 0..self.count {
            self.pool.release(self.start.offset((i * PAGE_SIZE) as u64));
        }
    }
}
