//! Kernel Configuration
//!
//! Tunables for the scheduler, memory layout and table sizes. Every field
//! has a default, so a partial configuration deserializes cleanly.

use crate::{KernelError, KernelResult, KERNEL_SPACE_BASE, PAGE_SIZE, USER_SPACE_END};
use serde::{Deserialize, Serialize};

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Timer interrupt rate in Hz
    pub tick_rate: u32,

    /// Quantum granted to a thread, in ticks
    pub quantum_ticks: u32,

    /// Priority of threads created without an explicit one
    pub default_priority: u8,

    /// Kernel stack size, in pages
    pub kernel_stack_pages: usize,

    /// Default user stack size in bytes
    pub user_stack_size: usize,

    /// Physical memory managed by the frame allocator
    pub memory: MemoryConfig,

    /// Table capacities
    pub limits: LimitsConfig,
}

/// Physical and virtual memory layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// First physical address handed out
    pub phys_base: u64,

    /// Number of physical frames
    pub frames: usize,

    /// User half of the address space `[start, end)`
    pub user_start: u64,
    /// End of the user half
    pub user_end: u64,

    /// Kernel half of the address space `[start, end)`
    pub kernel_start: u64,
    /// End of the kernel half
    pub kernel_end: u64,
}

/// Table capacities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum live threads
    pub max_threads: usize,
    /// Maximum live processes
    pub max_processes: usize,
    /// Maximum locks in one namespace
    pub max_locks: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tick_rate: 100,
            quantum_ticks: 10,
            default_priority: crate::sys::thread::Priority::NORMAL.value(),
            kernel_stack_pages: 4,
            user_stack_size: 256 * 1024,
            memory: MemoryConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            phys_base: 0x0010_0000,
            frames: 16 * 1024,
            user_start: 0x0040_0000,
            user_end: USER_SPACE_END,
            kernel_start: KERNEL_SPACE_BASE,
            kernel_end: 0xFFFF_FFFF_FFFF_F000,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_threads: 4096,
            max_processes: 1024,
            max_locks: 4096,
        }
    }
}

impl KernelConfig {
    /// Default configuration
    pub fn standard() -> Self {
        Self::default()
    }

    /// Compact layout: little physical memory and small address halves
    pub fn small() -> Self {
        Self {
            quantum_ticks: 2,
            kernel_stack_pages: 1,
            user_stack_size: 4 * PAGE_SIZE,
            memory: MemoryConfig {
                frames: 1024,
                user_start: 0x0040_0000,
                user_end: 0x0080_0000,
                kernel_start: KERNEL_SPACE_BASE,
                kernel_end: KERNEL_SPACE_BASE + 0x0040_0000,
                ..MemoryConfig::default()
            },
            limits: LimitsConfig {
                max_threads: 256,
                max_processes: 64,
                max_locks: 256,
            },
            ..Self::default()
        }
    }

    /// Same configuration with a different frame budget
    pub fn with_frames(mut self, frames: usize) -> Self {
        self.memory.frames = frames;
        self
    }

    /// Milliseconds per timer tick
    pub fn tick_ms(&self) -> u64 {
        1000 / self.tick_rate as u64
    }

    /// Convert a duration to ticks, rounding up
    pub fn duration_to_ticks(&self, duration: core::time::Duration) -> u64 {
        let rate = self.tick_rate as u128;
        let ticks = (duration.as_nanos() * rate).div_ceil(1_000_000_000);
        ticks.min(u64::MAX as u128) as u64
    }

    /// Validate configuration
    pub fn validate(&self) -> KernelResult<()> {
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(KernelError::InvalidArgument);
        }

        if self.quantum_ticks == 0 || self.kernel_stack_pages == 0 {
            return Err(KernelError::InvalidArgument);
        }

        if self.default_priority as usize >= crate::sys::thread::NUM_PRIORITIES {
            return Err(KernelError::InvalidArgument);
        }

        if self.user_stack_size == 0 || self.user_stack_size % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }

        let mem = &self.memory;
        let page = PAGE_SIZE as u64;
        let aligned = [mem.phys_base, mem.user_start, mem.user_end, mem.kernel_start, mem.kernel_end]
            .iter()
            .all(|a| a % page == 0);
        if !aligned || mem.frames == 0 {
            return Err(KernelError::InvalidArgument);
        }

        if mem.user_start >= mem.user_end
            || mem.kernel_start >= mem.kernel_end
            || mem.user_end > mem.kernel_start
        {
            return Err(KernelError::InvalidArgument);
        }

        let limits = &self.limits;
        if limits.max_threads == 0 || limits.max_processes == 0 || limits.max_locks == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if limits.max_threads > crate::table::MAX_SLOTS
            || limits.max_processes > crate::table::MAX_SLOTS
            || limits.max_locks > crate::table::MAX_SLOTS
        {
            return Err(KernelError::InvalidArgument);
        }

        Ok(())
    }
}
