//! μKernel: Kernel Core for μOS
//!
//! The machine-independent heart of the kernel:
//! - Preemptive priority scheduler on one or more CPUs
//! - Processes and threads
//! - Memory contexts built from regions
//! - Blocking locks, semaphores and condition variables
//! - Signals
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  System calls / Kernel API                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │  Processes   │  │   Threads    │  │     Signals      │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │  Scheduler   │  │ Locks / Wait │  │ Memory Contexts  │   │
//! │  │              │  │    Queues    │  │ Regions / Frames │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! ├─────────────────────────────────────────────────────────────┤
//! │            Arch: hosted threads  |  x86_64 bare metal       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use mu_kernel::arch::hosted::{entry, HostedArch};
//! use mu_kernel::sys::{Kernel, Priority};
//! use mu_kernel::KernelConfig;
//!
//! let kernel = Kernel::boot(KernelConfig::small(), HostedArch::new(1)).unwrap();
//! let k = kernel.clone();
//! kernel
//!     .create_kernel_thread("hello", entry(move |_| {
//!         k.yield_now();
//!         0
//!     }), 0, Priority::NORMAL)
//!     .unwrap();
//! kernel.run();
//! assert_eq!(kernel.stats().threads, 0);
//! ```

#![cfg_attr(not(feature = "hosted"), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod mm;
pub mod sync;
pub mod sys;
pub mod table;

pub use config::KernelConfig;
pub use error::{ErrorClass, KernelError, KernelResult};
pub use sys::Kernel;

/// Kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kernel name
pub const NAME: &str = "μKernel";

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Physical memory offset for direct mapping
pub const PHYS_MEM_OFFSET: u64 = 0xFFFF_8000_0000_0000;

/// Start of the kernel half of every address space
pub const KERNEL_SPACE_BASE: u64 = 0xFFFF_8000_0000_0000;

/// End of the user half of every address space
pub const USER_SPACE_END: u64 = 0x0000_7FFF_FFFF_F000;

/// Panic handler
#[cfg(all(not(feature = "hosted"), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    if let Some(location) = info.location() {
        log::error!(
            "KERNEL PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("KERNEL PANIC: {}", info.message());
    }

    loop {
        arch::interrupts::disable();
        #[cfg(target_arch = "x86_64")]
        arch::x86_64::hlt();
    }
}
