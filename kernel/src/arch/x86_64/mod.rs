//! x86_64 Bare Metal
//!
//! Single-CPU port. Kernel threads run on their own kernel stacks, reached
//! through the direct physical mapping at [`PHYS_MEM_OFFSET`]. Extended
//! state is switched lazily: every switch sets `CR0.TS`, and the embedder's
//! device-not-available handler calls
//! [`Kernel::extended_state_trap`](crate::sys::Kernel::extended_state_trap).
//!
//! Interrupt routing (IDT, PIC) belongs to the embedder. Its timer handler
//! calls [`Kernel::timer_interrupt`](crate::sys::Kernel::timer_interrupt).

pub mod serial;

use super::{Arch, CpuId, KernelEntry, TrapFrame};
use crate::mm::frame::DirectMap;
use crate::mm::{PhysAddr, PhysicalMemory};
use crate::sys::thread::KernelStack;
use crate::{KernelError, KernelResult, PHYS_MEM_OFFSET};
use alloc::boxed::Box;
use alloc::sync::Arc;

const CR0_TS: u64 = 1 << 3;
const RFLAGS_IF: u64 = 1 << 9;

/// PIT input clock (Hz)
const PIT_FREQUENCY: u32 = 1_193_182;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// Callee-saved registers of a suspended kernel flow
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
}

/// User registers saved on kernel entry
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct UserFrame {
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub r10: u64,
    pub r8: u64,
    pub r9: u64,
    pub rax: u64,
    /// Pushed onto the user stack by the return path when set
    pub ret_addr: u64,
}

impl TrapFrame for UserFrame {
    fn pc(&self) -> u64 {
        self.rip
    }

    fn set_pc(&mut self, pc: u64) {
        self.rip = pc;
    }

    fn sp(&self) -> u64 {
        self.rsp
    }

    fn set_sp(&mut self, sp: u64) {
        self.rsp = sp;
    }

    fn arg(&self, index: usize) -> u64 {
        match index {
            0 => self.rdi,
            1 => self.rsi,
            2 => self.rdx,
            3 => self.r10,
            4 => self.r8,
            5 => self.r9,
            _ => 0,
        }
    }

    fn set_arg(&mut self, index: usize, value: u64) {
        let slot = match index {
            0 => &mut self.rdi,
            1 => &mut self.rsi,
            2 => &mut self.rdx,
            3 => &mut self.r10,
            4 => &mut self.r8,
            5 => &mut self.r9,
            _ => return,
        };
        *slot = value;
    }

    fn set_return_address(&mut self, addr: u64) {
        self.ret_addr = addr;
    }

    fn set_return_value(&mut self, value: u64) {
        self.rax = value;
    }
}

/// `fxsave` area
#[repr(C, align(16))]
struct FxArea([u8; 512]);

/// Saved state of a thread
pub struct X86Context {
    regs: Registers,
    frame: UserFrame,
    fx: Box<FxArea>,
}

/// First call of a new thread, reclaimed by [`thread_start`]
struct Start {
    entry: fn(usize) -> i32,
    arg: usize,
    hooks: Arc<dyn KernelEntry>,
}

/// Register blocks a switch moves between
pub struct X86Switch {
    from: *mut Registers,
    to: *const Registers,
}

/// Bare-metal backend
pub struct X86_64 {
    memory: Arc<DirectMap>,
}

impl X86_64 {
    /// Create backend
    ///
    /// # Safety
    /// All physical memory must be mapped at [`PHYS_MEM_OFFSET`].
    pub unsafe fn new() -> Self {
        Self { memory: Arc::new(DirectMap::new(PHYS_MEM_OFFSET)) }
    }

    /// Program the PIT for `rate` Hz
    pub fn init_timer(rate: u32) {
        let divisor = PIT_FREQUENCY / rate.max(19);
        unsafe {
            // Channel 0, lobyte/hibyte, rate generator
            outb(PIT_COMMAND, 0x36);
            outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
            outb(PIT_CHANNEL0, ((divisor >> 8) & 0xFF) as u8);
        }
        log::debug!("PIT programmed at {} Hz", rate);
    }

    fn start_context(&self, start: Start, stack: &KernelStack, frame: UserFrame, fx: Box<FxArea>) -> X86Context {
        let top = (stack.top().as_u64() + PHYS_MEM_OFFSET) & !0xF;
        let start = Box::into_raw(Box::new(start));
        X86Context {
            regs: Registers {
                rip: thread_trampoline as usize as u64,
                rsp: top - 8,
                r12: start as u64,
                ..Registers::default()
            },
            frame,
            fx,
        }
    }
}

impl Arch for X86_64 {
    type Context = X86Context;
    type Entry = fn(usize) -> i32;
    type Frame = UserFrame;
    type Switch = X86Switch;

    fn cpu_count(&self) -> usize {
        1
    }

    fn current_cpu(&self) -> CpuId {
        0
    }

    fn idle(&self) -> bool {
        unsafe { core::arch::asm!("sti", "hlt", options(nomem, nostack)) };
        false
    }

    fn kick_cpu(&self, _cpu: CpuId) {}

    fn physical_memory(&self) -> Arc<dyn PhysicalMemory> {
        self.memory.clone()
    }

    fn bootstrap_context(&self, _cpu: CpuId) -> KernelResult<X86Context> {
        Ok(X86Context {
            regs: Registers::default(),
            frame: UserFrame::default(),
            fx: Box::new(FxArea([0; 512])),
        })
    }

    fn idle_context(
        &self,
        _cpu: CpuId,
        _stack: &KernelStack,
        _hooks: Arc<dyn KernelEntry>,
    ) -> KernelResult<X86Context> {
        Err(KernelError::InvalidArgument)
    }

    fn new_context(
        &self,
        entry: fn(usize) -> i32,
        arg: usize,
        stack: &KernelStack,
        hooks: Arc<dyn KernelEntry>,
    ) -> KernelResult<X86Context> {
        let mut frame = UserFrame { rflags: RFLAGS_IF, ..UserFrame::default() };
        frame.set_arg(0, arg as u64);
        let fx = Box::new(FxArea([0; 512]));
        Ok(self.start_context(Start { entry, arg, hooks }, stack, frame, fx))
    }

    fn fork_context(
        &self,
        parent: &X86Context,
        entry: fn(usize) -> i32,
        arg: usize,
        stack: &KernelStack,
        hooks: Arc<dyn KernelEntry>,
    ) -> KernelResult<X86Context> {
        let fx = Box::new(FxArea(parent.fx.0));
        Ok(self.start_context(Start { entry, arg, hooks }, stack, parent.frame.clone(), fx))
    }

    fn start_cpu(&self, _cpu: CpuId, _context: &X86Context) {}

    fn frame<'a>(&self, context: &'a X86Context) -> &'a UserFrame {
        &context.frame
    }

    fn frame_mut<'a>(&self, context: &'a mut X86Context) -> &'a mut UserFrame {
        &mut context.frame
    }

    fn save_extended(&self, context: &mut X86Context) {
        unsafe {
            core::arch::asm!("clts", "fxsave64 [{}]", in(reg) context.fx.0.as_mut_ptr(), options(nostack));
        }
    }

    fn load_extended(&self, context: &mut X86Context) {
        unsafe {
            core::arch::asm!("clts", "fxrstor64 [{}]", in(reg) context.fx.0.as_ptr(), options(nostack));
        }
    }

    fn switch_address_space(&self, root: PhysAddr) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack));
        }
    }

    unsafe fn prepare_switch(&self, from: &mut X86Context, to: &mut X86Context, _cpu: CpuId) -> X86Switch {
        // First extended-register use of the incoming thread traps
        let cr0: u64;
        core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack));
        core::arch::asm!("mov cr0, {}", in(reg) cr0 | CR0_TS, options(nostack));

        X86Switch { from: &mut from.regs, to: &to.regs }
    }

    unsafe fn switch(&self, switch: X86Switch) {
        switch_context(switch.from, switch.to);
    }

    unsafe fn switch_final(&self, switch: X86Switch) -> ! {
        let mut scratch = Registers::default();
        switch_context(&mut scratch, switch.to);
        loop {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

/// Disable interrupts, returning whether they were enabled
#[inline]
pub fn interrupts_disable() -> bool {
    let rflags: u64;
    unsafe {
        core::arch::asm!("pushfq", "pop {}", "cli", out(reg) rflags, options(nomem));
    }
    rflags & RFLAGS_IF != 0
}

/// Enable interrupts
#[inline]
pub fn interrupts_enable() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
}

/// Halt until the next interrupt
#[inline]
pub fn hlt() {
    unsafe { core::arch::asm!("hlt", options(nomem, nostack)) }
}

/// First Rust code of a new thread
extern "C" fn thread_start(start: *mut Start) -> ! {
    let Start { entry, arg, hooks } = *unsafe { Box::from_raw(start) };
    hooks.thread_started();
    interrupts_enable();
    let code = entry(arg);
    hooks.thread_returned(code)
}

/// Entry of a fresh context: the start block arrives in r12
#[unsafe(naked)]
unsafe extern "C" fn thread_trampoline() -> ! {
    core::arch::naked_asm!(
        "mov rdi, r12",
        "and rsp, -16",
        "call {start}",
        "ud2",
        start = sym thread_start,
    );
}

/// Save callee-saved registers into `old`, resume `new`
///
/// # Safety
/// - Both register blocks must be valid
/// - Must be called with no spinlock held
#[unsafe(naked)]
unsafe extern "C" fn switch_context(_old: *mut Registers, _new: *const Registers) {
    core::arch::naked_asm!(
        // Save old context
        "mov [rdi + 0x00], rbx",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], r12",
        "mov [rdi + 0x18], r13",
        "mov [rdi + 0x20], r14",
        "mov [rdi + 0x28], r15",
        "mov rax, [rsp]",
        "mov [rdi + 0x30], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x38], rax",

        // Load new context
        "mov rbx, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov r12, [rsi + 0x10]",
        "mov r13, [rsi + 0x18]",
        "mov r14, [rsi + 0x20]",
        "mov r15, [rsi + 0x28]",
        "mov rsp, [rsi + 0x38]",
        "jmp [rsi + 0x30]",
    );
}

#[inline]
pub(crate) unsafe fn outb(port: u16, value: u8) {
    core::arch::asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
}

#[inline]
pub(crate) unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    core::arch::asm!("in al, dx", in("dx") port, out("al") value, options(nomem, nostack, preserves_flags));
    value
}
