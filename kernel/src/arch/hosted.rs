//! Hosted Architecture
//!
//! Runs the kernel inside an ordinary process. Every kernel thread is a
//! host thread parked on a gate; a context switch opens the gate of the
//! incoming thread and parks the outgoing one on its own. At most one
//! thread per simulated CPU is ever past its gate.
//!
//! The thread that boots the kernel becomes the idle thread of CPU 0 and
//! drives the clock: every idle iteration on CPU 0 is one timer tick.
//!
//! A panic inside a kernel thread is recorded and re-raised on the boot
//! thread, so a failing assertion in a test thread fails the test.

use super::{Arch, CpuId, KernelEntry, TrapFrame};
use crate::mm::{PhysAddr, PhysicalMemory, SimulatedMemory};
use crate::sys::thread::KernelStack;
use crate::{KernelError, KernelResult};
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// Entry function of a hosted thread
pub type HostedEntry = Box<dyn FnOnce(usize) -> i32 + Send>;

/// Box a closure as a thread entry
pub fn entry<F>(f: F) -> HostedEntry
where
    F: FnOnce(usize) -> i32 + Send + 'static,
{
    Box::new(f)
}

/// Idle iterations without a context switch before the kernel is
/// declared stuck
pub const DEFAULT_WATCHDOG: u64 = 200_000;

const GATE_POLL: Duration = Duration::from_millis(10);
const SECONDARY_IDLE: Duration = Duration::from_millis(1);
const PRIMARY_IDLE_SMP: Duration = Duration::from_micros(100);

std::thread_local! {
    static CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
}

/// Unwind payload ending a host thread whose kernel thread exited
struct ThreadExit;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Closed,
    Open(CpuId),
    Cancelled,
}

/// Where a parked host thread waits for its turn
struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(GateState::Closed), cond: Condvar::new() })
    }

    fn open(&self, cpu: CpuId) {
        *lock(&self.state) = GateState::Open(cpu);
        self.cond.notify_all();
    }

    fn cancel(&self) {
        *lock(&self.state) = GateState::Cancelled;
        self.cond.notify_all();
    }

    /// Park until opened; `None` when the context was dropped instead
    fn pass(&self, failure: Option<&Failure>) -> Option<CpuId> {
        let mut state = lock(&self.state);
        loop {
            match *state {
                GateState::Open(cpu) => {
                    *state = GateState::Closed;
                    return Some(cpu);
                }
                GateState::Cancelled => return None,
                GateState::Closed => {
                    if let Some(failure) = failure {
                        failure.raise();
                    }
                    state = self
                        .cond
                        .wait_timeout(state, GATE_POLL)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                }
            }
        }
    }
}

/// First panic of any kernel thread
#[derive(Default)]
struct Failure {
    message: Mutex<Option<String>>,
}

impl Failure {
    fn record(&self, payload: Box<dyn Any + Send>) {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("kernel thread panicked")
        };
        log::error!("kernel thread panicked: {}", message);
        lock(&self.message).get_or_insert(message);
    }

    /// Re-raise a recorded failure on the calling thread
    fn raise(&self) {
        if let Some(message) = lock(&self.message).clone() {
            panic!("kernel thread panicked: {}", message);
        }
    }
}

/// Wakeup line of an idle CPU
#[derive(Default)]
struct Kick {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Kick {
    fn raise(&self) {
        *lock(&self.pending) = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let mut pending = lock(&self.pending);
        if !*pending {
            pending = self
                .cond
                .wait_timeout(pending, timeout)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        *pending = false;
    }
}

/// User frame of a hosted thread
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostedFrame {
    /// Program counter
    pub pc: u64,
    /// Stack pointer
    pub sp: u64,
    /// Argument registers
    pub args: [u64; 6],
    /// Return address
    pub ret_addr: u64,
    /// Return value register
    pub ret: u64,
}

impl TrapFrame for HostedFrame {
    fn pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn sp(&self) -> u64 {
        self.sp
    }

    fn set_sp(&mut self, sp: u64) {
        self.sp = sp;
    }

    fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    fn set_arg(&mut self, index: usize, value: u64) {
        if let Some(slot) = self.args.get_mut(index) {
            *slot = value;
        }
    }

    fn set_return_address(&mut self, addr: u64) {
        self.ret_addr = addr;
    }

    fn set_return_value(&mut self, value: u64) {
        self.ret = value;
    }
}

/// Saved state of a hosted thread
pub struct HostedContext {
    gate: Arc<Gate>,
    frame: HostedFrame,
    extended: u64,
    main: bool,
}

impl Drop for HostedContext {
    fn drop(&mut self) {
        if !self.main {
            self.gate.cancel();
        }
    }
}

/// Transfer captured under the scheduler lock
pub struct HostedSwitch {
    from: Arc<Gate>,
    to: Arc<Gate>,
    cpu: CpuId,
    main: bool,
}

/// Architecture backend running on host threads
pub struct HostedArch {
    cpus: usize,
    watchdog: Option<u64>,
    memory: Arc<SimulatedMemory>,
    failure: Arc<Failure>,
    kicks: Vec<Kick>,
    /// Simulated extended register file of each CPU
    extended: Vec<AtomicU64>,
    /// Loaded page-table root of each CPU
    roots: Vec<AtomicU64>,
    gates: Mutex<Vec<Weak<Gate>>>,
}

impl HostedArch {
    /// Create a machine with `cpus` CPUs
    pub fn new(cpus: usize) -> Self {
        let cpus = cpus.max(1);
        Self {
            cpus,
            watchdog: Some(DEFAULT_WATCHDOG),
            memory: Arc::new(SimulatedMemory::new()),
            failure: Arc::new(Failure::default()),
            kicks: (0..cpus).map(|_| Kick::default()).collect(),
            extended: (0..cpus).map(|_| AtomicU64::new(0)).collect(),
            roots: (0..cpus).map(|_| AtomicU64::new(0)).collect(),
            gates: Mutex::new(Vec::new()),
        }
    }

    /// Override the idle watchdog; `None` disables it
    pub fn with_watchdog(mut self, limit: Option<u64>) -> Self {
        self.watchdog = limit;
        self
    }

    /// Extended register of the executing CPU
    pub fn extended_register(&self) -> u64 {
        self.extended[self.current_cpu()].load(Ordering::Acquire)
    }

    /// Overwrite the extended register of the executing CPU
    pub fn set_extended_register(&self, value: u64) {
        self.extended[self.current_cpu()].store(value, Ordering::Release);
    }

    /// Page-table root loaded on `cpu`
    pub fn active_root(&self, cpu: CpuId) -> PhysAddr {
        PhysAddr::new(self.roots[cpu].load(Ordering::Acquire))
    }

    fn track(&self, gate: &Arc<Gate>) {
        let mut gates = lock(&self.gates);
        gates.retain(|g| g.strong_count() > 0);
        gates.push(Arc::downgrade(gate));
    }

    /// Start a host thread that runs `body` once its gate opens
    fn launch<F>(&self, name: String, frame: HostedFrame, extended: u64, body: F) -> KernelResult<HostedContext>
    where
        F: FnOnce() + Send + 'static,
    {
        let gate = Gate::new();
        self.track(&gate);

        let parked = gate.clone();
        let failure = self.failure.clone();
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let Some(cpu) = parked.pass(None) else {
                    return;
                };
                drop(parked);
                CPU.with(|c| c.set(Some(cpu)));

                match panic::catch_unwind(AssertUnwindSafe(body)) {
                    Ok(()) => {}
                    Err(payload) if payload.is::<ThreadExit>() => {}
                    Err(payload) => failure.record(payload),
                }
            })
            .map_err(|_| KernelError::OutOfMemory)?;

        Ok(HostedContext { gate, frame, extended, main: false })
    }

    fn thread_context(
        &self,
        entry: HostedEntry,
        arg: usize,
        frame: HostedFrame,
        extended: u64,
        hooks: Arc<dyn KernelEntry>,
    ) -> KernelResult<HostedContext> {
        self.launch(String::from("kthread"), frame, extended, move || {
            hooks.thread_started();
            let code = entry(arg);
            hooks.thread_returned(code);
        })
    }

    /// Install a stderr logger; later calls are ignored
    pub fn init_logger(level: log::LevelFilter) {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(level);
        }
    }
}

impl Arch for HostedArch {
    type Context = HostedContext;
    type Entry = HostedEntry;
    type Frame = HostedFrame;
    type Switch = HostedSwitch;

    fn cpu_count(&self) -> usize {
        self.cpus
    }

    fn current_cpu(&self) -> CpuId {
        CPU.with(|c| c.get()).unwrap_or(0)
    }

    fn idle(&self) -> bool {
        let cpu = self.current_cpu();
        if cpu == 0 {
            self.failure.raise();
            if self.cpus > 1 {
                self.kicks[0].wait(PRIMARY_IDLE_SMP);
            }
            true
        } else {
            self.kicks[cpu].wait(SECONDARY_IDLE);
            false
        }
    }

    fn kick_cpu(&self, cpu: CpuId) {
        if let Some(kick) = self.kicks.get(cpu) {
            kick.raise();
        }
    }

    fn watchdog_limit(&self) -> Option<u64> {
        self.watchdog
    }

    fn physical_memory(&self) -> Arc<dyn PhysicalMemory> {
        self.memory.clone()
    }

    fn bootstrap_context(&self, cpu: CpuId) -> KernelResult<HostedContext> {
        CPU.with(|c| c.set(Some(cpu)));
        Ok(HostedContext {
            gate: Gate::new(),
            frame: HostedFrame::default(),
            extended: 0,
            main: true,
        })
    }

    fn idle_context(
        &self,
        cpu: CpuId,
        _stack: &KernelStack,
        hooks: Arc<dyn KernelEntry>,
    ) -> KernelResult<HostedContext> {
        self.launch(std::format!("idle/{}", cpu), HostedFrame::default(), 0, move || {
            hooks.idle_loop();
        })
    }

    fn new_context(
        &self,
        entry: HostedEntry,
        arg: usize,
        _stack: &KernelStack,
        hooks: Arc<dyn KernelEntry>,
    ) -> KernelResult<HostedContext> {
        let mut frame = HostedFrame::default();
        frame.set_arg(0, arg as u64);
        self.thread_context(entry, arg, frame, 0, hooks)
    }

    fn fork_context(
        &self,
        parent: &HostedContext,
        entry: HostedEntry,
        arg: usize,
        _stack: &KernelStack,
        hooks: Arc<dyn KernelEntry>,
    ) -> KernelResult<HostedContext> {
        self.thread_context(entry, arg, parent.frame.clone(), parent.extended, hooks)
    }

    fn start_cpu(&self, cpu: CpuId, context: &HostedContext) {
        context.gate.open(cpu);
    }

    fn frame<'a>(&self, context: &'a HostedContext) -> &'a HostedFrame {
        &context.frame
    }

    fn frame_mut<'a>(&self, context: &'a mut HostedContext) -> &'a mut HostedFrame {
        &mut context.frame
    }

    fn save_extended(&self, context: &mut HostedContext) {
        context.extended = self.extended[self.current_cpu()].load(Ordering::Acquire);
    }

    fn load_extended(&self, context: &mut HostedContext) {
        self.extended[self.current_cpu()].store(context.extended, Ordering::Release);
    }

    fn switch_address_space(&self, root: PhysAddr) {
        self.roots[self.current_cpu()].store(root.as_u64(), Ordering::Release);
    }

    unsafe fn prepare_switch(
        &self,
        from: &mut HostedContext,
        to: &mut HostedContext,
        cpu: CpuId,
    ) -> HostedSwitch {
        HostedSwitch { from: from.gate.clone(), to: to.gate.clone(), cpu, main: from.main }
    }

    unsafe fn switch(&self, switch: HostedSwitch) {
        switch.to.open(switch.cpu);
        let failure = switch.main.then_some(&*self.failure);
        match switch.from.pass(failure) {
            Some(cpu) => CPU.with(|c| c.set(Some(cpu))),
            None => panic::resume_unwind(Box::new(ThreadExit)),
        }
    }

    unsafe fn switch_final(&self, switch: HostedSwitch) -> ! {
        switch.to.open(switch.cpu);
        drop(switch);
        panic::resume_unwind(Box::new(ThreadExit))
    }

    fn halt(&self) {
        for kick in &self.kicks {
            kick.raise();
        }
        let gates: Vec<Arc<Gate>> = lock(&self.gates).iter().filter_map(Weak::upgrade).collect();
        for gate in gates {
            let parked = matches!(*lock(&gate.state), GateState::Closed);
            if parked {
                gate.cancel();
            }
        }
    }
}

/// Logger writing to stderr
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let cpu = CPU.with(|c| c.get()).unwrap_or(0);
            std::eprintln!(
                "[{:5}] cpu{} {}:{}: {}",
                record.level(),
                cpu,
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;
