//! Integration tests for mu-kernel
//!
//! Every test boots a hosted kernel, creates its threads from the boot
//! thread and runs until they are all gone. Time is virtual: one tick per
//! idle iteration of CPU 0.

use mu_kernel::arch::hosted::{entry, HostedArch};
use mu_kernel::mm::{Backing, RegionFlags, VirtAddr};
use mu_kernel::sync::{LockFlags, LockKind};
use mu_kernel::sys::*;
use mu_kernel::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Shared<T> = Arc<Mutex<T>>;

fn shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

fn boot_with(config: KernelConfig, cpus: usize) -> Arc<Kernel<HostedArch>> {
    HostedArch::init_logger(log::LevelFilter::Warn);
    Kernel::boot(config, HostedArch::new(cpus)).unwrap()
}

fn boot(cpus: usize) -> Arc<Kernel<HostedArch>> {
    boot_with(KernelConfig::small(), cpus)
}

mod scheduler_tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let kernel = boot(1);
        let order = shared(Vec::new());

        for prio in [20u8, 5, 10] {
            let order = order.clone();
            kernel
                .create_kernel_thread(
                    "prio",
                    entry(move |_| {
                        order.lock().unwrap().push(prio);
                        0
                    }),
                    0,
                    Priority::new(prio).unwrap(),
                )
                .unwrap();
        }

        kernel.run();
        assert_eq!(*order.lock().unwrap(), vec![5, 10, 20]);
    }

    #[test]
    fn test_yield_alternates() {
        let kernel = boot(1);
        let trace = shared(Vec::new());

        for name in ['A', 'B'] {
            let k = kernel.clone();
            let trace = trace.clone();
            kernel
                .create_kernel_thread(
                    "yielder",
                    entry(move |_| {
                        for i in 0..3 {
                            trace.lock().unwrap().push(format!("{}{}", name, i));
                            k.yield_now();
                        }
                        0
                    }),
                    0,
                    Priority::NORMAL,
                )
                .unwrap();
        }

        kernel.run();
        assert_eq!(*trace.lock().unwrap(), ["A0", "B0", "A1", "B1", "A2", "B2"]);
    }

    #[test]
    fn test_quantum_round_robin() {
        let kernel = boot(1);
        assert_eq!(kernel.config().quantum_ticks, 2);
        let trace = shared(String::new());

        for name in ['A', 'B'] {
            let k = kernel.clone();
            let trace = trace.clone();
            kernel
                .create_kernel_thread(
                    "spinner",
                    entry(move |_| {
                        for _ in 0..6 {
                            trace.lock().unwrap().push(name);
                            k.timer_interrupt();
                        }
                        0
                    }),
                    0,
                    Priority::NORMAL,
                )
                .unwrap();
        }

        kernel.run();
        assert_eq!(*trace.lock().unwrap(), "AABBAABBAABB");
    }

    #[test]
    fn test_sleep_measures_ticks() {
        let kernel = boot(1);
        let elapsed = shared(None);

        let k = kernel.clone();
        let out = elapsed.clone();
        kernel
            .create_kernel_thread(
                "sleeper",
                entry(move |_| {
                    let start = k.ticks();
                    k.sleep(Duration::from_millis(100)).unwrap();
                    *out.lock().unwrap() = Some(k.ticks() - start);
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        kernel.run();
        let elapsed = elapsed.lock().unwrap().unwrap();
        assert!((10..=11).contains(&elapsed), "slept {} ticks", elapsed);
    }

    #[test]
    fn test_endless_sleep_ends_on_signal() {
        let kernel = boot(1);
        let outcome = shared(None);

        let k = kernel.clone();
        let out = outcome.clone();
        let sleeper = kernel
            .create_kernel_thread(
                "sleeper",
                entry(move |_| {
                    k.install_handler(Signal::SIGUSR1, SigAction::handler(0x1000, 0x2000)).unwrap();
                    *out.lock().unwrap() = Some(k.sleep(Duration::MAX));
                    assert_eq!(k.handle_signals(), Some(Signal::SIGUSR1));
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        let k = kernel.clone();
        kernel
            .create_kernel_thread(
                "waker",
                entry(move |_| {
                    k.yield_now();
                    k.send_signal(sleeper, Signal::SIGUSR1).unwrap();
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        kernel.run();
        assert_eq!(*outcome.lock().unwrap(), Some(Err(KernelError::Interrupted)));
    }

    #[test]
    fn test_kernel_stack_held_while_thread_lives() {
        let kernel = boot(1);
        let pages = kernel.config().kernel_stack_pages;
        let free = kernel.frame_pool().free_frames();
        let during = shared(None);

        let k = kernel.clone();
        let out = during.clone();
        kernel
            .create_kernel_thread(
                "holder",
                entry(move |_| {
                    *out.lock().unwrap() = Some(k.frame_pool().free_frames());
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();
        assert!(kernel.frame_pool().free_frames() + pages <= free);

        kernel.run();
        assert!(during.lock().unwrap().unwrap() + pages <= free);
        assert_eq!(kernel.frame_pool().free_frames(), free);
    }

    #[test]
    fn test_lazy_extended_state() {
        let kernel = boot(1);

        for value in [1u64, 2] {
            let k = kernel.clone();
            kernel
                .create_kernel_thread(
                    "fpu",
                    entry(move |_| {
                        k.extended_state_trap();
                        k.arch().set_extended_register(value);
                        k.yield_now();
                        k.extended_state_trap();
                        assert_eq!(k.arch().extended_register(), value);
                        0
                    }),
                    0,
                    Priority::NORMAL,
                )
                .unwrap();
        }

        kernel.run();
        let stats = kernel.stats();
        assert_eq!(stats.extended_loads, 4);
        assert_eq!(stats.extended_saves, 2);
    }

    #[test]
    fn test_untouched_extended_state_is_never_saved() {
        let kernel = boot(1);

        for _ in 0..2 {
            let k = kernel.clone();
            kernel
                .create_kernel_thread(
                    "plain",
                    entry(move |_| {
                        for _ in 0..3 {
                            k.yield_now();
                        }
                        0
                    }),
                    0,
                    Priority::NORMAL,
                )
                .unwrap();
        }

        kernel.run();
        assert_eq!(kernel.stats().extended_saves, 0);
        assert_eq!(kernel.stats().extended_loads, 0);
    }

    #[test]
    fn test_address_space_switch_between_processes() {
        let kernel = boot(1);

        for name in ["p1", "p2"] {
            let k = kernel.clone();
            kernel
                .spawn_process(
                    name,
                    entry(move |_| {
                        let root = k.process(k.current_process()).unwrap().root();
                        for _ in 0..3 {
                            assert_eq!(k.arch().active_root(0), root);
                            k.yield_now();
                        }
                        0
                    }),
                    0,
                )
                .unwrap();
        }

        kernel.run();
        assert_eq!(kernel.stats().address_space_switches, 8);
    }

    #[test]
    fn test_threads_of_one_process_share_the_address_space() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .spawn_process(
                "pair",
                entry(move |_| {
                    let k2 = k.clone();
                    k.create_thread(
                        "second",
                        entry(move |_| {
                            for _ in 0..3 {
                                k2.yield_now();
                            }
                            0
                        }),
                        0,
                        Priority::NORMAL,
                        0,
                    )
                    .unwrap();
                    for _ in 0..3 {
                        k.yield_now();
                    }
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
        assert_eq!(kernel.stats().address_space_switches, 1);
    }

    #[test]
    fn test_halt_releases_blocked_threads() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .create_kernel_thread(
                "forever",
                entry(move |_| {
                    let _ = k.sleep(Duration::from_secs(3600));
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        let k = kernel.clone();
        kernel
            .create_kernel_thread(
                "halter",
                entry(move |_| {
                    k.yield_now();
                    k.halt();
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        kernel.run();
        assert!(kernel.is_halted());
    }

    #[test]
    fn test_smp_runs_everything() {
        let kernel = boot(4);
        let done = shared(0usize);

        for _ in 0..8 {
            let k = kernel.clone();
            let done = done.clone();
            kernel
                .create_kernel_thread(
                    "worker",
                    entry(move |_| {
                        for _ in 0..5 {
                            k.yield_now();
                        }
                        *done.lock().unwrap() += 1;
                        0
                    }),
                    0,
                    Priority::NORMAL,
                )
                .unwrap();
        }

        kernel.run();
        assert_eq!(*done.lock().unwrap(), 8);
        assert_eq!(kernel.stats().threads, 0);
    }
}

mod lock_tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_mutual_exclusion_on_four_cpus() {
        let kernel = boot(4);
        let lock = kernel.create_lock("counter", LockKind::Binary, LockFlags::empty(), 1).unwrap();
        let counter = Arc::new(AtomicU64::new(0));

        for _ in 0..6 {
            let k = kernel.clone();
            let counter = counter.clone();
            kernel
                .create_kernel_thread(
                    "incr",
                    entry(move |_| {
                        let mut rng = rand::thread_rng();
                        for _ in 0..30 {
                            k.lock(lock, 1, None).unwrap();
                            let value = counter.load(Ordering::SeqCst);
                            for _ in 0..rng.gen_range(0..3) {
                                k.yield_now();
                            }
                            counter.store(value + 1, Ordering::SeqCst);
                            k.unlock(lock, 1).unwrap();
                        }
                        0
                    }),
                    0,
                    Priority::NORMAL,
                )
                .unwrap();
        }

        kernel.run();
        assert_eq!(counter.load(Ordering::SeqCst), 180);
        let info = kernel.lock_info(lock).unwrap();
        assert_eq!(info.count, 1);
        assert_eq!(info.holder, None);
        assert_eq!(info.waiters, 0);
    }

    #[test]
    fn test_counting_lock_admits_its_count() {
        let kernel = boot(1);
        let sem = kernel.create_lock("pool", LockKind::Counting, LockFlags::empty(), 2).unwrap();
        let inside = shared((0u32, 0u32));

        for _ in 0..4 {
            let k = kernel.clone();
            let inside = inside.clone();
            kernel
                .create_kernel_thread(
                    "user",
                    entry(move |_| {
                        k.lock(sem, 1, None).unwrap();
                        {
                            let mut inside = inside.lock().unwrap();
                            inside.0 += 1;
                            inside.1 = inside.1.max(inside.0);
                        }
                        for _ in 0..3 {
                            k.yield_now();
                        }
                        inside.lock().unwrap().0 -= 1;
                        k.unlock(sem, 1).unwrap();
                        0
                    }),
                    0,
                    Priority::NORMAL,
                )
                .unwrap();
        }

        kernel.run();
        assert_eq!(inside.lock().unwrap().1, 2);
        assert_eq!(kernel.lock_info(sem).unwrap().count, 2);
    }

    /// A greedy head waiter gives up while a released unit waits behind it
    ///
    /// Returns the outcomes of the greedy waiter and of the one queued
    /// after it.
    fn greedy_head_leaves(interrupt: bool) -> (Option<KernelResult<()>>, Option<KernelResult<()>>) {
        let kernel = boot(1);
        let sem = kernel.create_lock("sem", LockKind::Counting, LockFlags::empty(), 0).unwrap();
        let greedy = shared(None);
        let modest = shared(None);

        let k = kernel.clone();
        let out = greedy.clone();
        let timeout = (!interrupt).then(|| Duration::from_millis(50));
        let head = kernel
            .create_kernel_thread(
                "greedy",
                entry(move |_| {
                    k.install_handler(Signal::SIGUSR1, SigAction::handler(0x1000, 0x2000)).unwrap();
                    *out.lock().unwrap() = Some(k.lock(sem, 2, timeout));
                    k.handle_signals();
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        let k = kernel.clone();
        let out = modest.clone();
        kernel
            .create_kernel_thread(
                "modest",
                entry(move |_| {
                    *out.lock().unwrap() = Some(k.lock(sem, 1, None));
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        let k = kernel.clone();
        kernel
            .create_kernel_thread(
                "releaser",
                entry(move |_| {
                    k.unlock(sem, 1).unwrap();
                    let info = k.lock_info(sem).unwrap();
                    assert_eq!((info.count, info.waiters), (1, 2));
                    if interrupt {
                        k.send_signal(head, Signal::SIGUSR1).unwrap();
                    }
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        kernel.run();
        let info = kernel.lock_info(sem).unwrap();
        assert_eq!((info.count, info.waiters), (0, 0));
        let greedy = *greedy.lock().unwrap();
        let modest = *modest.lock().unwrap();
        (greedy, modest)
    }

    #[test]
    fn test_timed_out_head_passes_units_on() {
        let (greedy, modest) = greedy_head_leaves(false);
        assert_eq!(greedy, Some(Err(KernelError::TimedOut)));
        assert_eq!(modest, Some(Ok(())));
    }

    #[test]
    fn test_interrupted_head_passes_units_on() {
        let (greedy, modest) = greedy_head_leaves(true);
        assert_eq!(greedy, Some(Err(KernelError::Interrupted)));
        assert_eq!(modest, Some(Ok(())));
    }

    #[test]
    fn test_timeouts() {
        let kernel = boot(1);
        // Held by the boot thread for the whole test
        let held = kernel.create_lock("held", LockKind::Binary, LockFlags::empty(), 0).unwrap();
        let elapsed = shared(None);

        let k = kernel.clone();
        let out = elapsed.clone();
        kernel
            .create_kernel_thread(
                "waiter",
                entry(move |_| {
                    assert_eq!(k.lock(held, 1, Some(Duration::ZERO)), Err(KernelError::TimedOut));
                    assert_eq!(k.try_lock(held, 1), Err(KernelError::WouldBlock));

                    let start = k.ticks();
                    assert_eq!(
                        k.lock(held, 1, Some(Duration::from_millis(100))),
                        Err(KernelError::TimedOut)
                    );
                    *out.lock().unwrap() = Some(k.ticks() - start);
                    assert_eq!(k.lock_info(held).unwrap().waiters, 0);
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        kernel.run();
        let elapsed = elapsed.lock().unwrap().unwrap();
        assert!((10..=11).contains(&elapsed), "waited {} ticks", elapsed);
    }

    #[test]
    fn test_recursion_and_ownership() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .create_kernel_thread(
                "owner",
                entry(move |_| {
                    let me = k.current_thread();
                    let rec = k.create_lock("rec", LockKind::Binary, LockFlags::RECURSIVE, 1).unwrap();
                    k.lock(rec, 1, None).unwrap();
                    k.lock(rec, 1, None).unwrap();
                    let info = k.lock_info(rec).unwrap();
                    assert_eq!(info.holder, Some(me));
                    assert_eq!(info.depth, 2);
                    k.unlock(rec, 1).unwrap();
                    k.unlock(rec, 1).unwrap();
                    assert_eq!(k.unlock(rec, 1), Err(KernelError::NotOwner));

                    let plain = k.create_lock("plain", LockKind::Binary, LockFlags::empty(), 1).unwrap();
                    k.lock(plain, 1, None).unwrap();
                    assert_eq!(k.lock(plain, 1, None), Err(KernelError::Deadlock));
                    assert_eq!(k.lock(plain, 2, None), Err(KernelError::InvalidArgument));

                    let k2 = k.clone();
                    k.create_kernel_thread(
                        "thief",
                        entry(move |_| {
                            assert_eq!(k2.unlock(plain, 1), Err(KernelError::NotOwner));
                            0
                        }),
                        0,
                        Priority::NORMAL,
                    )
                    .unwrap();
                    k.yield_now();

                    assert_eq!(k.lock_info(plain).unwrap().holder, Some(me));
                    k.unlock(plain, 1).unwrap();
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        kernel.run();
    }

    #[test]
    fn test_delete_fails_waiters() {
        let kernel = boot(1);
        let result = shared(None);

        let k = kernel.clone();
        let out = result.clone();
        kernel
            .create_kernel_thread(
                "deleter",
                entry(move |_| {
                    let lock = k.create_lock("doomed", LockKind::Binary, LockFlags::empty(), 0).unwrap();
                    let k2 = k.clone();
                    k.create_kernel_thread(
                        "waiter",
                        entry(move |_| {
                            *out.lock().unwrap() = Some(k2.lock(lock, 1, None));
                            0
                        }),
                        0,
                        Priority::NORMAL,
                    )
                    .unwrap();

                    k.yield_now();
                    assert_eq!(k.lock_info(lock).unwrap().waiters, 1);
                    k.delete_lock(lock).unwrap();
                    assert_eq!(k.lock_info(lock), Err(KernelError::InvalidHandle));
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        kernel.run();
        assert_eq!(*result.lock().unwrap(), Some(Err(KernelError::InvalidHandle)));
    }

    #[test]
    fn test_condition_hands_over_items() {
        let kernel = boot(1);
        let mutex = kernel.create_lock("m", LockKind::Binary, LockFlags::empty(), 1).unwrap();
        let cond = kernel.create_lock("c", LockKind::Condition, LockFlags::empty(), 0).unwrap();
        let queue = shared(std::collections::VecDeque::new());
        let consumed = shared(Vec::new());

        let k = kernel.clone();
        let (q, out) = (queue.clone(), consumed.clone());
        kernel
            .create_kernel_thread(
                "consumer",
                entry(move |_| {
                    for _ in 0..3 {
                        k.lock(mutex, 1, None).unwrap();
                        while q.lock().unwrap().is_empty() {
                            k.cond_wait(cond, mutex, None).unwrap();
                        }
                        let item = q.lock().unwrap().pop_front().unwrap();
                        out.lock().unwrap().push(item);
                        k.unlock(mutex, 1).unwrap();
                    }
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        let k = kernel.clone();
        kernel
            .create_kernel_thread(
                "producer",
                entry(move |_| {
                    for item in 0..3 {
                        k.lock(mutex, 1, None).unwrap();
                        queue.lock().unwrap().push_back(item);
                        k.cond_signal(cond).unwrap();
                        k.unlock(mutex, 1).unwrap();
                        k.yield_now();
                    }
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        kernel.run();
        assert_eq!(*consumed.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_condition_timeout_reacquires_mutex() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .create_kernel_thread(
                "patient",
                entry(move |_| {
                    let me = k.current_thread();
                    let mutex = k.create_lock("m", LockKind::Binary, LockFlags::empty(), 1).unwrap();
                    let cond = k.create_lock("c", LockKind::Condition, LockFlags::empty(), 0).unwrap();

                    k.lock(mutex, 1, None).unwrap();
                    let start = k.ticks();
                    assert_eq!(
                        k.cond_wait(cond, mutex, Some(Duration::from_millis(50))),
                        Err(KernelError::TimedOut)
                    );
                    assert!(k.ticks() - start >= 5);
                    assert_eq!(k.lock_info(mutex).unwrap().holder, Some(me));
                    assert_eq!(k.cond_broadcast(cond), Ok(0));
                    k.unlock(mutex, 1).unwrap();
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        kernel.run();
    }

    #[test]
    fn test_signal_interrupts_lock_wait_once() {
        let kernel = boot(1);
        let lock = kernel.create_lock("contended", LockKind::Binary, LockFlags::empty(), 1).unwrap();
        let victim = shared(None);
        let outcome = shared(None);

        let k = kernel.clone();
        let target = victim.clone();
        kernel
            .create_kernel_thread(
                "holder",
                entry(move |_| {
                    k.lock(lock, 1, None).unwrap();
                    k.yield_now();

                    assert_eq!(k.lock_info(lock).unwrap().waiters, 1);
                    let tid = target.lock().unwrap().unwrap();
                    k.send_signal(tid, Signal::SIGUSR1).unwrap();
                    k.yield_now();

                    let info = k.lock_info(lock).unwrap();
                    assert_eq!(info.waiters, 0);
                    k.unlock(lock, 1).unwrap();
                    assert_eq!(k.lock_info(lock).unwrap().count, 1);
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        let k = kernel.clone();
        let out = outcome.clone();
        let tid = kernel
            .create_kernel_thread(
                "waiter",
                entry(move |_| {
                    k.install_handler(Signal::SIGUSR1, SigAction::handler(0x1000, 0x2000)).unwrap();
                    let result = k.lock(lock, 1, None);
                    assert_eq!(k.lock_info(lock).unwrap().waiters, 0);
                    *out.lock().unwrap() = Some(result);
                    assert_eq!(k.handle_signals(), Some(Signal::SIGUSR1));
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();
        *victim.lock().unwrap() = Some(tid);

        kernel.run();
        assert_eq!(*outcome.lock().unwrap(), Some(Err(KernelError::Interrupted)));
    }

    #[test]
    fn test_fork_copies_private_locks_and_shares_shared_ones() {
        let kernel = boot(1);
        let status = shared(None);

        let k = kernel.clone();
        let out = status.clone();
        kernel
            .spawn_process(
                "parent",
                entry(move |_| {
                    let private = k.create_lock("private", LockKind::Binary, LockFlags::empty(), 0).unwrap();
                    let public = k.create_lock("public", LockKind::Binary, LockFlags::SHARED, 0).unwrap();

                    let k2 = k.clone();
                    let child = k
                        .fork(
                            entry(move |_| {
                                k2.try_lock(private, 1).unwrap();
                                assert_eq!(k2.try_lock(public, 1), Err(KernelError::WouldBlock));
                                k2.unlock(private, 1).unwrap();
                                0
                            }),
                            0,
                        )
                        .unwrap();

                    *out.lock().unwrap() = k.wait(WaitTarget::Process(child), WaitOptions::empty()).unwrap();
                    assert_eq!(k.lock_info(private).unwrap().holder, Some(k.current_thread()));
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
        let (_, exit) = status.lock().unwrap().unwrap();
        assert_eq!(exit, ExitStatus::Exited(0));
    }
}

mod process_tests {
    use super::*;

    #[test]
    fn test_exit_releases_everything() {
        let kernel = boot(1);
        let free = kernel.frame_pool().free_frames();
        let seen = shared(None);

        let k = kernel.clone();
        let out = seen.clone();
        let pid = kernel
            .spawn_process(
                "short",
                entry(move |_| {
                    let me = k.current_process();
                    let info = k.process_info(me).unwrap();
                    *out.lock().unwrap() = Some((me, info.parent, info.memory.regions));
                    k.create_region("scratch", PAGE_SIZE, RegionFlags::DATA, Backing::Anonymous).unwrap();
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
        assert_eq!(*seen.lock().unwrap(), Some((pid, Some(KERNEL_PID), 1)));
        assert_eq!(kernel.list_processes().len(), 1);
        assert_eq!(kernel.process(pid).err(), Some(KernelError::InvalidHandle));
        assert_eq!(kernel.stats().free_frames, free);
    }

    #[test]
    fn test_wait_collects_exit_status() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .spawn_process(
                "parent",
                entry(move |_| {
                    let child = k.spawn_process("child", entry(|_| 7), 0).unwrap();
                    assert_eq!(k.process_info(k.current_process()).unwrap().children, vec![child]);

                    let reaped = k.wait(WaitTarget::Process(child), WaitOptions::empty()).unwrap();
                    assert_eq!(reaped, Some((child, ExitStatus::Exited(7))));
                    assert_eq!(k.process(child).err(), Some(KernelError::InvalidHandle));

                    assert_eq!(k.wait(WaitTarget::Any, WaitOptions::empty()), Err(KernelError::NoChildren));
                    assert_eq!(
                        k.wait(WaitTarget::Process(ProcessId(999)), WaitOptions::NOHANG),
                        Err(KernelError::NoChildren)
                    );
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
        assert_eq!(kernel.stats().processes, 1);
    }

    #[test]
    fn test_wait_nohang() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .spawn_process(
                "parent",
                entry(move |_| {
                    let k2 = k.clone();
                    let child = k
                        .spawn_process(
                            "slow",
                            entry(move |_| {
                                k2.sleep(Duration::from_millis(50)).unwrap();
                                0
                            }),
                            0,
                        )
                        .unwrap();

                    assert_eq!(k.wait(WaitTarget::Any, WaitOptions::NOHANG), Ok(None));
                    assert_eq!(
                        k.wait(WaitTarget::Any, WaitOptions::empty()),
                        Ok(Some((child, ExitStatus::Exited(0))))
                    );
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
    }

    #[test]
    fn test_orphans_are_adopted() {
        let kernel = boot(1);
        let parent_seen = shared(None);

        let k = kernel.clone();
        let out = parent_seen.clone();
        kernel
            .spawn_process(
                "short-lived",
                entry(move |_| {
                    let k2 = k.clone();
                    k.spawn_process(
                        "orphan",
                        entry(move |_| {
                            k2.sleep(Duration::from_millis(50)).unwrap();
                            let info = k2.process_info(k2.current_process()).unwrap();
                            *out.lock().unwrap() = Some(info.parent);
                            0
                        }),
                        0,
                    )
                    .unwrap();
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
        assert_eq!(*parent_seen.lock().unwrap(), Some(Some(KERNEL_PID)));
        assert_eq!(kernel.stats().processes, 1);
    }

    #[test]
    fn test_fork_copies_the_address_space() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .spawn_process(
                "parent",
                entry(move |_| {
                    let region = k.create_region("data", PAGE_SIZE, RegionFlags::DATA, Backing::Anonymous).unwrap();
                    let addr = k.region_info(region).unwrap().start;
                    k.copy_to_user(addr, b"parent").unwrap();
                    let heap = k.sbrk(64).unwrap();
                    let stack = k.user_stack_top(k.current_thread()).unwrap();

                    let k2 = k.clone();
                    let child = k
                        .fork(
                            entry(move |_| {
                                let me = k2.current_thread();
                                assert_eq!(k2.user_frame(me).unwrap().ret, 0);
                                assert_eq!(k2.user_stack_top(me).unwrap(), stack);

                                let mut buf = [0u8; 6];
                                k2.copy_from_user(addr, &mut buf).unwrap();
                                assert_eq!(&buf, b"parent");
                                k2.copy_to_user(addr, b"child!").unwrap();

                                assert_eq!(k2.sbrk(0).unwrap(), heap.offset(64));
                                3
                            }),
                            0,
                        )
                        .unwrap();

                    let info = k.process_info(child).unwrap();
                    assert_eq!(info.parent, Some(k.current_process()));
                    assert_eq!(info.memory.regions, 3);

                    assert_eq!(
                        k.wait(WaitTarget::Process(child), WaitOptions::empty()),
                        Ok(Some((child, ExitStatus::Exited(3))))
                    );

                    let mut buf = [0u8; 6];
                    k.copy_from_user(addr, &mut buf).unwrap();
                    assert_eq!(&buf, b"parent");
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
    }

    #[test]
    fn test_fork_failure_on_full_process_table() {
        let mut config = KernelConfig::small();
        config.limits.max_processes = 2;
        let kernel = boot_with(config, 1);

        let k = kernel.clone();
        kernel
            .spawn_process(
                "parent",
                entry(move |_| {
                    let free = k.frame_pool().free_frames();
                    assert_eq!(k.fork(entry(|_| 0), 0), Err(KernelError::TableFull));
                    assert_eq!(k.frame_pool().free_frames(), free);
                    assert!(k.process_info(k.current_process()).unwrap().children.is_empty());
                    assert_eq!(k.stats().processes, 2);
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
    }

    #[test]
    fn test_fork_failure_on_full_thread_table() {
        let mut config = KernelConfig::small();
        config.limits.max_threads = 2;
        let kernel = boot_with(config, 1);

        let k = kernel.clone();
        kernel
            .spawn_process(
                "parent",
                entry(move |_| {
                    let free = k.frame_pool().free_frames();
                    assert_eq!(k.fork(entry(|_| 0), 0), Err(KernelError::TableFull));
                    assert_eq!(k.frame_pool().free_frames(), free);
                    assert!(k.process_info(k.current_process()).unwrap().children.is_empty());
                    assert_eq!(k.stats().processes, 2);
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
        assert_eq!(kernel.stats().processes, 1);
    }

    #[test]
    fn test_kernel_process_cannot_fork() {
        let kernel = boot(1);
        assert_eq!(kernel.fork(entry(|_| 0), 0), Err(KernelError::InvalidArgument));
        assert_eq!(kernel.exec_reset(), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_exec_reset() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .spawn_process(
                "exec",
                entry(move |_| {
                    let me = k.current_process();
                    k.create_region("old", PAGE_SIZE, RegionFlags::DATA, Backing::Anonymous).unwrap();
                    k.install_handler(Signal::SIGUSR1, SigAction::handler(0x1000, 0)).unwrap();

                    k.create_thread("extra", entry(|_| 0), 0, Priority::NORMAL, 0).unwrap();
                    assert_eq!(k.exec_reset(), Err(KernelError::Busy));
                    k.yield_now();
                    assert_eq!(k.process_info(me).unwrap().threads, 1);

                    k.exec_reset().unwrap();
                    assert_eq!(k.process_info(me).unwrap().memory.regions, 0);
                    let previous = k.install_handler(Signal::SIGUSR1, SigAction::default()).unwrap();
                    assert_eq!(previous.handler, SigHandler::Default);
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
    }
}

mod signal_tests {
    use super::*;

    #[test]
    fn test_handler_frame_and_sigreturn() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .create_kernel_thread(
                "catcher",
                entry(move |_| {
                    let me = k.current_thread();
                    let before = k.user_frame(me).unwrap();
                    k.install_handler(Signal::SIGUSR1, SigAction::handler(0x4000, 0x5000)).unwrap();

                    k.send_signal(me, Signal::SIGUSR1).unwrap();
                    assert!(k.pending_signals().contains(Signal::SIGUSR1));
                    assert_eq!(k.handle_signals(), Some(Signal::SIGUSR1));

                    let frame = k.user_frame(me).unwrap();
                    assert_eq!(frame.pc, 0x4000);
                    assert_eq!(frame.args[0], 10);
                    assert_eq!(frame.ret_addr, 0x5000);
                    assert!(k.thread_info(me).unwrap().blocked.contains(Signal::SIGUSR1));

                    k.sigreturn().unwrap();
                    assert_eq!(k.user_frame(me).unwrap(), before);
                    assert!(k.thread_info(me).unwrap().blocked.is_empty());
                    assert_eq!(k.sigreturn(), Err(KernelError::InvalidArgument));
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        kernel.run();
    }

    #[test]
    fn test_blocked_signal_waits_for_unblock() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .create_kernel_thread(
                "masker",
                entry(move |_| {
                    let me = k.current_thread();
                    k.install_handler(Signal::SIGUSR2, SigAction::handler(0x4000, 0)).unwrap();
                    k.sigprocmask(SigHow::Block, SigSet::of(Signal::SIGUSR2));

                    k.send_signal(me, Signal::SIGUSR2).unwrap();
                    assert_eq!(k.handle_signals(), None);

                    let previous = k.sigprocmask(SigHow::Unblock, SigSet::of(Signal::SIGUSR2));
                    assert!(previous.contains(Signal::SIGUSR2));
                    assert_eq!(k.handle_signals(), Some(Signal::SIGUSR2));
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        kernel.run();
    }

    #[test]
    fn test_uncatchable_signals() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .create_kernel_thread(
                "stubborn",
                entry(move |_| {
                    assert_eq!(
                        k.install_handler(Signal::SIGKILL, SigAction::handler(0x4000, 0)),
                        Err(KernelError::InvalidArgument)
                    );
                    assert_eq!(
                        k.install_handler(Signal::SIGSTOP, SigAction::ignore()),
                        Err(KernelError::InvalidArgument)
                    );
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        kernel.run();
    }

    #[test]
    fn test_idle_thread_cannot_be_signaled() {
        let kernel = boot(1);
        let idle = kernel.current_thread();
        assert_eq!(kernel.send_signal(idle, Signal::SIGUSR1), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_kill_terminates_sleeping_child() {
        let kernel = boot(1);
        let status = shared(None);

        let k = kernel.clone();
        let out = status.clone();
        kernel
            .spawn_process(
                "parent",
                entry(move |_| {
                    let k2 = k.clone();
                    let child = k
                        .spawn_process(
                            "victim",
                            entry(move |_| {
                                k2.syscall(Syscall::Sleep as u64, [10_000, 0, 0, 0, 0, 0]);
                                99
                            }),
                            0,
                        )
                        .unwrap();

                    k.sleep(Duration::from_millis(20)).unwrap();
                    k.kill(child, Signal::SIGTERM).unwrap();
                    *out.lock().unwrap() = Some(k.wait(WaitTarget::Process(child), WaitOptions::empty()));
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
        let result = status.lock().unwrap().take().unwrap();
        let (_, exit) = result.unwrap().unwrap();
        assert_eq!(exit, ExitStatus::Signaled(Signal::SIGTERM));
    }

    #[test]
    fn test_sigchld_interrupts_wait() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .spawn_process(
                "parent",
                entry(move |_| {
                    k.install_handler(Signal::SIGCHLD, SigAction::handler(0x4000, 0)).unwrap();
                    let child = k.spawn_process("child", entry(|_| 0), 0).unwrap();

                    assert_eq!(
                        k.wait(WaitTarget::Process(child), WaitOptions::empty()),
                        Err(KernelError::Interrupted)
                    );
                    assert!(k.pending_signals().contains(Signal::SIGCHLD));
                    assert_eq!(k.handle_signals(), Some(Signal::SIGCHLD));
                    k.sigreturn().unwrap();

                    assert_eq!(
                        k.wait(WaitTarget::Any, WaitOptions::NOHANG),
                        Ok(Some((child, ExitStatus::Exited(0))))
                    );
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
    }

    #[test]
    fn test_ignored_sigchld_reaps_children() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .spawn_process(
                "parent",
                entry(move |_| {
                    k.install_handler(Signal::SIGCHLD, SigAction::ignore()).unwrap();
                    let child = k.spawn_process("child", entry(|_| 0), 0).unwrap();

                    k.sleep(Duration::from_millis(50)).unwrap();
                    assert_eq!(k.process(child).err(), Some(KernelError::InvalidHandle));
                    assert_eq!(k.wait(WaitTarget::Any, WaitOptions::NOHANG), Err(KernelError::NoChildren));
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
        assert_eq!(kernel.stats().processes, 1);
    }
}

mod memory_tests {
    use super::*;

    fn in_process<F>(body: F)
    where
        F: FnOnce(&Kernel<HostedArch>) + Send + 'static,
    {
        let kernel = boot(1);
        let k = kernel.clone();
        kernel
            .spawn_process(
                "mem",
                entry(move |_| {
                    body(&k);
                    0
                }),
                0,
            )
            .unwrap();
        kernel.run();
    }

    #[test]
    fn test_sbrk() {
        in_process(|k| {
            let start = k.sbrk(0).unwrap();
            assert_eq!(k.find_region_for(start).unwrap().size, PAGE_SIZE);

            assert_eq!(k.sbrk(100).unwrap(), start);
            assert_eq!(k.sbrk(0).unwrap(), start.offset(100));
            k.copy_to_user(start.offset(50), b"heap").unwrap();

            assert_eq!(k.sbrk(5000).unwrap(), start.offset(100));
            assert_eq!(k.find_region_for(start).unwrap().size, 2 * PAGE_SIZE);

            assert_eq!(k.sbrk(-5100).unwrap(), start.offset(5100));
            assert_eq!(k.find_region_for(start).unwrap().size, PAGE_SIZE);
            assert_eq!(k.sbrk(-1), Err(KernelError::InvalidArgument));

            let mut buf = [0u8; 4];
            k.copy_from_user(start.offset(50), &mut buf).unwrap();
            assert_eq!(&buf, b"heap");
        });
    }

    #[test]
    fn test_heap_region_cannot_be_resized_directly() {
        in_process(|k| {
            let start = k.sbrk(0).unwrap();
            let heap = k.find_region_for(start).unwrap();
            assert_eq!(k.resize_region(heap.id, 4 * PAGE_SIZE), Err(KernelError::Busy));

            k.delete_region(heap.id).unwrap();
            assert_eq!(k.find_region_for(start).err(), Some(KernelError::InvalidArgument));
        });
    }

    #[test]
    fn test_region_lifecycle() {
        in_process(|k| {
            let id = k.create_region("buf", 2 * PAGE_SIZE, RegionFlags::DATA, Backing::Anonymous).unwrap();
            let info = k.region_info(id).unwrap();
            assert_eq!(info.size, 2 * PAGE_SIZE);
            assert_eq!(info.resident_pages, 0);

            let boundary = info.start.offset(PAGE_SIZE as u64 - 2);
            k.copy_to_user(boundary, b"span").unwrap();
            let mut buf = [0u8; 4];
            k.copy_from_user(boundary, &mut buf).unwrap();
            assert_eq!(&buf, b"span");
            assert_eq!(k.region_info(id).unwrap().resident_pages, 2);

            assert!(k.fault_in(info.start, false).is_ok());
            k.resize_region(id, PAGE_SIZE).unwrap();
            assert_eq!(k.region_info(id).unwrap().resident_pages, 1);

            k.delete_region(id).unwrap();
            assert_eq!(k.region_info(id).err(), Some(KernelError::InvalidHandle));
            assert_eq!(k.find_region_for(info.start).err(), Some(KernelError::InvalidArgument));
        });
    }

    #[test]
    fn test_fixed_placement() {
        in_process(|k| {
            let addr = VirtAddr::new(0x0060_0000);
            let id = k
                .create_region_at("fixed", addr, PAGE_SIZE, RegionFlags::DATA, Backing::Anonymous)
                .unwrap();
            assert_eq!(k.region_info(id).unwrap().start, addr);
            assert_eq!(
                k.create_region_at("clash", addr, PAGE_SIZE, RegionFlags::DATA, Backing::Anonymous),
                Err(KernelError::AddressInUse)
            );
        });
    }

    #[test]
    fn test_user_process_cannot_create_kernel_regions() {
        in_process(|k| {
            assert_eq!(
                k.create_region("k", PAGE_SIZE, RegionFlags::DATA | RegionFlags::KERNEL, Backing::Anonymous),
                Err(KernelError::InvalidArgument)
            );
            assert_eq!(k.sbrk(0).map(|_| ()), Ok(()));
        });
    }

    #[test]
    fn test_kernel_process_has_no_heap() {
        let kernel = boot(1);
        assert_eq!(kernel.sbrk(0), Err(KernelError::InvalidArgument));
    }
}

mod syscall_tests {
    use super::*;
    use mu_kernel::sys::syscall::{FOREVER, WAIT_ANY};

    fn call(k: &Kernel<HostedArch>, number: Syscall, args: &[u64]) -> isize {
        let mut regs = [0u64; 6];
        regs[..args.len()].copy_from_slice(args);
        k.syscall(number as u64, regs)
    }

    #[test]
    fn test_errors_become_negative_codes() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .spawn_process(
                "caller",
                entry(move |_| {
                    assert_eq!(k.syscall(999, [0; 6]), KernelError::InvalidArgument.errno());
                    assert_eq!(call(&k, Syscall::GetPid, &[]), k.current_process().value() as isize);
                    assert_eq!(call(&k, Syscall::GetTid, &[]), k.current_thread().value() as isize);
                    assert_eq!(call(&k, Syscall::Lock, &[77, 1, FOREVER]), KernelError::InvalidHandle.errno());
                    assert_eq!(call(&k, Syscall::Wait, &[WAIT_ANY, 0, 0]), KernelError::NoChildren.errno());
                    assert_eq!(call(&k, Syscall::SigReturn, &[]), KernelError::InvalidArgument.errno());

                    let lock = call(&k, Syscall::LockCreate, &[0, 0, 1]);
                    assert!(lock >= 0);
                    assert_eq!(call(&k, Syscall::Lock, &[lock as u64, 1, 0]), 0);
                    assert_eq!(call(&k, Syscall::TryLock, &[lock as u64, 1]), KernelError::Deadlock.errno());
                    assert_eq!(call(&k, Syscall::Unlock, &[lock as u64, 1]), 0);
                    assert_eq!(call(&k, Syscall::LockDelete, &[lock as u64]), 0);
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
    }

    #[test]
    fn test_wait_writes_status_word() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .spawn_process(
                "parent",
                entry(move |_| {
                    let child = k.spawn_process("child", entry(|_| 5), 0).unwrap();
                    let flags = RegionFlags::DATA.bits() as u64;
                    let region = call(&k, Syscall::CreateRegion, &[PAGE_SIZE as u64, flags]);
                    assert!(region >= 0);
                    let addr = k
                        .region_info(mm::RegionId(region as u32))
                        .unwrap()
                        .start;

                    let pid = call(&k, Syscall::Wait, &[child.value() as u64, 0, addr.as_u64()]);
                    assert_eq!(pid, child.value() as isize);

                    let mut word = [0u8; 4];
                    k.copy_from_user(addr, &mut word).unwrap();
                    let status = ExitStatus::from_raw(u32::from_ne_bytes(word)).unwrap();
                    assert_eq!(status, ExitStatus::Exited(5));
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
    }

    #[test]
    fn test_region_sizes_past_top_of_space_fail_cleanly() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .spawn_process(
                "huge",
                entry(move |_| {
                    let flags = RegionFlags::DATA.bits() as u64;
                    let region = call(&k, Syscall::CreateRegion, &[PAGE_SIZE as u64, flags]);
                    assert!(region >= 0);
                    let resized = call(&k, Syscall::ResizeRegion, &[region as u64, 0xFFFF_FFFF_FFFF_0000]);
                    assert_eq!(resized, KernelError::AddressSpaceExhausted.errno());
                    let info = k.region_info(mm::RegionId(region as u32)).unwrap();
                    assert_eq!(info.size, PAGE_SIZE);

                    let top = VirtAddr::new(0xFFFF_FFFF_FFFF_F000);
                    let placed = k.create_region_at("top", top, 2 * PAGE_SIZE, RegionFlags::DATA, Backing::Anonymous);
                    assert_eq!(placed, Err(KernelError::InvalidArgument));

                    assert!(k.sbrk(isize::MAX).is_err());
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
    }

    #[test]
    fn test_sigaction_returns_previous_handler() {
        let kernel = boot(1);

        let k = kernel.clone();
        kernel
            .create_kernel_thread(
                "sigaction",
                entry(move |_| {
                    let usr1 = Signal::SIGUSR1.number() as u64;
                    assert_eq!(call(&k, Syscall::SigAction, &[usr1, 0x4000, 0, 0, 0]), 0);
                    assert_eq!(call(&k, Syscall::SigAction, &[usr1, 1, 0, 0, 0]), 0x4000);
                    assert_eq!(call(&k, Syscall::SigAction, &[9, 0x4000, 0, 0, 0]), KernelError::InvalidArgument.errno());
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();

        kernel.run();
    }

    #[test]
    fn test_exit_syscall_ends_the_process() {
        let kernel = boot(1);
        let status = shared(None);

        let k = kernel.clone();
        let out = status.clone();
        kernel
            .spawn_process(
                "parent",
                entry(move |_| {
                    let k2 = k.clone();
                    let child = k
                        .spawn_process(
                            "quitter",
                            entry(move |_| {
                                call(&k2, Syscall::Exit, &[12]);
                                0
                            }),
                            0,
                        )
                        .unwrap();
                    *out.lock().unwrap() = k.wait(WaitTarget::Process(child), WaitOptions::empty()).unwrap();
                    0
                }),
                0,
            )
            .unwrap();

        kernel.run();
        assert_eq!(status.lock().unwrap().unwrap().1, ExitStatus::Exited(12));
    }
}

mod stats_tests {
    use super::*;

    #[test]
    fn test_stats_serialize() {
        let kernel = boot(1);
        let k = kernel.clone();
        kernel
            .create_kernel_thread(
                "one",
                entry(move |_| {
                    k.yield_now();
                    0
                }),
                0,
                Priority::NORMAL,
            )
            .unwrap();
        kernel.run();

        let stats = kernel.stats();
        assert_eq!(stats.threads, 0);
        assert_eq!(stats.processes, 1);
        assert!(stats.context_switches >= 2);

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["threads"], 0);
        assert_eq!(json["processes"], 1);
        assert!(json["context_switches"].as_u64().unwrap() >= 2);
    }
}
