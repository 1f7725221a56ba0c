//! Kernel behavior tests, driven deterministically through the hosted
//! port. Each test module instantiates its own kernel; threads report
//! their observations through a channel, and the test body plays the role
//! of the tick interrupt.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Mutex, OnceLock};
use std::time::Duration;

use tern_kernel::{thread::ThreadSt, KernelOptions, Ticks, NO_WAIT, WAIT_FOREVER};
use tern_port_std::PortInstance;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Spin until `thread` reaches the wanted state (kernel bookkeeping, not
/// OS-thread progress).
fn wait_thread_state<Traits: PortInstance>(
    thread: &'static tern_kernel::thread::ThreadCb<Traits>,
    wanted: ThreadSt,
) {
    loop {
        if tern_kernel::thread::state::<Traits>(thread).unwrap() == wanted {
            return;
        }
        std::thread::yield_now();
    }
}

fn expect(rx: &mpsc::Receiver<String>, wanted: &str) {
    let got = rx
        .recv_timeout(RECV_TIMEOUT)
        .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
    assert_eq!(got, wanted);
}

macro_rules! event_channel {
    () => {{
        static TX: OnceLock<mpsc::Sender<String>> = OnceLock::new();
        fn emit(msg: String) {
            TX.get().unwrap().send(msg).unwrap();
        }
        let (tx, rx) = mpsc::channel();
        TX.set(tx).unwrap();
        (emit as fn(String), rx)
    }};
}

// ---------------------------------------------------------------------------

mod semaphore_boundaries {
    use super::*;
    use tern_kernel::{error::*, semaphore, thread, Init, StackStorage};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static SEM: semaphore::SemaphoreCb<SystemTraits> = Init::INIT;
    static THREAD: thread::ThreadCb<SystemTraits> = Init::INIT;
    static STACK: StackStorage<8192> = StackStorage::new();
    static EMIT: OnceLock<fn(String)> = OnceLock::new();

    fn body(_: usize) {
        let emit = EMIT.get().unwrap();

        // Acquire on an empty semaphore with timeout 0 fails immediately
        assert_eq!(
            semaphore::acquire::<SystemTraits>(&SEM, NO_WAIT),
            Err(AcquireError::Timeout)
        );

        semaphore::release::<SystemTraits>(&SEM).unwrap();
        semaphore::release::<SystemTraits>(&SEM).unwrap();
        assert_eq!(semaphore::value::<SystemTraits>(&SEM), Ok(2));

        // Release at the maximum value overflows
        assert_eq!(
            semaphore::release::<SystemTraits>(&SEM),
            Err(SignalError::Overflow)
        );

        semaphore::acquire::<SystemTraits>(&SEM, NO_WAIT).unwrap();
        semaphore::acquire::<SystemTraits>(&SEM, WAIT_FOREVER).unwrap();
        assert_eq!(semaphore::value::<SystemTraits>(&SEM), Ok(0));

        // Operations on a deleted semaphore report a nonexistent object
        semaphore::delete::<SystemTraits>(&SEM).unwrap();
        assert_eq!(
            semaphore::acquire::<SystemTraits>(&SEM, NO_WAIT),
            Err(AcquireError::NoExist)
        );

        emit("done".to_owned());
    }

    fn init() {
        semaphore::create::<SystemTraits>(&SEM, 0, 2).unwrap();
        thread::create::<SystemTraits>(
            &THREAD,
            &thread::ThreadAttr {
                entry: body,
                param: 0,
                stack: STACK.region(),
                priority: 5,
                options: thread::ThreadOptions::START,
            },
        )
        .unwrap();
    }

    #[test]
    fn run() {
        let (emit, rx) = event_channel!();
        EMIT.set(emit).unwrap();
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);
        expect(&rx, "done");
        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod mutex_basics {
    use super::*;
    use tern_kernel::{error::*, mutex, thread, Init, StackStorage};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static PLAIN: mutex::MutexCb<SystemTraits> = Init::INIT;
    static RECURSIVE: mutex::MutexCb<SystemTraits> = Init::INIT;
    static THREAD: thread::ThreadCb<SystemTraits> = Init::INIT;
    static STACK: StackStorage<8192> = StackStorage::new();
    static EMIT: OnceLock<fn(String)> = OnceLock::new();

    fn body(_: usize) {
        let emit = EMIT.get().unwrap();
        let me = thread::current::<SystemTraits>().unwrap();
        let base = thread::priority::<SystemTraits>(me).unwrap();

        // Relocking a non-recursive mutex is illegal use
        mutex::lock::<SystemTraits>(&PLAIN, WAIT_FOREVER).unwrap();
        assert_eq!(
            mutex::lock::<SystemTraits>(&PLAIN, NO_WAIT),
            Err(LockError::IllegalUse)
        );
        mutex::unlock::<SystemTraits>(&PLAIN).unwrap();

        // Unlocking a mutex the caller doesn't own is a state error
        assert_eq!(
            mutex::unlock::<SystemTraits>(&PLAIN),
            Err(UnlockError::BadState)
        );

        // A recursive mutex counts depth
        mutex::lock::<SystemTraits>(&RECURSIVE, WAIT_FOREVER).unwrap();
        mutex::lock::<SystemTraits>(&RECURSIVE, WAIT_FOREVER).unwrap();
        mutex::unlock::<SystemTraits>(&RECURSIVE).unwrap();
        assert_eq!(mutex::is_locked::<SystemTraits>(&RECURSIVE), Ok(true));
        mutex::unlock::<SystemTraits>(&RECURSIVE).unwrap();
        assert_eq!(mutex::is_locked::<SystemTraits>(&RECURSIVE), Ok(false));

        // Lock-then-unlock returns the mutex to a free state and the
        // caller to its base priority
        assert_eq!(mutex::is_locked::<SystemTraits>(&PLAIN), Ok(false));
        assert_eq!(
            thread::effective_priority::<SystemTraits>(me).unwrap(),
            base
        );

        emit("done".to_owned());
    }

    fn init() {
        mutex::create::<SystemTraits>(&PLAIN, mutex::MutexAttr::empty(), 0).unwrap();
        mutex::create::<SystemTraits>(&RECURSIVE, mutex::MutexAttr::RECURSIVE, 0).unwrap();
        thread::create::<SystemTraits>(
            &THREAD,
            &thread::ThreadAttr {
                entry: body,
                param: 0,
                stack: STACK.region(),
                priority: 5,
                options: thread::ThreadOptions::START,
            },
        )
        .unwrap();
    }

    #[test]
    fn run() {
        let (emit, rx) = event_channel!();
        EMIT.set(emit).unwrap();
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);
        expect(&rx, "done");
        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod s1_priority_inheritance {
    use super::*;
    use tern_kernel::{mutex, thread, Init, StackStorage};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static M: mutex::MutexCb<SystemTraits> = Init::INIT;
    static THREAD_L: thread::ThreadCb<SystemTraits> = Init::INIT;
    static THREAD_H: thread::ThreadCb<SystemTraits> = Init::INIT;
    static STACK_L: StackStorage<8192> = StackStorage::new();
    static STACK_H: StackStorage<8192> = StackStorage::new();
    static EMIT: OnceLock<fn(String)> = OnceLock::new();

    fn body_l(_: usize) {
        let emit = EMIT.get().unwrap();

        mutex::lock::<SystemTraits>(&M, WAIT_FOREVER).unwrap();
        emit("l locked".to_owned());

        // Wait until H's blocked acquisition raises our priority
        loop {
            if thread::effective_priority::<SystemTraits>(&THREAD_L).unwrap() == 2 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(thread::priority::<SystemTraits>(&THREAD_L).unwrap(), 10);
        emit("l inherited".to_owned());

        mutex::unlock::<SystemTraits>(&M).unwrap();

        // The inherited priority is gone after the release
        assert_eq!(
            thread::effective_priority::<SystemTraits>(&THREAD_L).unwrap(),
            10
        );
        emit("l released".to_owned());
    }

    fn body_h(_: usize) {
        let emit = EMIT.get().unwrap();

        mutex::lock::<SystemTraits>(&M, WAIT_FOREVER).unwrap();
        assert_eq!(
            thread::effective_priority::<SystemTraits>(&THREAD_H).unwrap(),
            2
        );
        mutex::unlock::<SystemTraits>(&M).unwrap();
        emit("h done".to_owned());
    }

    fn init() {
        mutex::create::<SystemTraits>(&M, mutex::MutexAttr::INHERIT, 0).unwrap();
        thread::create::<SystemTraits>(
            &THREAD_L,
            &thread::ThreadAttr {
                entry: body_l,
                param: 0,
                stack: STACK_L.region(),
                priority: 10,
                options: thread::ThreadOptions::START,
            },
        )
        .unwrap();
        thread::create::<SystemTraits>(
            &THREAD_H,
            &thread::ThreadAttr {
                entry: body_h,
                param: 0,
                stack: STACK_H.region(),
                priority: 2,
                options: thread::ThreadOptions::empty(),
            },
        )
        .unwrap();
    }

    #[test]
    fn run() {
        let (emit, rx) = event_channel!();
        EMIT.set(emit).unwrap();
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);

        expect(&rx, "l locked");
        tern_kernel::thread::activate::<SystemTraits>(&THREAD_H).unwrap();
        expect(&rx, "l inherited");
        // H takes over the mutex the moment L releases it
        expect(&rx, "h done");
        expect(&rx, "l released");

        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod s2_chained_priority_inheritance {
    use super::*;
    use tern_kernel::{mutex, thread, Init, StackStorage};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static M1: mutex::MutexCb<SystemTraits> = Init::INIT;
    static M2: mutex::MutexCb<SystemTraits> = Init::INIT;
    static THREAD_L: thread::ThreadCb<SystemTraits> = Init::INIT;
    static THREAD_M: thread::ThreadCb<SystemTraits> = Init::INIT;
    static THREAD_H: thread::ThreadCb<SystemTraits> = Init::INIT;
    static STACK_L: StackStorage<8192> = StackStorage::new();
    static STACK_M: StackStorage<8192> = StackStorage::new();
    static STACK_H: StackStorage<8192> = StackStorage::new();
    static EMIT: OnceLock<fn(String)> = OnceLock::new();

    fn eff(cb: &'static thread::ThreadCb<SystemTraits>) -> usize {
        thread::effective_priority::<SystemTraits>(cb).unwrap()
    }

    fn body_l(_: usize) {
        let emit = EMIT.get().unwrap();
        mutex::lock::<SystemTraits>(&M1, WAIT_FOREVER).unwrap();
        emit("l holds m1".to_owned());

        // H blocking on M2 propagates through M to us
        loop {
            if eff(&THREAD_L) == 2 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(eff(&THREAD_M), 2);
        emit("chain raised".to_owned());

        mutex::unlock::<SystemTraits>(&M1).unwrap();
        assert_eq!(eff(&THREAD_L), 10);
        emit("l done".to_owned());
    }

    fn body_m(_: usize) {
        let emit = EMIT.get().unwrap();
        mutex::lock::<SystemTraits>(&M2, WAIT_FOREVER).unwrap();
        emit("m holds m2".to_owned());

        // Blocks until L releases M1 (and H has raised us both by then)
        mutex::lock::<SystemTraits>(&M1, WAIT_FOREVER).unwrap();

        mutex::unlock::<SystemTraits>(&M1).unwrap();
        mutex::unlock::<SystemTraits>(&M2).unwrap();
        assert_eq!(eff(&THREAD_M), 5);
        emit("m done".to_owned());
    }

    fn body_h(_: usize) {
        let emit = EMIT.get().unwrap();
        mutex::lock::<SystemTraits>(&M2, WAIT_FOREVER).unwrap();
        mutex::unlock::<SystemTraits>(&M2).unwrap();
        emit("h done".to_owned());
    }

    fn init() {
        mutex::create::<SystemTraits>(&M1, mutex::MutexAttr::INHERIT, 0).unwrap();
        mutex::create::<SystemTraits>(&M2, mutex::MutexAttr::INHERIT, 0).unwrap();
        for (cb, body, stack, priority) in [
            (&THREAD_L, body_l as fn(usize), STACK_L.region(), 10),
            (&THREAD_M, body_m as fn(usize), STACK_M.region(), 5),
            (&THREAD_H, body_h as fn(usize), STACK_H.region(), 2),
        ] {
            thread::create::<SystemTraits>(
                cb,
                &thread::ThreadAttr {
                    entry: body,
                    param: 0,
                    stack,
                    priority,
                    options: thread::ThreadOptions::empty(),
                },
            )
            .unwrap();
        }
    }

    #[test]
    fn run() {
        let (emit, rx) = event_channel!();
        EMIT.set(emit).unwrap();
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);

        tern_kernel::thread::activate::<SystemTraits>(&THREAD_L).unwrap();
        expect(&rx, "l holds m1");

        tern_kernel::thread::activate::<SystemTraits>(&THREAD_M).unwrap();
        expect(&rx, "m holds m2");
        super::wait_thread_state(&THREAD_M, ThreadSt::Waiting);

        tern_kernel::thread::activate::<SystemTraits>(&THREAD_H).unwrap();
        expect(&rx, "chain raised");
        expect(&rx, "h done");
        expect(&rx, "m done");
        expect(&rx, "l done");

        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod s3_timeout {
    use super::*;
    use tern_kernel::{error::*, semaphore, thread, Init, StackStorage};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static SEM: semaphore::SemaphoreCb<SystemTraits> = Init::INIT;
    static THREAD: thread::ThreadCb<SystemTraits> = Init::INIT;
    static STACK: StackStorage<8192> = StackStorage::new();
    static EMIT: OnceLock<fn(String)> = OnceLock::new();

    fn body(_: usize) {
        let emit = EMIT.get().unwrap();

        let call_tick = tern_kernel::tick_count::<SystemTraits>().unwrap();
        let result = semaphore::acquire::<SystemTraits>(&SEM, 100);
        let wake_tick = tern_kernel::tick_count::<SystemTraits>().unwrap();

        assert_eq!(result, Err(AcquireError::Timeout));
        emit(format!("timed out after {}", wake_tick.wrapping_sub(call_tick)));
    }

    fn init() {
        semaphore::create::<SystemTraits>(&SEM, 0, 1).unwrap();
        thread::create::<SystemTraits>(
            &THREAD,
            &thread::ThreadAttr {
                entry: body,
                param: 0,
                stack: STACK.region(),
                priority: 5,
                options: thread::ThreadOptions::START,
            },
        )
        .unwrap();
    }

    #[test]
    fn run() {
        let (emit, rx) = event_channel!();
        EMIT.set(emit).unwrap();
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);

        // Let the wait get registered before the clock starts moving
        super::wait_thread_state(&THREAD, ThreadSt::Waiting);

        tern_port_std::advance_ticks::<SystemTraits>(100);
        expect(&rx, "timed out after 100");

        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod s4_object_deletion {
    use super::*;
    use tern_kernel::{error::*, event_flags, thread, Init, StackStorage};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static FLAGS: event_flags::FlagsCb<SystemTraits> = Init::INIT;
    static THREAD_A: thread::ThreadCb<SystemTraits> = Init::INIT;
    static THREAD_B: thread::ThreadCb<SystemTraits> = Init::INIT;
    static THREAD_C: thread::ThreadCb<SystemTraits> = Init::INIT;
    static STACK_A: StackStorage<8192> = StackStorage::new();
    static STACK_B: StackStorage<8192> = StackStorage::new();
    static STACK_C: StackStorage<8192> = StackStorage::new();
    static EMIT: OnceLock<fn(String)> = OnceLock::new();

    fn body(name: usize) {
        let emit = EMIT.get().unwrap();
        let result = event_flags::wait::<SystemTraits>(
            &FLAGS,
            0b1,
            event_flags::FlagsWaitMode::empty(),
            WAIT_FOREVER,
        );
        assert_eq!(result, Err(WaitFlagsError::Deleted));
        emit(format!("{name} deleted"));
    }

    fn init() {
        event_flags::create::<SystemTraits>(&FLAGS, 0).unwrap();
        for (i, (cb, stack)) in [
            (&THREAD_A, STACK_A.region()),
            (&THREAD_B, STACK_B.region()),
            (&THREAD_C, STACK_C.region()),
        ]
        .into_iter()
        .enumerate()
        {
            thread::create::<SystemTraits>(
                cb,
                &thread::ThreadAttr {
                    entry: body,
                    param: i,
                    stack,
                    priority: 5,
                    options: thread::ThreadOptions::empty(),
                },
            )
            .unwrap();
        }
    }

    #[test]
    fn run() {
        let (emit, rx) = event_channel!();
        EMIT.set(emit).unwrap();
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);

        // Establish a known FIFO wait order
        for cb in [&THREAD_A, &THREAD_B, &THREAD_C] {
            tern_kernel::thread::activate::<SystemTraits>(cb).unwrap();
            super::wait_thread_state(cb, ThreadSt::Waiting);
        }

        tern_kernel::event_flags::delete::<SystemTraits>(&FLAGS).unwrap();

        // All three are released with `Deleted`, in FIFO order
        expect(&rx, "0 deleted");
        expect(&rx, "1 deleted");
        expect(&rx, "2 deleted");

        // The control block is gone
        assert_eq!(
            tern_kernel::event_flags::set::<SystemTraits>(&FLAGS, 1),
            Err(UpdateFlagsError::NoExist)
        );

        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod s5_cyclic_drift_correction {
    use super::*;
    use tern_kernel::{timer, Init};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static CYCLIC: timer::CyclicCb<SystemTraits> = Init::INIT;
    static FIRES: Mutex<Vec<Ticks>> = Mutex::new(Vec::new());
    static FIRST_FIRE_BLOCKS: AtomicBool = AtomicBool::new(true);
    static RELEASE: AtomicBool = AtomicBool::new(false);

    fn callback(_: usize) {
        let now = tern_kernel::tick_count::<SystemTraits>().unwrap();
        FIRES.lock().unwrap().push(now);

        // The first fire deliberately stalls the timer thread
        if FIRST_FIRE_BLOCKS.swap(false, Ordering::Relaxed) {
            while !RELEASE.load(Ordering::Relaxed) {
                std::thread::yield_now();
            }
        }
    }

    fn init() {
        timer::cyclic_create::<SystemTraits>(
            &CYCLIC,
            callback,
            0,
            10,
            10,
            timer::CyclicAttr::START,
        )
        .unwrap();
    }

    fn fire_count() -> usize {
        FIRES.lock().unwrap().len()
    }

    #[test]
    fn run() {
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);

        // First fire at tick 10; the callback then blocks the timer thread
        for _ in 0..10 {
            tern_port_std::tick::<SystemTraits>();
        }
        while fire_count() < 1 {
            std::thread::yield_now();
        }

        // The timer thread stays stalled until tick 25
        for _ in 0..15 {
            tern_port_std::tick::<SystemTraits>();
        }
        RELEASE.store(true, Ordering::Relaxed);

        // Wait for the callback to return and the next cycle to be
        // scheduled (from the stalled fire's grid position, not from the
        // moment of release)
        let timer_cb = <SystemTraits as tern_kernel::KernelStatic>::timer_thread_cb();
        super::wait_thread_state(timer_cb, ThreadSt::Waiting);

        // The fires scheduled for ticks 20 and 30 must not be delivered
        // late; the next fire lands on the grid point 30
        tern_port_std::advance_ticks::<SystemTraits>(5);
        while fire_count() < 2 {
            std::thread::yield_now();
        }

        assert_eq!(*FIRES.lock().unwrap(), vec![10, 30]);

        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod s6_round_robin {
    use super::*;
    use tern_kernel::{thread, Init, KernelStatic, StackStorage};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static THREAD_A: thread::ThreadCb<SystemTraits> = Init::INIT;
    static THREAD_B: thread::ThreadCb<SystemTraits> = Init::INIT;
    static THREAD_C: thread::ThreadCb<SystemTraits> = Init::INIT;
    static STACK_A: StackStorage<8192> = StackStorage::new();
    static STACK_B: StackStorage<8192> = StackStorage::new();
    static STACK_C: StackStorage<8192> = StackStorage::new();
    static STOP: AtomicBool = AtomicBool::new(false);

    fn body(_: usize) {
        // Burn CPU without ever blocking
        while !STOP.load(Ordering::Relaxed) {
            std::hint::spin_loop();
        }
    }

    fn init() {
        for (cb, stack) in [
            (&THREAD_A, STACK_A.region()),
            (&THREAD_B, STACK_B.region()),
            (&THREAD_C, STACK_C.region()),
        ] {
            thread::create::<SystemTraits>(
                cb,
                &thread::ThreadAttr {
                    entry: body,
                    param: 0,
                    stack,
                    priority: 5,
                    options: thread::ThreadOptions::START,
                },
            )
            .unwrap();
        }
    }

    fn running_name() -> &'static str {
        let running = <SystemTraits as KernelStatic>::state()
            .running_thread()
            .unwrap();
        if core::ptr::eq(running, &THREAD_A) {
            "a"
        } else if core::ptr::eq(running, &THREAD_B) {
            "b"
        } else if core::ptr::eq(running, &THREAD_C) {
            "c"
        } else {
            "other"
        }
    }

    #[test]
    fn run() {
        let mut options = KernelOptions::default();
        options.round_robin_slices[5] = 4;
        tern_port_std::boot::<SystemTraits>(options, init);

        // Let the timer thread finish its first pass so that the
        // schedule starts from thread A
        while running_name() != "a" {
            std::thread::yield_now();
        }

        // Strict A -> B -> C rotation with a 4-tick slice
        let mut schedule = Vec::new();
        for _ in 0..24 {
            schedule.push(running_name());
            tern_port_std::advance_ticks::<SystemTraits>(1);
        }
        assert_eq!(
            schedule,
            [
                "a", "a", "a", "a", "b", "b", "b", "b", "c", "c", "c", "c", "a", "a", "a", "a",
                "b", "b", "b", "b", "c", "c", "c", "c",
            ]
        );

        // Over 24 ticks each thread accumulated exactly 8 ticks of
        // running time
        for cb in [&THREAD_A, &THREAD_B, &THREAD_C] {
            assert_eq!(thread::run_time::<SystemTraits>(cb).unwrap(), 8);
        }

        STOP.store(true, Ordering::Relaxed);
        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod data_queue_fifo_and_rendezvous {
    use super::*;
    use tern_kernel::{data_queue, error::*, thread, BufStorage, Init, StackStorage};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static QUEUE: data_queue::DataQueueCb<SystemTraits> = Init::INIT;
    static RING: BufStorage<*mut (), 4> = BufStorage::new();
    static RENDEZVOUS: data_queue::DataQueueCb<SystemTraits> = Init::INIT;
    static THREAD: thread::ThreadCb<SystemTraits> = Init::INIT;
    static PEER: thread::ThreadCb<SystemTraits> = Init::INIT;
    static STACK: StackStorage<8192> = StackStorage::new();
    static STACK_PEER: StackStorage<8192> = StackStorage::new();
    static EMIT: OnceLock<fn(String)> = OnceLock::new();

    fn body(_: usize) {
        let emit = EMIT.get().unwrap();

        // FIFO round trip
        for v in [1usize, 2, 3] {
            data_queue::send::<SystemTraits>(&QUEUE, v as *mut (), NO_WAIT).unwrap();
        }
        // A send-to-head entry is received before everything else
        data_queue::send_to_head::<SystemTraits>(&QUEUE, 9 as *mut (), NO_WAIT).unwrap();
        let received: Vec<usize> = (0..4)
            .map(|_| data_queue::receive::<SystemTraits>(&QUEUE, NO_WAIT).unwrap() as usize)
            .collect();
        assert_eq!(received, [9, 1, 2, 3]);

        // Polling an empty queue fails immediately
        assert_eq!(
            data_queue::receive::<SystemTraits>(&QUEUE, NO_WAIT),
            Err(ReceiveError::Timeout)
        );

        // Zero-capacity queue: a poll send with no receiver fails...
        assert_eq!(
            data_queue::send::<SystemTraits>(&RENDEZVOUS, 7 as *mut (), NO_WAIT),
            Err(SendError::Timeout)
        );
        emit("fifo done".to_owned());

        // ...but a blocking send completes by meeting the peer's receive
        data_queue::send::<SystemTraits>(&RENDEZVOUS, 42 as *mut (), WAIT_FOREVER).unwrap();
        emit("rendezvous sent".to_owned());
    }

    fn peer_body(_: usize) {
        let emit = EMIT.get().unwrap();
        let value = data_queue::receive::<SystemTraits>(&RENDEZVOUS, WAIT_FOREVER).unwrap();
        assert_eq!(value as usize, 42);
        emit("rendezvous received".to_owned());
    }

    fn init() {
        data_queue::create::<SystemTraits>(&QUEUE, RING.region()).unwrap();
        data_queue::create::<SystemTraits>(&RENDEZVOUS, tern_kernel::BufRegion::empty()).unwrap();
        thread::create::<SystemTraits>(
            &THREAD,
            &thread::ThreadAttr {
                entry: body,
                param: 0,
                stack: STACK.region(),
                priority: 5,
                options: thread::ThreadOptions::START,
            },
        )
        .unwrap();
        thread::create::<SystemTraits>(
            &PEER,
            &thread::ThreadAttr {
                entry: peer_body,
                param: 0,
                stack: STACK_PEER.region(),
                priority: 6,
                options: thread::ThreadOptions::empty(),
            },
        )
        .unwrap();
    }

    #[test]
    fn run() {
        let (emit, rx) = event_channel!();
        EMIT.set(emit).unwrap();
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);

        expect(&rx, "fifo done");
        super::wait_thread_state(&THREAD, ThreadSt::Waiting);
        tern_kernel::thread::activate::<SystemTraits>(&PEER).unwrap();
        expect(&rx, "rendezvous sent");
        expect(&rx, "rendezvous received");

        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod mem_pool_direct_handoff {
    use super::*;
    use tern_kernel::{error::*, mem_pool, thread, BufStorage, Init, StackStorage};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static POOL: mem_pool::MemPoolCb<SystemTraits> = Init::INIT;
    static ARENA: BufStorage<u8, 256> = BufStorage::new();
    static TAKER: thread::ThreadCb<SystemTraits> = Init::INIT;
    static GIVER: thread::ThreadCb<SystemTraits> = Init::INIT;
    static STACK_TAKER: StackStorage<8192> = StackStorage::new();
    static STACK_GIVER: StackStorage<8192> = StackStorage::new();
    static EMIT: OnceLock<fn(String)> = OnceLock::new();
    static SHARED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    fn taker(_: usize) {
        let emit = EMIT.get().unwrap();

        let total = mem_pool::block_count::<SystemTraits>(&POOL).unwrap();
        let blocks: Vec<*mut u8> = (0..total)
            .map(|_| mem_pool::get::<SystemTraits>(&POOL, NO_WAIT).unwrap())
            .collect();
        assert_eq!(mem_pool::free_count::<SystemTraits>(&POOL), Ok(0));
        assert_eq!(
            mem_pool::get::<SystemTraits>(&POOL, NO_WAIT),
            Err(GetBlockError::Timeout)
        );
        SHARED.lock().unwrap().extend(blocks.iter().map(|p| *p as usize));
        emit("pool drained".to_owned());

        // Block until the giver frees one; the block is handed to us
        // directly, never touching the free list
        let handed = mem_pool::get::<SystemTraits>(&POOL, WAIT_FOREVER).unwrap();
        assert_eq!(
            handed as usize,
            *SHARED.lock().unwrap().first().unwrap()
        );
        assert_eq!(mem_pool::free_count::<SystemTraits>(&POOL), Ok(0));

        // Allocate-then-free restores the initial free count
        for &p in SHARED.lock().unwrap().iter().skip(1) {
            mem_pool::release::<SystemTraits>(&POOL, p as *mut u8).unwrap();
        }
        mem_pool::release::<SystemTraits>(&POOL, handed).unwrap();
        assert_eq!(mem_pool::free_count::<SystemTraits>(&POOL), Ok(total));

        // Freeing a pointer outside the arena is rejected
        let mut not_a_block = 0u8;
        assert_eq!(
            mem_pool::release::<SystemTraits>(&POOL, &mut not_a_block),
            Err(ReleaseBlockError::BadParam)
        );

        emit("pool done".to_owned());
    }

    fn giver(_: usize) {
        let first = *SHARED.lock().unwrap().first().unwrap();
        mem_pool::release::<SystemTraits>(&POOL, first as *mut u8).unwrap();
    }

    fn init() {
        mem_pool::create::<SystemTraits>(&POOL, ARENA.region(), 64).unwrap();
        thread::create::<SystemTraits>(
            &TAKER,
            &thread::ThreadAttr {
                entry: taker,
                param: 0,
                stack: STACK_TAKER.region(),
                priority: 5,
                options: thread::ThreadOptions::START,
            },
        )
        .unwrap();
        thread::create::<SystemTraits>(
            &GIVER,
            &thread::ThreadAttr {
                entry: giver,
                param: 0,
                stack: STACK_GIVER.region(),
                priority: 6,
                options: thread::ThreadOptions::empty(),
            },
        )
        .unwrap();
    }

    #[test]
    fn run() {
        let (emit, rx) = event_channel!();
        EMIT.set(emit).unwrap();
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);

        expect(&rx, "pool drained");
        super::wait_thread_state(&TAKER, ThreadSt::Waiting);
        tern_kernel::thread::activate::<SystemTraits>(&GIVER).unwrap();
        expect(&rx, "pool done");

        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod msg_queue_priorities {
    use super::*;
    use tern_kernel::{msg_queue, thread, BufStorage, Init, StackStorage};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static QUEUE: msg_queue::MsgQueueCb<SystemTraits> = Init::INIT;
    static BUF: BufStorage<u8, 32> = BufStorage::new();
    static THREAD: thread::ThreadCb<SystemTraits> = Init::INIT;
    static STACK: StackStorage<8192> = StackStorage::new();
    static EMIT: OnceLock<fn(String)> = OnceLock::new();

    fn body(_: usize) {
        let emit = EMIT.get().unwrap();

        msg_queue::send::<SystemTraits>(&QUEUE, b"norm", NO_WAIT).unwrap();
        msg_queue::send::<SystemTraits>(&QUEUE, b"late", NO_WAIT).unwrap();
        // An urgent message overtakes everything already stored
        msg_queue::send_urgent::<SystemTraits>(&QUEUE, b"urgt", NO_WAIT).unwrap();
        // A prioritized message slots in between: below urgent, above the
        // normal-priority messages
        msg_queue::send_with_priority::<SystemTraits>(&QUEUE, b"prio", 5, NO_WAIT).unwrap();
        assert_eq!(msg_queue::len::<SystemTraits>(&QUEUE), Ok(4));

        let mut buf = [0u8; 4];
        for wanted in [b"urgt", b"prio", b"norm", b"late"] {
            let n = msg_queue::receive::<SystemTraits>(&QUEUE, &mut buf, NO_WAIT).unwrap();
            assert_eq!(&buf[..n], wanted);
        }

        msg_queue::send::<SystemTraits>(&QUEUE, b"gone", NO_WAIT).unwrap();
        msg_queue::flush::<SystemTraits>(&QUEUE).unwrap();
        assert_eq!(msg_queue::len::<SystemTraits>(&QUEUE), Ok(0));

        emit("done".to_owned());
    }

    fn init() {
        msg_queue::create::<SystemTraits>(&QUEUE, BUF.region(), 4).unwrap();
        thread::create::<SystemTraits>(
            &THREAD,
            &thread::ThreadAttr {
                entry: body,
                param: 0,
                stack: STACK.region(),
                priority: 5,
                options: thread::ThreadOptions::START,
            },
        )
        .unwrap();
    }

    #[test]
    fn run() {
        let (emit, rx) = event_channel!();
        EMIT.set(emit).unwrap();
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);
        expect(&rx, "done");
        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod sleep_wakeup_suspend_resume {
    use super::*;
    use tern_kernel::{error::*, thread, Init, StackStorage};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static SLEEPER: thread::ThreadCb<SystemTraits> = Init::INIT;
    static FOREVER_SLEEPER: thread::ThreadCb<SystemTraits> = Init::INIT;
    static STACK_A: StackStorage<8192> = StackStorage::new();
    static STACK_B: StackStorage<8192> = StackStorage::new();
    static EMIT: OnceLock<fn(String)> = OnceLock::new();

    fn sleeper(_: usize) {
        let emit = EMIT.get().unwrap();

        // A suspended sleeper finishes its sleep into the Suspended state
        // and only runs again after `resume`
        thread::sleep::<SystemTraits>(5).unwrap();
        emit("sleeper woke".to_owned());
    }

    fn forever_sleeper(_: usize) {
        let emit = EMIT.get().unwrap();

        assert_eq!(thread::sleep::<SystemTraits>(WAIT_FOREVER), Ok(()));
        emit("woken by wakeup".to_owned());

        assert_eq!(
            thread::sleep::<SystemTraits>(WAIT_FOREVER),
            Err(SleepError::Released)
        );
        emit("released".to_owned());
    }

    fn init() {
        for (cb, body, stack) in [
            (&SLEEPER, sleeper as fn(usize), STACK_A.region()),
            (
                &FOREVER_SLEEPER,
                forever_sleeper as fn(usize),
                STACK_B.region(),
            ),
        ] {
            thread::create::<SystemTraits>(
                cb,
                &thread::ThreadAttr {
                    entry: body,
                    param: 0,
                    stack,
                    priority: 5,
                    options: thread::ThreadOptions::START,
                },
            )
            .unwrap();
        }
    }

    #[test]
    fn run() {
        let (emit, rx) = event_channel!();
        EMIT.set(emit).unwrap();
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);

        super::wait_thread_state(&SLEEPER, ThreadSt::Waiting);
        super::wait_thread_state(&FOREVER_SLEEPER, ThreadSt::Waiting);

        // Suspend the finite sleeper mid-wait, then let its timeout expire
        tern_kernel::thread::suspend::<SystemTraits>(&SLEEPER).unwrap();
        tern_port_std::advance_ticks::<SystemTraits>(5);
        assert_eq!(
            tern_kernel::thread::state::<SystemTraits>(&SLEEPER),
            Ok(ThreadSt::Suspended)
        );

        tern_kernel::thread::resume::<SystemTraits>(&SLEEPER).unwrap();
        expect(&rx, "sleeper woke");

        // `wakeup` ends an unbounded sleep successfully
        tern_kernel::thread::wakeup::<SystemTraits>(&FOREVER_SLEEPER).unwrap();
        expect(&rx, "woken by wakeup");

        // `release_wait` ends it with the dedicated status
        super::wait_thread_state(&FOREVER_SLEEPER, ThreadSt::Waiting);
        tern_kernel::thread::release_wait::<SystemTraits>(&FOREVER_SLEEPER).unwrap();
        expect(&rx, "released");

        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod robust_mutex_abandonment {
    use super::*;
    use tern_kernel::{error::*, mutex, thread, Init, StackStorage};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static M: mutex::MutexCb<SystemTraits> = Init::INIT;
    static OWNER: thread::ThreadCb<SystemTraits> = Init::INIT;
    static WAITER: thread::ThreadCb<SystemTraits> = Init::INIT;
    static SUPERVISOR: thread::ThreadCb<SystemTraits> = Init::INIT;
    static STACK_O: StackStorage<8192> = StackStorage::new();
    static STACK_W: StackStorage<8192> = StackStorage::new();
    static STACK_S: StackStorage<8192> = StackStorage::new();
    static EMIT: OnceLock<fn(String)> = OnceLock::new();

    fn owner(_: usize) {
        let emit = EMIT.get().unwrap();
        mutex::lock::<SystemTraits>(&M, WAIT_FOREVER).unwrap();
        emit("owner locked".to_owned());
        // Wait to be terminated by the supervisor
        loop {
            std::thread::park();
        }
    }

    fn waiter(_: usize) {
        let emit = EMIT.get().unwrap();
        // The lock is handed over on the owner's termination, flagged as
        // abandoned
        assert_eq!(
            mutex::lock::<SystemTraits>(&M, WAIT_FOREVER),
            Err(LockError::Abandoned)
        );
        emit("abandoned".to_owned());

        mutex::mark_consistent::<SystemTraits>(&M).unwrap();
        mutex::unlock::<SystemTraits>(&M).unwrap();
        emit("recovered".to_owned());
    }

    fn supervisor(_: usize) {
        let emit = EMIT.get().unwrap();
        thread::terminate::<SystemTraits>(&OWNER).unwrap();
        emit("terminated".to_owned());
    }

    fn init() {
        mutex::create::<SystemTraits>(&M, mutex::MutexAttr::ROBUST, 0).unwrap();
        for (cb, body, stack, priority) in [
            (&OWNER, owner as fn(usize), STACK_O.region(), 10),
            (&WAITER, waiter as fn(usize), STACK_W.region(), 5),
            (&SUPERVISOR, supervisor as fn(usize), STACK_S.region(), 2),
        ] {
            thread::create::<SystemTraits>(
                cb,
                &thread::ThreadAttr {
                    entry: body,
                    param: 0,
                    stack,
                    priority,
                    options: thread::ThreadOptions::empty(),
                },
            )
            .unwrap();
        }
    }

    #[test]
    fn run() {
        let (emit, rx) = event_channel!();
        EMIT.set(emit).unwrap();
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);

        tern_kernel::thread::activate::<SystemTraits>(&OWNER).unwrap();
        expect(&rx, "owner locked");

        tern_kernel::thread::activate::<SystemTraits>(&WAITER).unwrap();
        super::wait_thread_state(&WAITER, ThreadSt::Waiting);

        tern_kernel::thread::activate::<SystemTraits>(&SUPERVISOR).unwrap();
        expect(&rx, "terminated");
        expect(&rx, "abandoned");
        expect(&rx, "recovered");

        assert_eq!(
            tern_kernel::thread::state::<SystemTraits>(&OWNER),
            Ok(ThreadSt::Dormant)
        );

        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod priority_ceiling {
    use super::*;
    use tern_kernel::{error::*, mutex, thread, Init, StackStorage};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static M: mutex::MutexCb<SystemTraits> = Init::INIT;
    static THREAD: thread::ThreadCb<SystemTraits> = Init::INIT;
    static TOO_HIGH: thread::ThreadCb<SystemTraits> = Init::INIT;
    static STACK: StackStorage<8192> = StackStorage::new();
    static STACK_HIGH: StackStorage<8192> = StackStorage::new();
    static EMIT: OnceLock<fn(String)> = OnceLock::new();

    fn body(_: usize) {
        let emit = EMIT.get().unwrap();
        let me = thread::current::<SystemTraits>().unwrap();

        // Acquisition raises the owner to the ceiling
        mutex::lock::<SystemTraits>(&M, WAIT_FOREVER).unwrap();
        assert_eq!(thread::effective_priority::<SystemTraits>(me).unwrap(), 3);
        mutex::unlock::<SystemTraits>(&M).unwrap();
        assert_eq!(thread::effective_priority::<SystemTraits>(me).unwrap(), 5);

        emit("ceiling done".to_owned());
    }

    fn too_high(_: usize) {
        let emit = EMIT.get().unwrap();

        // A thread whose base priority precedes the ceiling may not
        // acquire the mutex
        assert_eq!(
            mutex::lock::<SystemTraits>(&M, WAIT_FOREVER),
            Err(LockError::IllegalUse)
        );
        emit("rejected".to_owned());
    }

    fn init() {
        mutex::create::<SystemTraits>(&M, mutex::MutexAttr::CEILING, 3).unwrap();
        thread::create::<SystemTraits>(
            &THREAD,
            &thread::ThreadAttr {
                entry: body,
                param: 0,
                stack: STACK.region(),
                priority: 5,
                options: thread::ThreadOptions::START,
            },
        )
        .unwrap();
        thread::create::<SystemTraits>(
            &TOO_HIGH,
            &thread::ThreadAttr {
                entry: too_high,
                param: 0,
                stack: STACK_HIGH.region(),
                priority: 2,
                options: thread::ThreadOptions::START,
            },
        )
        .unwrap();
    }

    #[test]
    fn run() {
        let (emit, rx) = event_channel!();
        EMIT.set(emit).unwrap();
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);

        expect(&rx, "rejected");
        expect(&rx, "ceiling done");

        tern_port_std::shutdown::<SystemTraits>();
    }
}

mod alarm_one_shot {
    use super::*;
    use tern_kernel::{timer, Init};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static ALARM: timer::AlarmCb<SystemTraits> = Init::INIT;
    static FIRED_AT: Mutex<Vec<Ticks>> = Mutex::new(Vec::new());

    fn callback(_: usize) {
        let now = tern_kernel::tick_count::<SystemTraits>().unwrap();
        FIRED_AT.lock().unwrap().push(now);
    }

    fn init() {
        timer::alarm_create::<SystemTraits>(&ALARM, callback, 0).unwrap();
        timer::alarm_start::<SystemTraits>(&ALARM, 7).unwrap();
    }

    #[test]
    fn run() {
        tern_port_std::boot::<SystemTraits>(KernelOptions::default(), init);

        tern_port_std::advance_ticks::<SystemTraits>(20);

        // One-shot: fired exactly once, at the requested tick
        assert_eq!(*FIRED_AT.lock().unwrap(), vec![7]);
        assert_eq!(timer::alarm_is_active::<SystemTraits>(&ALARM), Ok(false));

        tern_port_std::shutdown::<SystemTraits>();
    }
}
