#![cfg(target_os = "linux")]

mod signals {
    use crossbeam_utils::thread;
    use gcsync::{
        config::{Config, DeliveryMode},
        error::SignalError,
        handshake::{Handshake, MutatorRecord, Round, Signum},
        Error,
    };
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
        Arc, Barrier,
    };

    #[derive(Default)]
    struct Counts {
        runs:      AtomicUsize,
        /// Actions that ran on some thread other than the record's owner.
        misplaced: AtomicUsize,
    }

    fn signalled(counts: &Arc<Counts>) -> Handshake {
        let counts = counts.clone();
        Handshake::builder()
            .config(Config {
                delivery: DeliveryMode::Signal,
                ..Default::default()
            })
            .action(move |record: &MutatorRecord, _: Signum| {
                counts.runs.fetch_add(1, SeqCst);
                if unsafe { libc::pthread_equal(libc::pthread_self(), record.pthread()) } == 0 {
                    counts.misplaced.fetch_add(1, SeqCst);
                }
            })
            .build()
            .unwrap()
    }

    fn spin_until(stop: &AtomicBool) {
        while !stop.load(SeqCst) {
            core::hint::spin_loop();
        }
    }

    #[test]
    fn cycle_interrupts_busy_threads() {
        const WORKERS: usize = 4;
        let counts = Arc::new(Counts::default());
        let handshake = signalled(&counts);
        let ready = Barrier::new(WORKERS + 1);
        let stop = AtomicBool::new(false);
        thread::scope(|s| {
            for _ in 0..WORKERS {
                s.spawn(|_| {
                    let m = handshake.mutator().unwrap();
                    ready.wait();
                    spin_until(&stop);
                    assert_eq!(m.status(), Signum::Sweep);
                });
            }
            ready.wait();
            for _ in 0..10 {
                assert_eq!(handshake.run_cycle(false), Round::Converged);
            }
            stop.store(true, SeqCst);
        })
        .unwrap();
        assert_eq!(counts.runs.load(SeqCst), 10 * WORKERS * Signum::CYCLE.len());
        assert_eq!(counts.misplaced.load(SeqCst), 0);
    }

    #[test]
    fn collector_signals_itself() {
        let counts = Arc::new(Counts::default());
        let handshake = signalled(&counts);
        std::thread::spawn(move || {
            let m = handshake.mutator().unwrap();
            assert_eq!(handshake.run_cycle(false), Round::Converged);
            assert_eq!(m.status(), Signum::Sweep);
        })
        .join()
        .unwrap();
        assert_eq!(counts.runs.load(SeqCst), Signum::CYCLE.len());
        assert_eq!(counts.misplaced.load(SeqCst), 0);
    }

    #[test]
    fn barrier_skips_action() {
        let counts = Arc::new(Counts::default());
        let handshake = signalled(&counts);
        let ready = Barrier::new(2);
        let stop = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|_| {
                let m = handshake.mutator().unwrap();
                m.enter_barrier();
                ready.wait();
                spin_until(&stop);
                m.leave_barrier();
            });
            ready.wait();
            assert_eq!(handshake.run_cycle(false), Round::Converged);
            assert_eq!(counts.runs.load(SeqCst), 0);
            assert_eq!(handshake.handshake(Signum::Sync1, true), Round::Converged);
            assert_eq!(counts.runs.load(SeqCst), 1);
            stop.store(true, SeqCst);
        })
        .unwrap();
    }

    #[test]
    fn deferred_mark_is_redelivered() {
        let counts = Arc::new(Counts::default());
        let handshake = signalled(&counts);
        let ready = Barrier::new(2);
        let stop = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|_| {
                let m = handshake.mutator().unwrap();
                m.disable_mark_signal();
                ready.wait();
                while m.record().mark_signal_requested().is_none() {
                    core::hint::spin_loop();
                }
                assert_eq!(m.status(), Signum::Sync2);
                m.enable_mark_signal();
                assert_eq!(m.status(), Signum::Async);
                spin_until(&stop);
            });
            ready.wait();
            assert_eq!(handshake.handshake(Signum::Sync1, false), Round::Converged);
            assert_eq!(handshake.handshake(Signum::Sync2, false), Round::Converged);
            assert_eq!(handshake.handshake(Signum::Async, false), Round::Converged);
            stop.store(true, SeqCst);
        })
        .unwrap();
        assert_eq!(counts.runs.load(SeqCst), 3);
        assert_eq!(counts.misplaced.load(SeqCst), 0);
    }

    #[test]
    fn one_phase_signal_per_process() {
        let counts = Arc::new(Counts::default());
        let _installed = signalled(&counts);
        let other = Handshake::builder()
            .config(Config {
                delivery: DeliveryMode::Signal,
                signal_offset: 1,
                ..Default::default()
            })
            .build();
        match other {
            Err(Error::Signal(SignalError::Conflict { installed, requested })) => {
                assert_ne!(installed, requested)
            }
            other => panic!("expected a signal conflict, got {:?}", other),
        }
    }
}
