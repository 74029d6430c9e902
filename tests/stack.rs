mod stack {
    use crossbeam_utils::thread;
    use gcsync::{config::StackConfig, stack::LfStack};
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

    const THREAD_COUNT: u64 = 4;
    const OP_COUNT: u64 = 100_000;

    fn big() -> StackConfig {
        StackConfig {
            capacity:  (THREAD_COUNT * OP_COUNT) as usize,
            chunk_len: 1024,
        }
    }

    #[test]
    fn no_loss_no_duplication() {
        let stack = LfStack::with_config(&big());
        let results = thread::scope(|s| {
            let handles: Vec<_> = (0..THREAD_COUNT)
                .map(|t| {
                    let stack = &stack;
                    s.spawn(move |_| {
                        let mut rng = SmallRng::seed_from_u64(t);
                        let mut pushed = Vec::new();
                        let mut popped = Vec::new();
                        for i in 0..OP_COUNT {
                            if rng.gen_bool(0.5) {
                                let value = t << 32 | i;
                                stack.push_value(value).unwrap();
                                pushed.push(value);
                            } else if let Some(value) = stack.pop_value() {
                                popped.push(value);
                            }
                        }
                        (pushed, popped)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        })
        .unwrap();

        let mut pushed = Vec::new();
        let mut popped = Vec::new();
        for (p, q) in results {
            pushed.extend(p);
            popped.extend(q);
        }
        popped.extend(std::iter::from_fn(|| stack.pop_value()));
        pushed.sort_unstable();
        popped.sort_unstable();
        assert_eq!(pushed.len(), popped.len());
        assert!(pushed == popped, "popped values differ from pushed values");
    }

    #[test]
    fn chains_and_singles() {
        const CHAIN_LEN: u64 = 8;
        let stack = LfStack::with_config(&big());
        thread::scope(|s| {
            for t in 0..THREAD_COUNT {
                let stack = &stack;
                s.spawn(move |_| {
                    for i in 0..OP_COUNT / CHAIN_LEN / 4 {
                        let mut chain = stack.chain();
                        for j in 0..CHAIN_LEN {
                            chain.push(stack.allocate((t, i, j)).unwrap());
                        }
                        stack.push_chain(chain);
                        for _ in 0..CHAIN_LEN / 2 {
                            drop(stack.pop());
                        }
                    }
                });
            }
        })
        .unwrap();

        let mut remaining = 0;
        while stack.pop().is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, THREAD_COUNT * (OP_COUNT / CHAIN_LEN / 4) * CHAIN_LEN / 2);
    }

    #[test]
    fn generation_never_goes_back() {
        let stack = LfStack::with_config(&big());
        let finished = AtomicUsize::new(0);
        thread::scope(|s| {
            for t in 0..THREAD_COUNT {
                let stack = &stack;
                let finished = &finished;
                s.spawn(move |_| {
                    for i in 0..OP_COUNT / 4 {
                        stack.push_value(t * OP_COUNT + i).unwrap();
                        if i % 3 != 0 {
                            drop(stack.pop_value());
                        }
                    }
                    finished.fetch_add(1, Relaxed);
                });
            }
            s.spawn(|_| {
                let mut last = stack.version().generation();
                while finished.load(Relaxed) < THREAD_COUNT as usize {
                    let now = stack.version().generation();
                    assert!(now >= last, "generation went from {} to {}", last, now);
                    last = now;
                }
            });
        })
        .unwrap();
        assert!(stack.version().generation() >= (THREAD_COUNT * OP_COUNT / 4) as u32);
    }

    #[test]
    fn exhaustion_is_reported() {
        let stack = LfStack::with_config(&StackConfig {
            capacity:  64,
            chunk_len: 16,
        });
        let failures = thread::scope(|s| {
            let handles: Vec<_> = (0..THREAD_COUNT)
                .map(|t| {
                    let stack = &stack;
                    s.spawn(move |_| {
                        (0..32)
                            .filter(|i| stack.push_value(t * 32 + i).is_err())
                            .count()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .sum::<usize>()
        })
        .unwrap();
        assert_eq!(failures, (THREAD_COUNT as usize) * 32 - 64);
        let mut stack = stack;
        assert_eq!(stack.iter().count(), 64);
    }
}
