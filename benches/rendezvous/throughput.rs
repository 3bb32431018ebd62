//! # Throughput — many producers funneling into one consumer
//!
//! Each producer sends its share of `TOTAL` messages over one shared
//! zero-capacity channel. Exercises the contended fetch-add path and the
//! broken-cell retry loop under real parallelism.

use std::thread;

use criterion::Criterion;

use corral::Channel;

const TOTAL: usize = 20_000;

fn producer_count() -> usize {
    num_cpus::get().clamp(2, 4)
}

pub fn bench(c: &mut Criterion) {
    let producers = producer_count();
    let per_producer = TOTAL / producers;
    let total = per_producer * producers;
    let mut group = c.benchmark_group("rendezvous/throughput");

    group.bench_function("corral", |b| {
        let ch = Channel::<usize>::rendezvous();
        b.iter(|| {
            thread::scope(|s| {
                for _ in 0..producers {
                    s.spawn(|| {
                        for i in 0..per_producer {
                            ch.send(i).unwrap();
                        }
                    });
                }
                for _ in 0..total {
                    ch.receive().unwrap();
                }
            });
        });
    });

    group.bench_function("crossbeam", |b| {
        let (tx, rx) = crossbeam_channel::bounded::<usize>(0);
        b.iter(|| {
            thread::scope(|s| {
                for _ in 0..producers {
                    let tx = tx.clone();
                    s.spawn(move || {
                        for i in 0..per_producer {
                            tx.send(i).unwrap();
                        }
                    });
                }
                for _ in 0..total {
                    rx.recv().unwrap();
                }
            });
        });
    });

    group.bench_function("flume", |b| {
        let (tx, rx) = flume::bounded::<usize>(0);
        b.iter(|| {
            thread::scope(|s| {
                for _ in 0..producers {
                    let tx = tx.clone();
                    s.spawn(move || {
                        for i in 0..per_producer {
                            tx.send(i).unwrap();
                        }
                    });
                }
                for _ in 0..total {
                    rx.recv().unwrap();
                }
            });
        });
    });

    group.bench_function("kanal", |b| {
        let (tx, rx) = kanal::bounded::<usize>(0);
        b.iter(|| {
            thread::scope(|s| {
                for _ in 0..producers {
                    let tx = tx.clone();
                    s.spawn(move || {
                        for i in 0..per_producer {
                            tx.send(i).unwrap();
                        }
                    });
                }
                for _ in 0..total {
                    rx.recv().unwrap();
                }
            });
        });
    });

    group.finish();
}
