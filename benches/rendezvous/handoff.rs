//! # Handoff latency — request/response over a zero-capacity channel
//!
//! One thread pings, the other echoes, over a pair of rendezvous channels.
//! Every message forces a park/unpark rendezvous, so this measures the cost
//! of the cell protocol itself against crossbeam, flume and kanal bounded(0)
//! channels.

use std::thread;

use criterion::Criterion;

use corral::Channel;

const ROUNDS: usize = 1_000;

pub fn bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("rendezvous/handoff");

    group.bench_function("corral", |b| {
        let ping = Channel::<usize>::rendezvous();
        let pong = Channel::<usize>::rendezvous();
        b.iter(|| {
            thread::scope(|s| {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        let v = ping.receive().unwrap();
                        pong.send(v).unwrap();
                    }
                });
                for i in 0..ROUNDS {
                    ping.send(i).unwrap();
                    pong.receive().unwrap();
                }
            });
        });
    });

    group.bench_function("crossbeam", |b| {
        let (ping_tx, ping_rx) = crossbeam_channel::bounded::<usize>(0);
        let (pong_tx, pong_rx) = crossbeam_channel::bounded::<usize>(0);
        b.iter(|| {
            thread::scope(|s| {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        let v = ping_rx.recv().unwrap();
                        pong_tx.send(v).unwrap();
                    }
                });
                for i in 0..ROUNDS {
                    ping_tx.send(i).unwrap();
                    pong_rx.recv().unwrap();
                }
            });
        });
    });

    group.bench_function("flume", |b| {
        let (ping_tx, ping_rx) = flume::bounded::<usize>(0);
        let (pong_tx, pong_rx) = flume::bounded::<usize>(0);
        b.iter(|| {
            thread::scope(|s| {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        let v = ping_rx.recv().unwrap();
                        pong_tx.send(v).unwrap();
                    }
                });
                for i in 0..ROUNDS {
                    ping_tx.send(i).unwrap();
                    pong_rx.recv().unwrap();
                }
            });
        });
    });

    group.bench_function("kanal", |b| {
        let (ping_tx, ping_rx) = kanal::bounded::<usize>(0);
        let (pong_tx, pong_rx) = kanal::bounded::<usize>(0);
        b.iter(|| {
            thread::scope(|s| {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        let v = ping_rx.recv().unwrap();
                        pong_tx.send(v).unwrap();
                    }
                });
                for i in 0..ROUNDS {
                    ping_tx.send(i).unwrap();
                    pong_rx.recv().unwrap();
                }
            });
        });
    });

    group.finish();
}
