use criterion::{criterion_group, criterion_main};

mod rendezvous {
    pub mod handoff;
    pub mod throughput;
}

criterion_group!(
    benches,
    rendezvous::handoff::bench,
    rendezvous::throughput::bench
);
criterion_main!(benches);
