//! Benchmarks for the hot non-tensor paths: label encoding and the
//! robust statistics behind the dwell filter.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use flipflop_rs::flipflop::flip_flop_code;
use flipflop_rs::stats::{med_mad, MAD_NORMAL_FACTOR};

fn random_sequence(len: usize, nbase: usize, seed: u64) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(0..nbase) as u8).collect()
}

fn bench_flip_flop_code(c: &mut Criterion) {
    let seq = random_sequence(10_000, 4, 42);
    c.bench_function("flip_flop_code_10k", |b| {
        b.iter(|| flip_flop_code(black_box(&seq), 4).unwrap());
    });
}

fn bench_med_mad(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let values: Vec<f64> = (0..10_000).map(|_| rng.gen_range(5.0..15.0)).collect();
    c.bench_function("med_mad_10k", |b| {
        b.iter(|| med_mad(black_box(&values), MAD_NORMAL_FACTOR));
    });
}

criterion_group!(benches, bench_flip_flop_code, bench_med_mad);
criterion_main!(benches);
