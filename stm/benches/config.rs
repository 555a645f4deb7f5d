// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! Throughput benchmarks for the transactional barriers.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use polystm::{atomic, set_algorithm, AlgorithmId};

/// Uncontended read-modify-write of a single word.
fn bnc_counter(c: &mut Criterion) {
    for alg in [AlgorithmId::OrecEla, AlgorithmId::ByteEar] {
        set_algorithm(alg);

        let mut counter: usize = 0;
        let addr = &mut counter as *mut usize;

        c.bench_function(&format!("counter_{}", alg.name()), |b| {
            b.iter(|| {
                atomic(|tx| {
                    let current: usize = unsafe { tx.read(addr as *const usize)? };
                    unsafe { tx.write(addr, black_box(current + 1)) }
                })
            })
        });
    }
}

/// A sweep of reads followed by buffered writes across a small array.
fn bnc_read_write_sweep(c: &mut Criterion) {
    const SLOTS: usize = 64;

    for alg in [AlgorithmId::OrecEla, AlgorithmId::ByteEar] {
        set_algorithm(alg);

        let mut matrix = vec![0usize; SLOTS].into_boxed_slice();
        let base = matrix.as_mut_ptr();

        c.bench_function(&format!("sweep_{}", alg.name()), |b| {
            b.iter(|| {
                atomic(|tx| {
                    for slot in 0..SLOTS {
                        let addr = unsafe { base.add(slot) };
                        let snap: usize = unsafe { tx.read(addr as *const usize)? };
                        unsafe { tx.write(addr, snap + 1)? };
                    }
                    Ok(())
                })
            })
        });
    }
}

criterion_group!(benches, bnc_counter, bnc_read_write_sweep);
criterion_main!(benches);
