//! # Omega Core Benchmarks
//!
//! | Operation | Work |
//! |-----------|------|
//! | append | hash leaf, merge roots, sign |
//! | proof | O(log n) nodes for a block plus an upgrade |
//! | verify | rebuild roots, check signature, persist nodes |

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use omega_core::{
    Core, CoreConfig, CoreStorage, Ed25519Authorization, ProofRequest, RequestBlock,
    RequestUpgrade,
};
use rand::RngCore;

fn random_blocks(count: usize, size: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let mut block = vec![0u8; size];
            rng.fill_bytes(&mut block);
            block
        })
        .collect()
}

fn writer_with(count: usize) -> Core {
    let mut core = Core::memory(CoreConfig::default()).expect("memory core");
    core.append(&random_blocks(count, 1024)).expect("append");
    core
}

fn reader_of(writer: &Core) -> Core {
    let auth = Ed25519Authorization::from_public_key(writer.key()).expect("public key");
    Core::open(CoreStorage::memory(), Arc::new(auth), CoreConfig::default()).expect("reader")
}

fn block_with_upgrade(core: &Core, index: u64) -> ProofRequest {
    ProofRequest {
        fork: core.fork(),
        block: Some(RequestBlock { index, nodes: 0 }),
        upgrade: Some(RequestUpgrade {
            start: 0,
            length: core.length(),
        }),
        ..Default::default()
    }
}

// ============================================================================
// APPEND
// ============================================================================

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    group.measurement_time(Duration::from_secs(5));

    for batch in [1usize, 16, 128] {
        let blocks = random_blocks(batch, 1024);
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("blocks_1k", batch), &blocks, |b, blocks| {
            let mut core = Core::memory(CoreConfig::default()).expect("memory core");
            b.iter(|| black_box(core.append(blocks).expect("append")))
        });
    }

    let data = random_blocks(1, 1 << 20).remove(0);
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("chunked_1m", |b| {
        let mut core = Core::memory(CoreConfig::default()).expect("memory core");
        b.iter(|| black_box(core.append_chunked(&data).expect("append")))
    });

    group.finish();
}

// ============================================================================
// PROOF / VERIFY
// ============================================================================

fn bench_proof(c: &mut Criterion) {
    let mut group = c.benchmark_group("proof");

    for length in [1_000usize, 100_000] {
        let core = writer_with(length);
        let request = block_with_upgrade(&core, length as u64 / 2);
        group.bench_with_input(BenchmarkId::new("block_and_upgrade", length), &request, |b, req| {
            b.iter(|| black_box(core.proof(req).expect("proof")))
        });
    }

    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify");

    for length in [1_000usize, 100_000] {
        let writer = writer_with(length);
        let proof = writer
            .proof(&block_with_upgrade(&writer, length as u64 / 2))
            .expect("proof");
        group.bench_with_input(BenchmarkId::new("fresh_reader", length), &proof, |b, proof| {
            b.iter_batched(
                || reader_of(&writer),
                |mut reader| black_box(reader.verify(proof).expect("verify")),
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_proof, bench_verify);
criterion_main!(benches);
