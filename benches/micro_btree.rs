//! Micro benchmarks for the copy-on-write B+Tree and the triple table.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use quarry::primitives::block::MemBlockStore;
use quarry::primitives::io::MemFileIo;
use quarry::primitives::journal::Journal;
use quarry::storage::btree::{BPlusTree, Record, TreeOptions, TreeParams};
use quarry::storage::{IndexParams, StoreOptions};
use quarry::store::{ConnectionRegistry, Location};
use quarry::txn::{Coordinator, CoordinatorBuilder};
use quarry::types::{ComponentId, TxnMode};
use quarry::Term;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const INSERT_COUNT: u64 = 32_768;
const LOOKUP_SAMPLES: usize = 4_096;
const RANGE_WIDTH: u64 = 512;
const BLOCK_SIZE: usize = 4096;

fn micro_btree(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/btree");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            FreshTree::new,
            |tree| {
                let keys: Vec<u64> = (0..INSERT_COUNT).collect();
                tree.insert_keys(&keys);
                black_box(tree.tree.committed_root());
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            FreshTree::new,
            |tree| {
                tree.insert_keys(&random_keys);
                black_box(tree.tree.committed_root());
            },
            BatchSize::SmallInput,
        );
    });

    let loaded = FreshTree::new();
    loaded.insert_keys(&random_keys);
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_lookup", LOOKUP_SAMPLES), |b| {
        b.iter(|| loaded.point_lookup(&mut rng, LOOKUP_SAMPLES));
    });

    group.throughput(Throughput::Elements(RANGE_WIDTH));
    group.bench_function(BenchmarkId::new("range_scan", RANGE_WIDTH), |b| {
        b.iter(|| loaded.range_scan(&mut rng, RANGE_WIDTH));
    });

    group.finish();
}

fn micro_triples(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/triples");
    group.sample_size(10);
    const TRIPLES: usize = 2_000;
    group.throughput(Throughput::Elements(TRIPLES as u64));
    group.bench_function("add_in_one_txn", |b| {
        b.iter_batched(
            || {
                let registry = ConnectionRegistry::with_options(
                    StoreOptions::default().params(IndexParams::default().block_size(BLOCK_SIZE)),
                );
                let conn = registry
                    .connect(&Location::mem_named("bench"))
                    .expect("connect");
                (registry, conn)
            },
            |(_registry, conn)| {
                conn.coordinator()
                    .execute_write(|txn| {
                        for i in 0..TRIPLES {
                            conn.storage().triples().add(
                                txn,
                                &[
                                    Term::iri(format!("http://example.org/s{}", i % 97)),
                                    Term::iri(format!("http://example.org/p{}", i % 7)),
                                    Term::literal(format!("object {i}")),
                                ],
                            )?;
                        }
                        Ok(())
                    })
                    .expect("write batch");
            },
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

struct FreshTree {
    tree: Arc<BPlusTree>,
    coordinator: Coordinator,
}

impl FreshTree {
    fn new() -> Self {
        let params = TreeParams::new(BLOCK_SIZE, 8, 8).expect("params");
        let options = TreeOptions::new(ComponentId::from_bytes([7; 16]), "bench", params);
        let tree = Arc::new(
            BPlusTree::open(
                options,
                Arc::new(MemBlockStore::new(BLOCK_SIZE).expect("store")),
                Arc::new(MemFileIo::new()),
            )
            .expect("tree"),
        );
        let journal = Journal::open(Arc::new(MemFileIo::new())).expect("journal");
        let coordinator = CoordinatorBuilder::new(journal)
            .component(Arc::clone(&tree))
            .open()
            .expect("coordinator");
        Self { tree, coordinator }
    }

    fn insert_keys(&self, keys: &[u64]) {
        self.coordinator
            .execute_write(|txn| {
                for key in keys {
                    let bytes = key.to_be_bytes();
                    self.tree.insert(txn, &Record::new(&bytes, &bytes))?;
                }
                Ok(())
            })
            .expect("insert");
    }

    fn point_lookup(&self, rng: &mut ChaCha8Rng, samples: usize) {
        let txn = self.coordinator.begin(TxnMode::Read).expect("read txn");
        for _ in 0..samples {
            let key = rng.gen_range(0..INSERT_COUNT).to_be_bytes();
            black_box(self.tree.find(&txn, &key).expect("find"));
        }
        txn.end().expect("end");
    }

    fn range_scan(&self, rng: &mut ChaCha8Rng, width: u64) {
        let txn = self.coordinator.begin(TxnMode::Read).expect("read txn");
        let start = rng.gen_range(0..INSERT_COUNT - width);
        let low = start.to_be_bytes();
        let high = (start + width).to_be_bytes();
        let seen = self
            .tree
            .find_range(&txn, Some(&low), Some(&high))
            .expect("range")
            .count();
        black_box(seen);
        drop(txn);
    }
}

criterion_group!(benches, micro_btree, micro_triples);
criterion_main!(benches);
