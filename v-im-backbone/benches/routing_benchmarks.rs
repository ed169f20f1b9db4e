use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::time::Duration;
use tokio::runtime::Runtime;

use v_im_backbone::cluster::placement::{hrw_select, partition_for};
use v_im_backbone::dedup::{DedupStore, MemoryDedup, SledDedup};
use v_im_backbone::domain::{Envelope, Target};
use v_im_backbone::sequence::{MemorySequence, SequenceGenerator, SledSequence};
use v_im_backbone::{Backbone, BackboneConfig};

fn benchmark_sequence(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let memory = MemorySequence::new();
    c.bench_function("sequence_next_memory", |b| {
        b.iter(|| rt.block_on(memory.next(black_box("user:bob"))).unwrap())
    });

    let db = sled::Config::new().temporary(true).open().unwrap();
    let durable = SledSequence::open(&db).unwrap();
    c.bench_function("sequence_next_sled", |b| {
        b.iter(|| rt.block_on(durable.next(black_box("user:bob"))).unwrap())
    });
}

fn benchmark_dedup(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let ttl = Duration::from_secs(60);
    let memory = MemoryDedup::new();
    let db = sled::Config::new().temporary(true).open().unwrap();
    let durable = SledDedup::open(&db).unwrap();

    let mut i = 0u64;
    c.bench_function("dedup_mark_if_absent_memory", |b| {
        b.iter(|| {
            i += 1;
            rt.block_on(memory.mark_if_absent(&format!("persist:{}", i), ttl))
                .unwrap()
        })
    });
    let mut j = 0u64;
    c.bench_function("dedup_mark_if_absent_sled", |b| {
        b.iter(|| {
            j += 1;
            rt.block_on(durable.mark_if_absent(&format!("persist:{}", j), ttl))
                .unwrap()
        })
    });
}

fn benchmark_placement(c: &mut Criterion) {
    let nodes: Vec<String> = (0..16).map(|i| format!("gw-{}", i)).collect();
    c.bench_function("partition_for", |b| {
        b.iter(|| partition_for(black_box("group:lobby"), 16))
    });
    c.bench_function("hrw_select_16_nodes", |b| {
        b.iter(|| hrw_select(black_box("offline_msg-3"), nodes.iter().map(|n| n.as_str())))
    });
}

fn benchmark_route_slow_path(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut config = BackboneConfig::default();
    config.storage_path = None;
    let backbone = rt.block_on(Backbone::start(config)).unwrap();
    c.bench_function("route_to_offline_user", |b| {
        b.iter(|| {
            rt.block_on(
                backbone
                    .router()
                    .route(Envelope::new("alice", Target::User("bob".into()), "hello")),
            )
            .unwrap()
        })
    });
    rt.block_on(backbone.shutdown());
}

criterion_group!(
    benches,
    benchmark_sequence,
    benchmark_dedup,
    benchmark_placement,
    benchmark_route_slow_path
);
criterion_main!(benches);
