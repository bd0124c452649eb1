//! Benchmarks for opsync replication hot paths
//!
//! Run with: cargo bench -p opsync-core
//!
//! These benchmarks establish performance baselines for:
//! - Patch digest encode/decode
//! - Custody bounds and nearest-contact lookups
//! - Header signing and verification

use std::net::SocketAddr;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use opsync_core::digest::{self, entry_size, PatchEntry};
use opsync_core::routing::recalc_bounds;
use opsync_core::{NodeId, NodeKeypair, ObjectHeader, ObjectKey, RoutingTable, ServiceTag, SignedData};

fn entries(count: usize, key_width: usize) -> Vec<PatchEntry> {
    (0..count)
        .map(|i| {
            PatchEntry::new(
                NodeId((i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)),
                ObjectKey(vec![i as u8; key_width]),
                i as u32,
            )
        })
        .collect()
}

// ============================================================================
// Digest Benchmarks
// ============================================================================

fn bench_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");

    for count in [10, 100, 1000] {
        let list = entries(count, 8);
        let bytes = digest::encode(&list, 8).unwrap();
        group.throughput(Throughput::Bytes((count * entry_size(8)) as u64));

        group.bench_with_input(BenchmarkId::new("encode", count), &list, |b, list| {
            b.iter(|| black_box(digest::encode(list, 8).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("decode", count), &bytes, |b, bytes| {
            b.iter(|| black_box(digest::decode(bytes, 8).unwrap()))
        });
    }

    group.finish();
}

// ============================================================================
// Routing Benchmarks
// ============================================================================

fn table(contacts: u64) -> RoutingTable {
    let mut table = RoutingTable::new(NodeId(1), 8);
    let now = Instant::now();
    for i in 0..contacts {
        let id = NodeId(i.wrapping_mul(0xbf58_476d_1ce4_e5b9) | 2);
        let addr = SocketAddr::from(([10, 0, (i >> 8) as u8, i as u8], 4970));
        table.touch(id, addr, now);
    }
    table
}

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");

    for contacts in [16u64, 256, 4096] {
        let routing = table(contacts);
        let ids: Vec<NodeId> = routing.contacts().map(|c| c.id).collect();

        group.bench_with_input(BenchmarkId::new("closest_8", contacts), &routing, |b, routing| {
            b.iter(|| black_box(routing.closest(NodeId(0xdead_beef), 8)))
        });
        group.bench_with_input(BenchmarkId::new("recalc_bounds", contacts), &ids, |b, ids| {
            b.iter(|| black_box(recalc_bounds(NodeId(0xdead_beef), ids.iter().copied(), 8)))
        });
    }

    group.finish();
}

// ============================================================================
// Signing Benchmarks
// ============================================================================

fn bench_signing(c: &mut Criterion) {
    let keypair = NodeKeypair::from_seed(&[7u8; 32]);
    let header = ObjectHeader::new(&keypair, ServiceTag::BOARD, ObjectKey(vec![0; 8]), vec![0; 64]);
    let signed = SignedData::sign(&keypair, &header).unwrap();

    c.bench_function("sign_header", |b| {
        b.iter(|| black_box(SignedData::sign(&keypair, &header).unwrap()))
    });
    c.bench_function("verify_header", |b| b.iter(|| black_box(signed.verify().unwrap())));
}

criterion_group!(benches, bench_digest, bench_routing, bench_signing);
criterion_main!(benches);
