//! Benchmarks for the wire codec and the store.

use std::collections::HashMap;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use asset_cache::cache::evictor::{EvictionPolicy, Evictor};
use asset_cache::cache::key::{CacheKey, DIGEST_SIZE};
use asset_cache::cache::store::StoreEntry;
use asset_cache::cache::value::CacheValue;
use asset_cache::protocol::packet::{Packet, CHUNK_SIZE};

fn key(i: u32) -> CacheKey {
    let mut first = [0u8; DIGEST_SIZE];
    first[..4].copy_from_slice(&i.to_le_bytes());
    CacheKey::new(first, [7u8; DIGEST_SIZE])
}

fn bench_packet_codec(c: &mut Criterion) {
    let chunk = Packet::AddChunk {
        key: key(1),
        index: 3,
        data: Bytes::from(vec![0xA5u8; CHUNK_SIZE]),
    };
    let frame = chunk.encode();

    c.bench_function("packet_encode_full_chunk", |b| {
        b.iter(|| black_box(black_box(&chunk).encode()))
    });

    c.bench_function("packet_decode_full_chunk", |b| {
        b.iter(|| black_box(Packet::decode(black_box(frame.clone())).unwrap()))
    });
}

fn bench_value_serialize(c: &mut Criterion) {
    // 1MB artifact split over a few blobs.
    let mut value = CacheValue::new();
    for i in 0..4 {
        value.add(format!("obj/unit{i}.o"), vec![i as u8; 256 * 1024]);
    }
    let data = value.serialize().unwrap();

    c.bench_function("value_serialize_1mb", |b| {
        b.iter(|| black_box(value.serialize().unwrap()))
    });

    c.bench_function("value_deserialize_1mb", |b| {
        b.iter(|| black_box(CacheValue::deserialize(black_box(&data)).unwrap()))
    });
}

fn bench_eviction(c: &mut Criterion) {
    let entries: HashMap<CacheKey, StoreEntry> = (0..10_000)
        .map(|i| {
            let mut value = CacheValue::new();
            value.add("out", vec![0u8; 64 + (i as usize % 512)]);
            (
                key(i),
                StoreEntry::new(value, u64::from(i)),
            )
        })
        .collect();

    for (name, policy) in [
        ("eviction_lrw_100_from_10k", EvictionPolicy::LeastRecentlyWarmed),
        ("eviction_largest_100_from_10k", EvictionPolicy::LargestFirst),
    ] {
        let evictor = Evictor::new(policy);
        c.bench_function(name, |b| {
            b.iter(|| {
                let victims = evictor.select_victims(
                    black_box(entries.iter()),
                    10_000,
                    0,
                    100,
                );
                black_box(victims);
            })
        });
    }
}

criterion_group!(
    benches,
    bench_packet_codec,
    bench_value_serialize,
    bench_eviction,
);
criterion_main!(benches);
