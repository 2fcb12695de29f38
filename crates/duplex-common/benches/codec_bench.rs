// Criterion benchmarks for the duplex-common codecs
//
// Run benchmarks with:
//   cargo bench -p duplex-common

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use duplex_common::{ChannelIdentity, FrameReader, FrameWriter, PeerId};
use std::io::Cursor;

fn identity_with(addresses: usize) -> ChannelIdentity {
    let addresses = (0..addresses).map(|i| format!("10.0.{}.{}:7000", i / 250, i % 250)).collect();
    ChannelIdentity::new(PeerId::random(), addresses, 7000)
}

fn bench_identity_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity_encode");

    let small = identity_with(2);
    let large = identity_with(64);

    group.bench_function("encode_small", |b| {
        b.iter(|| black_box(&small).encode());
    });

    group.bench_function("encode_large", |b| {
        b.iter(|| black_box(&large).encode());
    });

    group.finish();
}

fn bench_identity_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity_decode");

    let small = identity_with(2).encode().unwrap();
    let large = identity_with(64).encode().unwrap();

    group.bench_function("decode_small", |b| {
        b.iter(|| ChannelIdentity::decode(black_box(&small)));
    });

    group.bench_function("decode_large", |b| {
        b.iter(|| ChannelIdentity::decode(black_box(&large)));
    });

    group.finish();
}

fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames");

    let payload = vec![0xABu8; 4096];
    let mut encoded = Vec::new();
    {
        let mut writer = FrameWriter::new(&mut encoded, 10 * 1024);
        for _ in 0..64 {
            writer.write_frame(&payload).unwrap();
        }
        writer.flush().unwrap();
    }

    group.bench_function("write_64_frames", |b| {
        b.iter(|| {
            let mut writer = FrameWriter::new(Vec::with_capacity(encoded.len()), 10 * 1024);
            for _ in 0..64 {
                writer.write_frame(black_box(&payload)).unwrap();
            }
            writer.flush().unwrap();
        });
    });

    group.bench_function("read_64_frames", |b| {
        b.iter(|| {
            let mut reader = FrameReader::new(Cursor::new(black_box(&encoded)), 10 * 1024);
            for _ in 0..64 {
                reader.read_frame().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_identity_encode, bench_identity_decode, bench_frames);
criterion_main!(benches);
