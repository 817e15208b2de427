use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fsapack::checksum::fletcher32;
use fsapack::codec::get_codec;
use fsapack::CompressAlgo;

fn bench_pipeline(c: &mut Criterion) {
    let data = vec![0x5au8; 1024 * 1024];
    c.bench_function("fletcher32_1mb", |b| b.iter(|| fletcher32(black_box(&data))));

    let mut dst = vec![0u8; data.len() + data.len() / 16 + 64 + 3];
    let gzip = get_codec(CompressAlgo::Gzip).unwrap();
    let zstd = get_codec(CompressAlgo::Zstd).unwrap();
    c.bench_function("gzip_encode_1mb", |b| {
        b.iter(|| gzip.encode(black_box(&data), &mut dst, 6))
    });
    c.bench_function("zstd_encode_1mb", |b| {
        b.iter(|| zstd.encode(black_box(&data), &mut dst, 3))
    });
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
