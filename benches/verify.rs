use std::fs;

use bundle_delivery::{
    cache::verify_file,
    hasher::{content_hash, crc32},
    manifest::BundleRecord,
    settings::VerifyLevel,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn verify_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let path = dir.path().join("bundle");
    fs::write(&path, &data).expect("Failed to write bundle");

    let record = BundleRecord {
        name: "bundle".to_string(),
        hash: content_hash(&data),
        crc: crc32(&data),
        size: data.len() as u64,
        dependencies: vec![],
        tags: vec![],
        is_raw_file: false,
        is_builtin: false,
    };

    for (name, level) in [
        ("verify_middle", VerifyLevel::Middle),
        ("verify_high", VerifyLevel::High),
    ] {
        c.bench_function(name, |b| {
            b.iter(|| verify_file(black_box(&path), &record, level).expect("Failed to verify"))
        });
    }

    c.bench_function("content_hash", |b| b.iter(|| content_hash(black_box(&data))));
}

criterion_group!(benches, verify_benchmark);
criterion_main!(benches);
