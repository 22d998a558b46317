// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use rand::RngCore;
use rand::SeedableRng;
use shmap::*;

use std::time::Duration;

// A very fast PRNG which is appropriate for testing
pub fn rng() -> impl RngCore {
    rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(0)
}

fn map() -> Shmap {
    Shmap::builder()
        .segments(64)
        .tier_slots(1024)
        .entry_size(768)
        .build()
        .expect("failed to create map")
}

fn keys(key_size: usize, key_count: usize) -> Vec<Vec<u8>> {
    let mut rng = rng();

    let mut keys = Vec::new();
    for _ in 0..key_count {
        let mut key = vec![0; key_size];
        rng.fill_bytes(&mut key);
        keys.push(key);
    }

    keys
}

fn get_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    group.measurement_time(Duration::from_secs(30));
    group.throughput(Throughput::Elements(1));

    for key_size in [1, 255].iter() {
        let keys = keys(*key_size, 10_000);

        let map = map();
        for key in &keys {
            let _ = map.put(key, b"value");
        }

        let mut key = 0;

        group.bench_function(&format!("{}b", key_size), |b| {
            b.iter(|| {
                let _ = map.get(&keys[key]);
                key += 1;
                if key >= keys.len() {
                    key = 0;
                }
            })
        });
    }
}

fn put_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    group.measurement_time(Duration::from_secs(30));
    group.throughput(Throughput::Elements(1));

    for key_size in [1, 255].iter() {
        for value_size in [1, 64, 256].iter() {
            let keys = keys(*key_size, 10_000);
            let value = vec![0x42u8; *value_size];

            let map = map();

            let mut key = 0;

            group.bench_function(&format!("{}b/{}b", key_size, value_size), |b| {
                b.iter(|| {
                    let _ = map.put(&keys[key], &value);
                    key += 1;
                    if key >= keys.len() {
                        key = 0;
                    }
                })
            });
        }
    }
}

criterion_group!(benches, get_benchmark, put_benchmark,);
criterion_main!(benches);
