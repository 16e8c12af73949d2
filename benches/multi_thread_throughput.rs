use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dashmap::DashMap;
use rand::prelude::*;
use std::sync::Arc;
use std::thread;
use syncmap_rs::SyncMap;

// Generate test data
fn generate_test_data(size: usize) -> Vec<(u64, u64)> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..size).map(|_| (rng.gen(), rng.gen())).collect()
}

/// Splits `len` items into `parts` contiguous chunks and returns chunk `idx`.
fn chunk(len: usize, parts: usize, idx: usize) -> std::ops::Range<usize> {
    let chunk_size = len / parts;
    let start = idx * chunk_size;
    let end = if idx == parts - 1 {
        len
    } else {
        start + chunk_size
    };
    start..end
}

fn benchmark_multi_thread_disjoint_write(c: &mut Criterion) {
    let test_data = Arc::new(generate_test_data(100000));
    let num_threads = num_cpus::get();

    // Settle every key first; the timed loop overwrites each thread's own keys.
    let syncmap = Arc::new(SyncMap::new());
    let dashmap = Arc::new(DashMap::new());
    for (k, v) in test_data.iter() {
        syncmap.insert(*k, *v);
        dashmap.insert(*k, *v);
    }
    syncmap.for_each(|_, _| true);

    c.bench_function("syncmap_multi_overwrite", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..num_threads)
                .map(|thread_id| {
                    let syncmap = Arc::clone(&syncmap);
                    let test_data = Arc::clone(&test_data);

                    thread::spawn(move || {
                        for i in chunk(test_data.len(), num_threads, thread_id) {
                            let (k, v) = test_data[i];
                            syncmap.insert(k, v.wrapping_add(1));
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
        })
    });

    c.bench_function("dashmap_multi_overwrite", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..num_threads)
                .map(|thread_id| {
                    let dashmap = Arc::clone(&dashmap);
                    let test_data = Arc::clone(&test_data);

                    thread::spawn(move || {
                        for i in chunk(test_data.len(), num_threads, thread_id) {
                            let (k, v) = test_data[i];
                            black_box(dashmap.insert(k, v.wrapping_add(1)));
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
        })
    });
}

fn benchmark_multi_thread_read(c: &mut Criterion) {
    let test_data = Arc::new(generate_test_data(100000));
    let num_threads = num_cpus::get();

    let syncmap = Arc::new(SyncMap::new());
    for (k, v) in test_data.iter() {
        syncmap.insert(*k, *v);
    }
    syncmap.for_each(|_, _| true);

    let dashmap = Arc::new(DashMap::new());
    for (k, v) in test_data.iter() {
        dashmap.insert(*k, *v);
    }

    c.bench_function("syncmap_multi_read", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..num_threads)
                .map(|thread_id| {
                    let syncmap = Arc::clone(&syncmap);
                    let test_data = Arc::clone(&test_data);

                    thread::spawn(move || {
                        for i in chunk(test_data.len(), num_threads, thread_id) {
                            let (k, _) = test_data[i];
                            black_box(syncmap.get(&k));
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
        })
    });

    c.bench_function("dashmap_multi_read", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..num_threads)
                .map(|thread_id| {
                    let dashmap = Arc::clone(&dashmap);
                    let test_data = Arc::clone(&test_data);

                    thread::spawn(move || {
                        for i in chunk(test_data.len(), num_threads, thread_id) {
                            let (k, _) = test_data[i];
                            black_box(dashmap.get(&k).map(|r| *r));
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
        })
    });
}

criterion_group!(
    benches,
    benchmark_multi_thread_disjoint_write,
    benchmark_multi_thread_read
);
criterion_main!(benches);
