use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use syncmap_rs::SyncMap;

#[test]
fn for_each_visits_every_key_once() {
    let m: SyncMap<u64, u64> = SyncMap::new();
    for i in 0..50u64 {
        m.insert(i, i * 2);
    }

    let mut seen = HashSet::new();
    let mut sum_vals = 0u64;
    m.for_each(|k, v| {
        assert!(seen.insert(*k), "key {} visited twice", k);
        sum_vals += v;
        true
    });

    assert_eq!(seen.len(), 50);
    assert_eq!(sum_vals, (0..50).map(|i| i * 2).sum());
}

#[test]
fn for_each_early_termination() {
    let m: SyncMap<i32, i32> = SyncMap::new();
    for i in 0..20 {
        m.insert(i, i * 3);
    }

    let mut count = 0;
    m.for_each(|_, _| {
        count += 1;
        count < 5
    });
    assert_eq!(count, 5);
}

#[test]
fn for_each_skips_deleted_keys() {
    let m: SyncMap<i32, i32> = SyncMap::new();
    for i in 0..10 {
        m.insert(i, i);
    }
    m.for_each(|_, _| true);
    for i in 0..5 {
        m.remove(&i);
    }
    // Dirty-only key mixed with cleared snapshot entries.
    m.insert(100, 100);

    let mut keys = Vec::new();
    m.for_each(|k, _| {
        keys.push(*k);
        true
    });
    keys.sort();
    assert_eq!(keys, vec![5, 6, 7, 8, 9, 100]);
}

#[test]
fn for_each_on_empty_map() {
    let m: SyncMap<i32, i32> = SyncMap::new();
    m.for_each(|k, _| panic!("unexpected key {}", k));
}

#[test]
fn for_each_sees_stable_keys_under_concurrent_writes() {
    const STABLE: u64 = 256;
    let m: Arc<SyncMap<u64, u64>> = Arc::new(SyncMap::new());
    for i in 0..STABLE {
        m.insert(i, i);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(4));
    let mut writers = Vec::new();

    // Churn on keys outside the stable range, plus overwrites of stable keys.
    for w in 0..3u64 {
        let map = m.clone();
        let s = stop.clone();
        let b = start.clone();
        writers.push(thread::spawn(move || {
            b.wait();
            let mut n = 0u64;
            while !s.load(Ordering::Relaxed) {
                let k = STABLE + w * 1_000_000 + n;
                map.insert(k, k);
                if n % 2 == 0 {
                    map.remove(&k);
                }
                map.insert(n % STABLE, n % STABLE);
                n += 1;
            }
        }));
    }

    start.wait();
    for _ in 0..50 {
        let mut stable_seen = HashSet::new();
        let mut all_seen = HashSet::new();
        m.for_each(|k, v| {
            assert!(all_seen.insert(*k), "key {} visited twice", k);
            assert_eq!(k, v);
            if *k < STABLE {
                stable_seen.insert(*k);
            }
            true
        });
        assert_eq!(stable_seen.len() as u64, STABLE);
    }

    stop.store(true, Ordering::Relaxed);
    for h in writers {
        h.join().unwrap();
    }
}
