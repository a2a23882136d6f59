//! TICKVAULT - Integration Tests
//! End-to-end tests for the log store and the trigger scheduler:
//! put → reopen → replay, register → fire, restart → recover, compaction
//! under concurrent load.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tickvault::config::{Config, OverduePolicy};
use tickvault::engine::codec::{BincodeCodec, Codec};
use tickvault::engine::log_store::LogStore;
use tickvault::engine::trigger::TriggerId;
use tickvault::engine::TriggerScheduler;
use tickvault::error::{Result, TickError};

mod common {
    use super::*;

    /// Create a Config pointing into a temporary directory.
    pub fn temp_config(dir: &std::path::Path) -> Config {
        Config::new(dir.join("ticks")).with_sync_writes(false)
    }

    /// Scheduler whose fired payloads come out of the returned channel.
    pub fn open_scheduler(config: Config) -> (TriggerScheduler<String>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let scheduler = TriggerScheduler::builder(config, BincodeCodec::<String>::new())
            .on_fire(move |msg: String| {
                let _ = tx.lock().unwrap().send(msg);
            })
            .open()
            .unwrap();
        (scheduler, rx)
    }
}

/// Rejects every payload it is asked to encode or decode.
struct RejectingCodec;

impl Codec<String> for RejectingCodec {
    fn serialize(&self, _payload: &String) -> Result<Vec<u8>> {
        Err(TickError::Serialization("rejected".into()))
    }

    fn deserialize(&self, _bytes: &[u8]) -> Result<String> {
        Err(TickError::Deserialization("rejected".into()))
    }
}

#[test]
fn test_store_concrete_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store");
    {
        let store = LogStore::open(&path, true).unwrap();
        store.put(b"1000", b"a").unwrap();
        store.put(b"1000", b"b").unwrap();
        store.put(b"2000", b"x").unwrap();
        store.delete(b"2000").unwrap();
    }
    let store = LogStore::open(&path, true).unwrap();
    assert_eq!(store.get(b"1000").unwrap(), Some(b"b".to_vec()));
    assert_eq!(store.get(b"2000").unwrap(), None);
}

#[test]
fn test_store_round_trip_many_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = LogStore::open(dir.path(), false).unwrap();
    for i in 0..200u32 {
        let key = format!("key_{:04}", i % 50).into_bytes();
        store.put(&key, format!("value_{}", i).as_bytes()).unwrap();
    }
    for i in 150..200u32 {
        let key = format!("key_{:04}", i % 50).into_bytes();
        assert_eq!(store.get(&key).unwrap(), Some(format!("value_{}", i).into_bytes()));
    }
    assert_eq!(store.len(), 50);
}

#[test]
fn test_fires_once_after_delay() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, rx) = common::open_scheduler(common::temp_config(dir.path()));

    let registered = Instant::now();
    let id = scheduler
        .register(Duration::from_millis(50), "wake up".to_string())
        .unwrap();
    assert_eq!(scheduler.pending(), 1);
    assert!(scheduler.payload_bytes(&id).unwrap().is_some());

    let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(msg, "wake up");
    assert!(registered.elapsed() >= Duration::from_millis(50));

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(scheduler.metrics().total_fired(), 1);
}

#[test]
fn test_never_fires_before_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let fired_at = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fired_at);
    let scheduler = TriggerScheduler::builder(
        common::temp_config(dir.path()),
        BincodeCodec::<u64>::new(),
    )
    .on_fire(move |deadline_ms: u64| {
        sink.lock().unwrap().push((deadline_ms, SystemTime::now()));
    })
    .open()
    .unwrap();

    for delay in [1u64, 5, 17, 33, 64, 120] {
        let deadline = SystemTime::now() + Duration::from_millis(delay);
        let deadline_ms = deadline
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        scheduler.register_at(deadline, deadline_ms).unwrap();
    }

    let until = Instant::now() + Duration::from_secs(5);
    while fired_at.lock().unwrap().len() < 6 && Instant::now() < until {
        thread::sleep(Duration::from_millis(10));
    }
    let fired = fired_at.lock().unwrap();
    assert_eq!(fired.len(), 6);
    for (deadline_ms, at) in fired.iter() {
        let at_ms = at.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_millis() as u64;
        assert!(at_ms >= *deadline_ms);
    }
}

#[test]
fn test_immediate_fire_is_synchronous() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, rx) = common::open_scheduler(common::temp_config(dir.path()));

    let id = scheduler.register(Duration::ZERO, "now".to_string()).unwrap();
    assert_eq!(rx.try_recv().unwrap(), "now");
    assert_eq!(scheduler.payload_bytes(&id).unwrap(), None);

    let past = SystemTime::now() - Duration::from_secs(10);
    scheduler.register_at(past, "late".to_string()).unwrap();
    assert_eq!(rx.try_recv().unwrap(), "late");
    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn test_serialization_failure_leaves_no_record() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = TriggerScheduler::builder(common::temp_config(dir.path()), RejectingCodec)
        .on_fire(|_: String| {})
        .open()
        .unwrap();
    let result = scheduler.register(Duration::from_secs(1), "payload".to_string());
    assert!(matches!(result, Err(TickError::Serialization(_))));
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(scheduler.store_stats().file_size, 0);
}

#[test]
fn test_same_deadline_does_not_collide() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, rx) = common::open_scheduler(common::temp_config(dir.path()));
    let at = SystemTime::now() + Duration::from_millis(80);
    let a = scheduler.register_at(at, "first".to_string()).unwrap();
    let b = scheduler.register_at(at, "second".to_string()).unwrap();
    assert_eq!(a.deadline_nanos, b.deadline_nanos);
    assert_ne!(a, b);
    assert_eq!(scheduler.pending(), 2);

    let mut got = vec![
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
    ];
    got.sort();
    assert_eq!(got, vec!["first".to_string(), "second".to_string()]);
}

#[test]
fn test_recover_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path());

    // Phase 1: register and drop before the deadline (simulates a restart)
    {
        let (scheduler, rx) = common::open_scheduler(config.clone());
        scheduler
            .register(Duration::from_millis(400), "survivor".to_string())
            .unwrap();
        scheduler.shutdown();
        assert!(rx.try_recv().is_err());
    }

    // Phase 2: reopen, recover, and receive it
    let (scheduler, rx) = common::open_scheduler(config);
    assert_eq!(scheduler.pending(), 1);
    let report = scheduler.recover().unwrap();
    assert_eq!(report.rescheduled, 1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "survivor");

    // recovery runs once
    assert_eq!(scheduler.recover().unwrap().rescheduled, 0);
}

#[test]
fn test_register_before_recover_delivers_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path());
    {
        let (scheduler, _rx) = common::open_scheduler(config.clone());
        scheduler
            .register(Duration::from_millis(300), "old".to_string())
            .unwrap();
        scheduler.shutdown();
    }

    let (scheduler, rx) = common::open_scheduler(config);
    scheduler
        .register(Duration::from_millis(100), "once".to_string())
        .unwrap();
    let report = scheduler.recover().unwrap();
    assert_eq!(report.rescheduled, 1);

    thread::sleep(Duration::from_millis(800));
    let mut got: Vec<String> = rx.try_iter().collect();
    got.sort();
    assert_eq!(got, vec!["old".to_string(), "once".to_string()]);
    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn test_huge_delay_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path());
    {
        let (scheduler, rx) = common::open_scheduler(config.clone());
        let id = scheduler.register(Duration::MAX, "someday".to_string()).unwrap();
        assert_eq!(id.deadline_nanos, u64::MAX);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
    let (scheduler, _rx) = common::open_scheduler(config);
    let report = scheduler.recover().unwrap();
    assert_eq!(report.rescheduled, 1);
    assert_eq!(scheduler.pending(), 1);
}

#[test]
fn test_overdue_dropped_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path());
    {
        let (scheduler, _rx) = common::open_scheduler(config.clone());
        scheduler
            .register(Duration::from_millis(30), "missed".to_string())
            .unwrap();
    }
    thread::sleep(Duration::from_millis(60));

    let (scheduler, rx) = common::open_scheduler(config.clone());
    let report = scheduler.recover().unwrap();
    assert_eq!(report.overdue_dropped, 1);
    assert_eq!(report.rescheduled, 0);
    assert_eq!(scheduler.pending(), 0);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    drop(scheduler);

    // the dropped record is gone for good
    let (scheduler, _rx) = common::open_scheduler(config);
    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn test_overdue_fired_late_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path()).with_overdue_policy(OverduePolicy::FireImmediately);
    {
        let (scheduler, _rx) = common::open_scheduler(config.clone());
        scheduler
            .register(Duration::from_millis(30), "late".to_string())
            .unwrap();
    }
    thread::sleep(Duration::from_millis(60));

    let (scheduler, rx) = common::open_scheduler(config);
    let report = scheduler.recover().unwrap();
    assert_eq!(report.overdue_fired, 1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
    thread::sleep(Duration::from_millis(20));
    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn test_recover_stops_on_bad_payload() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path());
    {
        let store = LogStore::open(&config.data_dir, false).unwrap();
        let id = TriggerId::new(SystemTime::now() + Duration::from_secs(60), 0);
        // too short for a bincode String
        store.put(&id.to_key(), &[1, 2]).unwrap();
    }
    let (scheduler, _rx) = common::open_scheduler(config);
    assert!(matches!(
        scheduler.recover(),
        Err(TickError::Deserialization(_))
    ));
    // nothing was deleted
    assert_eq!(scheduler.pending(), 1);
}

#[test]
fn test_compaction_preserves_live_set() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path());
    let (scheduler, rx) = common::open_scheduler(config.clone());

    let mut live = Vec::new();
    for i in 0..100 {
        if i % 2 == 0 {
            let id = scheduler
                .register(Duration::from_secs(3600), format!("pending_{}", i))
                .unwrap();
            live.push((id, scheduler.payload_bytes(&id).unwrap().unwrap()));
        } else {
            scheduler.register(Duration::ZERO, format!("done_{}", i)).unwrap();
        }
    }
    assert_eq!(rx.try_iter().count(), 50);
    let before = scheduler.store_stats();
    assert_eq!(before.total_records, 150);

    let stats = scheduler.compact().unwrap();
    assert_eq!(stats.keys_copied, 50);
    assert!(stats.bytes_after < stats.bytes_before);
    assert!(!scheduler.is_compacting());
    assert!(!config.compaction_dir().exists());

    let after = scheduler.store_stats();
    assert_eq!(after.live_keys, 50);
    assert_eq!(after.total_records, 50);
    for (id, bytes) in &live {
        assert_eq!(scheduler.payload_bytes(id).unwrap().as_ref(), Some(bytes));
    }

    // the compacted file is the one found at the original path
    drop(scheduler);
    let store = LogStore::open(&config.data_dir, false).unwrap();
    assert_eq!(store.len(), 50);
    assert_eq!(store.stats().total_records, 50);
}

#[test]
fn test_writes_after_compaction_persist() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path());
    let (scheduler, _rx) = common::open_scheduler(config.clone());
    scheduler.register(Duration::from_secs(3600), "before".to_string()).unwrap();
    scheduler.compact().unwrap();
    let id = scheduler
        .register(Duration::from_secs(3600), "after".to_string())
        .unwrap();
    let buffered = scheduler.metrics().buffered_mutations.load(Ordering::Relaxed);
    scheduler.register(Duration::from_secs(3600), "again".to_string()).unwrap();
    // the compaction flag no longer mirrors writes
    assert_eq!(
        scheduler.metrics().buffered_mutations.load(Ordering::Relaxed),
        buffered
    );

    // a second pass works too
    scheduler.compact().unwrap();
    drop(scheduler);

    let (scheduler, _rx) = common::open_scheduler(config);
    assert_eq!(scheduler.pending(), 3);
    assert!(scheduler.payload_bytes(&id).unwrap().is_some());
}

#[test]
fn test_compaction_absorbs_concurrent_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path());
    let (scheduler, rx) = common::open_scheduler(config.clone());
    let scheduler = Arc::new(scheduler);

    for i in 0..300 {
        scheduler
            .register(Duration::from_secs(3600), format!("seed_{}", i))
            .unwrap();
    }

    // Writers register long-lived triggers (puts) and already-due ones
    // (put + delete) while compaction passes run.
    let expected = Arc::new(Mutex::new(HashSet::new()));
    let fired_inline = Arc::new(AtomicUsize::new(0));
    let mut writers = Vec::new();
    for w in 0..4 {
        let scheduler = Arc::clone(&scheduler);
        let expected = Arc::clone(&expected);
        let fired_inline = Arc::clone(&fired_inline);
        writers.push(thread::spawn(move || {
            for i in 0..150 {
                if i % 3 == 0 {
                    scheduler
                        .register(Duration::ZERO, format!("now_{}_{}", w, i))
                        .unwrap();
                    fired_inline.fetch_add(1, Ordering::SeqCst);
                } else {
                    let id = scheduler
                        .register(Duration::from_secs(3600), format!("later_{}_{}", w, i))
                        .unwrap();
                    expected.lock().unwrap().insert(id);
                }
            }
        }));
    }

    let mut passes = 0;
    while writers.iter().any(|w| !w.is_finished()) || passes == 0 {
        scheduler.compact().unwrap();
        passes += 1;
    }
    for writer in writers {
        writer.join().unwrap();
    }
    scheduler.compact().unwrap();

    let expected = expected.lock().unwrap().clone();
    assert_eq!(rx.try_iter().count(), fired_inline.load(Ordering::SeqCst));
    assert_eq!(scheduler.pending(), 300 + expected.len());
    for id in &expected {
        assert!(scheduler.payload_bytes(id).unwrap().is_some());
    }

    // Reference run without compaction: same operations, same live set size.
    let reference_dir = tempfile::tempdir().unwrap();
    let (reference, _ref_rx) = common::open_scheduler(common::temp_config(reference_dir.path()));
    for i in 0..300 {
        reference
            .register(Duration::from_secs(3600), format!("seed_{}", i))
            .unwrap();
    }
    for w in 0..4 {
        for i in 0..150 {
            if i % 3 == 0 {
                reference
                    .register(Duration::ZERO, format!("now_{}_{}", w, i))
                    .unwrap();
            } else {
                reference
                    .register(Duration::from_secs(3600), format!("later_{}_{}", w, i))
                    .unwrap();
            }
        }
    }
    assert_eq!(reference.pending(), scheduler.pending());

    // and the compacted log replays to the same payloads
    let live = scheduler.store_stats().live_keys;
    drop(scheduler);
    drop(reference);
    let compacted = live_payloads(&config.data_dir);
    assert_eq!(compacted.len(), live);
    assert_eq!(
        compacted,
        live_payloads(&common::temp_config(reference_dir.path()).data_dir)
    );
}

/// Decoded payloads of every live record in the store at `dir`.
fn live_payloads(dir: &std::path::Path) -> HashSet<String> {
    let store = LogStore::open(dir, false).unwrap();
    let codec = BincodeCodec::<String>::new();
    store
        .list_keys()
        .iter()
        .map(|key| codec.deserialize(&store.get(key).unwrap().unwrap()).unwrap())
        .collect()
}

#[test]
fn test_compact_if_needed() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path()).with_compaction_garbage_ratio(0.5);
    let (scheduler, _rx) = common::open_scheduler(config);

    for i in 0..10 {
        scheduler
            .register(Duration::from_secs(3600), format!("keep_{}", i))
            .unwrap();
    }
    assert_eq!(scheduler.compact_if_needed().unwrap(), None);

    for i in 0..10 {
        scheduler.register(Duration::ZERO, format!("gone_{}", i)).unwrap();
    }
    // 10 live keys out of 30 records
    let stats = scheduler.compact_if_needed().unwrap().unwrap();
    assert_eq!(stats.keys_copied, 10);
    assert_eq!(scheduler.store_stats().total_records, 10);
    assert_eq!(scheduler.metrics().compactions.load(Ordering::Relaxed), 1);
}

#[test]
fn test_fires_during_compaction_are_not_resurrected() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path());
    let (scheduler, rx) = common::open_scheduler(config.clone());
    let scheduler = Arc::new(scheduler);

    // many triggers due in a short window, compaction runs while they fire
    for i in 0..200 {
        scheduler
            .register(Duration::from_millis(20 + (i % 30)), format!("t{}", i))
            .unwrap();
    }
    let until = Instant::now() + Duration::from_secs(5);
    while scheduler.metrics().total_fired() < 200 && Instant::now() < until {
        scheduler.compact().unwrap();
    }
    assert_eq!(rx.try_iter().count(), 200);
    assert_eq!(scheduler.pending(), 0);

    drop(scheduler);
    let store = LogStore::open(&config.data_dir, false).unwrap();
    assert!(store.is_empty());
}
