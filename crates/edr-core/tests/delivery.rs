//! End-to-end delivery through spool, connection manager and sender,
//! using the in-memory collector.

use chrono::Utc;
use edr_common::{CanonicalEvent, EventFields, HostIdentity, PlatformTag, ProcessFields};
use edr_core::connection::{ConnectionManager, ConnectionState, MemoryCollector, MemoryTransport};
use edr_core::sender::{drain_pass, DrainStop, Sender};
use edr_spool::Spool;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn process_event(pid: u32) -> CanonicalEvent {
    CanonicalEvent {
        event_id: uuid::Uuid::new_v4(),
        timestamp: Utc::now(),
        hostname: "delivery-host".into(),
        os_type: PlatformTag::Linux,
        fields: EventFields::Process(ProcessFields {
            pid,
            name: format!("proc-{pid}"),
            ..ProcessFields::default()
        }),
        os_variant_fields: BTreeMap::new(),
    }
}

fn pids(events: &[CanonicalEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match &e.fields {
            EventFields::Process(p) => Some(p.pid),
            _ => None,
        })
        .collect()
}

fn manager(collector: &MemoryCollector) -> ConnectionManager<MemoryTransport> {
    ConnectionManager::new(collector.transport(), HostIdentity::default())
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn entries_spooled_while_offline_are_delivered_after_connect() {
    let dir = TempDir::new().unwrap();
    let spool = Arc::new(Spool::open(dir.path()).unwrap());
    let collector = MemoryCollector::new();
    collector.set_reachable(false);
    let conn = Arc::new(manager(&collector));

    for pid in 1..=10 {
        spool.enqueue(&process_event(pid)).unwrap();
    }
    let sender = Sender::spawn(Arc::clone(&spool), Arc::clone(&conn), Duration::from_secs(60)).unwrap();

    assert!(!conn.connect());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(spool.pending_count().unwrap(), 10);

    collector.set_reachable(true);
    assert!(conn.connect());
    assert!(wait_until(Duration::from_secs(5), || {
        spool.pending_count().unwrap() == 0
    }));
    sender.stop();

    assert_eq!(pids(&collector.events()), (1..=10).collect::<Vec<_>>());
}

#[test]
fn crash_between_send_and_remove_redelivers_same_event() {
    let dir = TempDir::new().unwrap();
    let collector = MemoryCollector::new();
    let event = process_event(77);

    // First run: the event reaches the collector but the agent dies before
    // removing the entry.
    {
        let spool = Spool::open(dir.path()).unwrap();
        let id = spool.enqueue(&event).unwrap();
        let conn = manager(&collector);
        assert!(conn.connect());
        let entry = spool.read(&id).unwrap();
        conn.send(&entry.event).unwrap();
    }

    // Second run drains the surviving entry.
    let spool = Spool::open(dir.path()).unwrap();
    assert_eq!(spool.pending_count().unwrap(), 1);
    let conn = manager(&collector);
    assert!(conn.connect());
    let report = drain_pass(&spool, &conn, &AtomicBool::new(false));
    assert_eq!(report.sent, 1);
    assert_eq!(spool.pending_count().unwrap(), 0);

    let delivered = collector.events();
    assert_eq!(delivered.len(), 2);
    // Same id both times so the collector can drop the duplicate.
    assert_eq!(delivered[0].event_id, event.event_id);
    assert_eq!(delivered[1].event_id, event.event_id);
    assert_eq!(collector.registrations(), 2);
}

#[test]
fn transport_failure_mid_drain_keeps_remainder_in_order() {
    let dir = TempDir::new().unwrap();
    let spool = Spool::open(dir.path()).unwrap();
    for pid in 1..=6 {
        spool.enqueue(&process_event(pid)).unwrap();
    }

    let collector = MemoryCollector::new();
    let conn = manager(&collector);
    assert!(conn.connect());
    collector.fail_after(3);

    let report = drain_pass(&spool, &conn, &AtomicBool::new(false));
    assert_eq!(report.sent, 3);
    assert!(matches!(report.stop, DrainStop::Transport(_)));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(spool.pending_count().unwrap(), 3);

    assert!(conn.connect());
    let report = drain_pass(&spool, &conn, &AtomicBool::new(false));
    assert_eq!(report.sent, 3);
    assert_eq!(report.stop, DrainStop::Empty);

    assert_eq!(pids(&collector.events()), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn corrupt_record_is_quarantined_without_stopping_delivery() {
    let dir = TempDir::new().unwrap();
    let spool = Spool::open(dir.path()).unwrap();
    let ids: Vec<_> = (1..=3)
        .map(|pid| spool.enqueue(&process_event(pid)).unwrap())
        .collect();
    std::fs::write(spool.pending_path(&ids[0]), b"\x00\x01garbage").unwrap();

    let collector = MemoryCollector::new();
    let conn = manager(&collector);
    assert!(conn.connect());
    let report = drain_pass(&spool, &conn, &AtomicBool::new(false));

    assert_eq!(report.quarantined, 1);
    assert_eq!(report.sent, 2);
    assert_eq!(pids(&collector.events()), vec![2, 3]);
    assert_eq!(spool.list_quarantined().unwrap(), vec![ids[0].clone()]);
    assert!(spool.quarantine_path(&ids[0]).exists());
}

#[test]
fn stopping_sender_leaves_pending_entries_on_disk() {
    let dir = TempDir::new().unwrap();
    let spool = Arc::new(Spool::open(dir.path()).unwrap());
    let collector = MemoryCollector::new();
    collector.set_reachable(false);
    let conn = Arc::new(manager(&collector));

    let sender = Sender::spawn(Arc::clone(&spool), Arc::clone(&conn), Duration::from_millis(20)).unwrap();
    for pid in 1..=4 {
        spool.enqueue(&process_event(pid)).unwrap();
    }
    thread::sleep(Duration::from_millis(60));
    sender.stop();

    assert_eq!(spool.pending_count().unwrap(), 4);
    assert!(collector.events().is_empty());
}
