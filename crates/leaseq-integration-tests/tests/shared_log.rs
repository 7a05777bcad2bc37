//! Integration tests for several instances sharing one durable log
//!
//! These tests verify:
//! - A message is leased to exactly one instance at a time
//! - Deletes and expired leases are seen by every instance after replay
//! - Replaying the same log always produces the same view
//! - Concurrent writers never interleave or lose records

mod common;

use common::{queue, SharedLog};
use leaseq_runtime::{Clock, DeleteOutcome, LogRecord, Operation, VisibilityTimeout};
use std::collections::HashSet;
use std::sync::Arc;

fn lease(secs: u32) -> VisibilityTimeout {
    VisibilityTimeout::from_secs(secs).unwrap()
}

#[test]
fn test_push_on_one_instance_is_pulled_by_another() {
    let log = SharedLog::new(0);
    let producer = log.instance();
    let consumer = log.instance();

    producer
        .push(&queue("Q1"), "A".to_string(), Some("a".to_string()))
        .unwrap();

    let pulled = consumer.pull(&queue("Q1"), lease(60)).unwrap().unwrap();
    assert_eq!(pulled.handle, "a");
    assert_eq!(pulled.content, "A");
    assert_eq!(pulled.visibility_timestamp, 60_000);
}

#[test]
fn test_leased_message_is_invisible_to_other_instances() {
    let log = SharedLog::new(0);
    let first = log.instance();
    let second = log.instance();

    first
        .push(&queue("Q1"), "A".to_string(), Some("a".to_string()))
        .unwrap();
    assert!(first.pull(&queue("Q1"), lease(60)).unwrap().is_some());

    log.clock.set_now_ms(30_000).unwrap();
    assert!(second.pull(&queue("Q1"), lease(60)).unwrap().is_none());

    // The lease lapses and the other instance gets the message
    log.clock.set_now_ms(60_000).unwrap();
    let again = second.pull(&queue("Q1"), lease(60)).unwrap().unwrap();
    assert_eq!(again.handle, "a");
    assert_eq!(again.visibility_timestamp, 120_000);
}

#[test]
fn test_delete_from_one_instance_hides_message_everywhere() {
    let log = SharedLog::new(0);
    let consumer = log.instance();
    let observer = log.instance();

    consumer
        .push(&queue("Q1"), "A".to_string(), Some("a".to_string()))
        .unwrap();
    let message = consumer.pull(&queue("Q1"), lease(60)).unwrap().unwrap();

    log.clock.set_now_ms(10_000).unwrap();
    assert_eq!(consumer.delete(&message).unwrap(), DeleteOutcome::Recorded);

    log.clock.set_now_ms(500_000).unwrap();
    assert!(observer.pull(&queue("Q1"), lease(60)).unwrap().is_none());

    let snapshot = observer.snapshot(&queue("Q1")).unwrap().unwrap();
    assert!(snapshot.pending.is_empty());
    assert!(snapshot.in_flight.is_empty());
}

#[test]
fn test_late_delete_does_not_remove_redelivered_message() {
    let log = SharedLog::new(0);
    let slow = log.instance();
    let fast = log.instance();

    slow.push(&queue("Q1"), "A".to_string(), Some("a".to_string()))
        .unwrap();
    let stale = slow.pull(&queue("Q1"), lease(30)).unwrap().unwrap();

    // The lease lapses and another consumer takes the message
    log.clock.set_now_ms(40_000).unwrap();
    let fresh = fast.pull(&queue("Q1"), lease(30)).unwrap().unwrap();
    assert_eq!(fresh.visibility_timestamp, 70_000);

    // The first consumer's delete arrives late and must not take effect
    slow.delete(&stale).unwrap();

    let snapshot = fast.snapshot(&queue("Q1")).unwrap().unwrap();
    let (pending, in_flight) = snapshot.handles();
    assert!(pending.is_empty());
    assert_eq!(in_flight, vec!["a".to_string()]);
}

#[test]
fn test_fresh_instances_replay_to_identical_views() {
    let log = SharedLog::new(1_000);
    let writer = log.instance_with_handles("w");

    for content in ["one", "two", "three"] {
        writer.push(&queue("Q1"), content.to_string(), None).unwrap();
    }
    writer.push(&queue("Q2"), "other".to_string(), None).unwrap();
    let leased = writer.pull(&queue("Q1"), lease(30)).unwrap().unwrap();
    writer.delete(&leased).unwrap();
    writer.pull(&queue("Q1"), lease(45)).unwrap().unwrap();

    let a = log.instance();
    let b = log.instance();
    for name in ["Q1", "Q2"] {
        assert_eq!(
            a.snapshot(&queue(name)).unwrap(),
            b.snapshot(&queue(name)).unwrap()
        );
    }
    assert_eq!(a.cursor(), b.cursor());

    let q1 = a.snapshot(&queue("Q1")).unwrap().unwrap();
    let (pending, in_flight) = q1.handles();
    assert_eq!(pending, vec!["w-3".to_string()]);
    assert_eq!(in_flight, vec!["w-2".to_string()]);
}

#[test]
fn test_log_records_every_operation_in_order() {
    let log = SharedLog::new(5);
    let instance = log.instance_with_handles("h");

    instance.push(&queue("Q1"), "A".to_string(), None).unwrap();
    let message = instance.pull(&queue("Q1"), lease(30)).unwrap().unwrap();
    instance.delete(&message).unwrap();

    let records: Vec<LogRecord> = log
        .log_lines()
        .iter()
        .enumerate()
        .map(|(i, line)| LogRecord::decode(line, i + 1).unwrap())
        .collect();

    let operations: Vec<Operation> = records.iter().map(|r| r.operation).collect();
    assert_eq!(
        operations,
        vec![Operation::Push, Operation::Pull, Operation::Delete]
    );
    assert_eq!(records[0].message.visibility_timestamp, 5);
    assert_eq!(records[1].message.visibility_timestamp, 30_005);
    assert_eq!(records[2].recorded_at, 5);
}

#[test]
fn test_concurrent_pulls_lease_each_message_once() {
    const MESSAGES: usize = 40;
    const WORKERS: usize = 4;

    let log = Arc::new(SharedLog::new(0));
    let producer = log.instance_with_handles("m");
    for i in 0..MESSAGES {
        producer
            .push(&queue("work"), format!("job-{}", i), None)
            .unwrap();
    }

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                let instance = log.instance();
                let mut leased = Vec::new();
                while let Some(message) = instance.pull(&queue("work"), lease(600)).unwrap() {
                    leased.push(message.handle);
                }
                leased
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for worker in workers {
        for handle in worker.join().unwrap() {
            total += 1;
            assert!(seen.insert(handle.clone()), "{} leased twice", handle);
        }
    }
    assert_eq!(total, MESSAGES);
    assert_eq!(log.log_lines().len(), MESSAGES * 2);
}

#[test]
fn test_concurrent_pushes_produce_complete_lines() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 25;

    let log = Arc::new(SharedLog::new(0));
    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                let instance = log.instance_with_handles(&format!("w{}", w));
                for i in 0..PER_WRITER {
                    instance
                        .push(&queue("Q1"), format!("payload {} from {}", i, w), None)
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let lines = log.log_lines();
    assert_eq!(lines.len(), WRITERS * PER_WRITER);
    for (i, line) in lines.iter().enumerate() {
        let record = LogRecord::decode(line, i + 1).unwrap();
        assert_eq!(record.operation, Operation::Push);
    }

    let reader = log.instance();
    let snapshot = reader.snapshot(&queue("Q1")).unwrap().unwrap();
    assert_eq!(snapshot.pending.len(), WRITERS * PER_WRITER);
}

#[test]
fn test_torn_tail_is_skipped_then_overwritten() {
    use std::io::Write;

    let log = SharedLog::new(0);
    let instance = log.instance();
    instance
        .push(&queue("Q1"), "A".to_string(), Some("a".to_string()))
        .unwrap();

    // Simulate a writer that died mid-append
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(log.path().join("QUEUE"))
        .unwrap();
    file.write_all(b"PUSH#$0#$Q1#$b#$ha").unwrap();
    drop(file);

    let reader = log.instance();
    let report = reader.replay().unwrap();
    assert!(report.torn_tail);
    assert_eq!(reader.cursor().records, 1);

    instance
        .push(&queue("Q1"), "C".to_string(), Some("c".to_string()))
        .unwrap();

    let lines = log.log_lines();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("PUSH#$0#$Q1#$c#$C"));

    let snapshot = log.instance().snapshot(&queue("Q1")).unwrap().unwrap();
    let (pending, _) = snapshot.handles();
    assert_eq!(pending, vec!["a".to_string(), "c".to_string()]);
}
