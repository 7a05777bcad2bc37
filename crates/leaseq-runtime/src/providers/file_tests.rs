//! Tests for the log-backed queue.

use super::*;
use crate::clock::ManualClock;
use crate::message::SequentialHandleGenerator;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    clock: Arc<ManualClock>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            clock: Arc::new(ManualClock::new(0)),
        }
    }

    fn queue(&self, prefix: &str) -> FileQueue {
        FileQueue::open_with(
            self.dir.path(),
            DEFAULT_LOG_FILE_NAME,
            self.clock.clone(),
            Arc::new(SequentialHandleGenerator::new(prefix)),
        )
        .unwrap()
    }

    fn log_path(&self) -> PathBuf {
        self.dir.path().join(DEFAULT_LOG_FILE_NAME)
    }

    fn log_lines(&self) -> Vec<String> {
        std::fs::read_to_string(self.log_path())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn append_raw(&self, bytes: &[u8]) {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.log_path())
            .unwrap();
        file.write_all(bytes).unwrap();
    }
}

fn q1() -> QueueName {
    QueueName::new("Q1".to_string()).unwrap()
}

fn secs(n: u32) -> VisibilityTimeout {
    VisibilityTimeout::from_secs(n).unwrap()
}

#[test]
fn test_open_creates_directory_and_log() {
    let fixture = Fixture::new();
    let nested = fixture.dir.path().join("a").join("b");

    let queue = FileQueue::open(&nested, fixture.clock.clone()).unwrap();
    assert!(queue.path().exists());
    assert_eq!(queue.path(), nested.join("QUEUE"));
}

#[test]
fn test_push_appends_record_without_touching_view() {
    let fixture = Fixture::new();
    let queue = fixture.queue("a");

    let message = queue.push(&q1(), "A".to_string(), None).unwrap();
    assert_eq!(message.handle, "a-1");

    assert_eq!(fixture.log_lines(), vec!["PUSH#$0#$Q1#$a-1#$A#$0"]);
    assert_eq!(queue.cursor(), Cursor::default());
}

#[test]
fn test_pull_replays_then_records_lease() {
    let fixture = Fixture::new();
    let queue = fixture.queue("a");

    queue.push(&q1(), "A".to_string(), None).unwrap();
    let pulled = queue.pull(&q1(), secs(60)).unwrap().unwrap();

    assert_eq!(pulled.content, "A");
    assert_eq!(pulled.visibility_timestamp, 60_000);
    assert_eq!(
        fixture.log_lines(),
        vec!["PUSH#$0#$Q1#$a-1#$A#$0", "PULL#$0#$Q1#$a-1#$A#$60000"]
    );

    let cursor = queue.cursor();
    assert_eq!(cursor.records, 2);
    assert_eq!(
        cursor.offset,
        std::fs::metadata(fixture.log_path()).unwrap().len()
    );
}

#[test]
fn test_pull_unknown_queue_is_not_found() {
    let fixture = Fixture::new();
    let queue = fixture.queue("a");

    assert!(matches!(
        queue.pull(&q1(), secs(30)),
        Err(QueueError::QueueNotFound { .. })
    ));
}

#[test]
fn test_delete_within_lease_prevents_redelivery() {
    let fixture = Fixture::new();
    let queue = fixture.queue("a");

    queue.push(&q1(), "A".to_string(), None).unwrap();
    let message = queue.pull(&q1(), secs(60)).unwrap().unwrap();

    fixture.clock.set_now_ms(1_000).unwrap();
    assert_eq!(queue.delete(&message).unwrap(), DeleteOutcome::Recorded);

    fixture.clock.set_now_ms(70_000).unwrap();
    assert!(queue.pull(&q1(), secs(60)).unwrap().is_none());
}

#[test]
fn test_delete_after_expiry_does_not_remove_message() {
    let fixture = Fixture::new();
    let queue = fixture.queue("a");

    queue.push(&q1(), "A".to_string(), None).unwrap();
    let message = queue.pull(&q1(), secs(60)).unwrap().unwrap();

    fixture.clock.set_now_ms(65_000).unwrap();
    queue.delete(&message).unwrap();

    let again = queue.pull(&q1(), secs(60)).unwrap().unwrap();
    assert_eq!(again.handle, message.handle);
    assert_eq!(again.visibility_timestamp, 125_000);
}

#[test]
fn test_stale_delete_does_not_cancel_newer_lease() {
    let fixture = Fixture::new();
    let queue = fixture.queue("a");

    queue.push(&q1(), "A".to_string(), None).unwrap();
    let first = queue.pull(&q1(), secs(30)).unwrap().unwrap();

    fixture.clock.set_now_ms(40_000).unwrap();
    let second = queue.pull(&q1(), secs(30)).unwrap().unwrap();
    assert_eq!(second.visibility_timestamp, 70_000);

    // Issued "in time" for the first lease from the record's point of view,
    // but that lease is gone
    fixture.clock.set_now_ms(20_000).unwrap();
    queue.delete(&first).unwrap();

    let snapshot = queue.snapshot(&q1()).unwrap().unwrap();
    assert_eq!(snapshot.in_flight, vec![second]);
}

#[test]
fn test_instances_share_one_log() {
    let fixture = Fixture::new();
    let producer = fixture.queue("p");
    let consumer_a = fixture.queue("a");
    let consumer_b = fixture.queue("b");

    producer.push(&q1(), "A".to_string(), None).unwrap();

    let leased = consumer_a.pull(&q1(), secs(30)).unwrap().unwrap();
    assert_eq!(leased.handle, "p-1");
    assert!(consumer_b.pull(&q1(), secs(30)).unwrap().is_none());

    fixture.clock.set_now_ms(1_000).unwrap();
    consumer_a.delete(&leased).unwrap();

    fixture.clock.set_now_ms(60_000).unwrap();
    assert!(consumer_b.pull(&q1(), secs(30)).unwrap().is_none());
    assert!(producer.pull(&q1(), secs(30)).unwrap().is_none());
}

#[test]
fn test_replay_is_idempotent_across_instances() {
    let fixture = Fixture::new();
    let writer = fixture.queue("w");

    for i in 0..5 {
        writer.push(&q1(), format!("m{}", i), None).unwrap();
    }
    let leased = writer.pull(&q1(), secs(30)).unwrap().unwrap();
    writer.pull(&q1(), secs(30)).unwrap().unwrap();
    writer.delete(&leased).unwrap();

    let first = fixture.queue("x").snapshot(&q1()).unwrap().unwrap();
    let second = fixture.queue("y").snapshot(&q1()).unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.pending.len(), 3);
    assert_eq!(first.in_flight.len(), 1);

    let reader = fixture.queue("z");
    assert_eq!(reader.replay().unwrap().applied, 8);
    assert_eq!(reader.replay().unwrap().applied, 0);
}

#[test]
fn test_invalid_content_is_rejected_before_append() {
    let fixture = Fixture::new();
    let queue = fixture.queue("a");

    let result = queue.push(&q1(), "bad#$content".to_string(), None);
    assert!(matches!(result, Err(QueueError::InvalidRequest(_))));
    assert!(fixture.log_lines().is_empty());
}

mod torn_tail {
    use super::*;

    #[test]
    fn test_unterminated_tail_is_skipped() {
        let fixture = Fixture::new();
        let queue = fixture.queue("a");

        queue.push(&q1(), "A".to_string(), None).unwrap();
        fixture.append_raw(b"PUSH#$0#$Q1#$half");

        let report = queue.replay().unwrap();
        assert_eq!(report.applied, 1);
        assert!(report.torn_tail);
        assert_eq!(queue.snapshot(&q1()).unwrap().unwrap().pending.len(), 1);
    }

    #[test]
    fn test_next_append_truncates_tail() {
        let fixture = Fixture::new();
        let queue = fixture.queue("a");

        queue.push(&q1(), "A".to_string(), None).unwrap();
        fixture.append_raw(b"PUSH#$0#$Q1#$half");
        queue.push(&q1(), "B".to_string(), None).unwrap();

        assert_eq!(
            fixture.log_lines(),
            vec!["PUSH#$0#$Q1#$a-1#$A#$0", "PUSH#$0#$Q1#$a-2#$B#$0"]
        );

        let report = queue.replay().unwrap();
        assert_eq!(report.applied, 2);
        assert!(!report.torn_tail);
    }

    #[test]
    fn test_pull_after_torn_tail_keeps_cursor_in_sync() {
        let fixture = Fixture::new();
        let queue = fixture.queue("a");

        queue.push(&q1(), "A".to_string(), None).unwrap();
        fixture.append_raw(b"PULL#$0#$Q1");

        queue.pull(&q1(), secs(30)).unwrap().unwrap();
        let len = std::fs::metadata(fixture.log_path()).unwrap().len();
        assert_eq!(queue.cursor().offset, len);
        assert_eq!(queue.cursor().records, 2);
    }
}

#[test]
fn test_corrupt_line_fails_with_line_number() {
    let fixture = Fixture::new();
    let queue = fixture.queue("a");

    queue.push(&q1(), "A".to_string(), None).unwrap();
    fixture.append_raw(b"GARBAGE\n");
    queue.push(&q1(), "B".to_string(), None).unwrap();

    match queue.replay() {
        Err(QueueError::CorruptRecord { line, .. }) => assert_eq!(line, 2),
        other => panic!("expected CorruptRecord, got {:?}", other),
    }
    assert_eq!(queue.cursor().records, 1);
}

#[test]
fn test_unrecorded_pull_releases_lease() {
    let fixture = Fixture::new();
    let queue = fixture.queue("a");

    // Decodes fine but cannot be encoded again as a PULL record
    fixture.append_raw(b"PUSH#$0#$Q1#$cr#$line\rbreak#$0\n");
    fixture.clock.set_now_ms(1_000).unwrap();

    assert!(matches!(
        queue.pull(&q1(), secs(30)),
        Err(QueueError::InvalidRequest(_))
    ));
    assert_eq!(fixture.log_lines().len(), 1);

    let snapshot = queue.snapshot(&q1()).unwrap().unwrap();
    assert!(snapshot.in_flight.is_empty());
    assert_eq!(snapshot.pending.len(), 1);
    assert_eq!(snapshot.pending[0].handle, "cr");
    assert_eq!(snapshot.pending[0].visibility_timestamp, 0);
}

#[test]
fn test_from_config_opens_configured_log_path() {
    let fixture = Fixture::new();
    let config = FileConfig {
        base_path: fixture.dir.path().join("nested"),
        file_name: "JOBS".to_string(),
    };

    let queue = FileQueue::from_config(&config, fixture.clock.clone()).unwrap();
    assert_eq!(queue.path(), config.log_path().as_path());
    assert!(config.log_path().exists());

    let invalid = FileConfig {
        file_name: String::new(),
        ..config
    };
    assert!(matches!(
        FileQueue::from_config(&invalid, fixture.clock.clone()),
        Err(QueueError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_provider_trait_round_trip() {
    let fixture = Fixture::new();
    let queue = fixture.queue("a");

    let pushed = queue
        .send_message(&PushRequest::new("Q1", "hello").with_handle("mine"))
        .await
        .unwrap();
    assert_eq!(pushed.handle, "mine");

    let pulled = queue
        .receive_message(&PullRequest::new("Q1").with_visibility_timeout(45))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pulled.visibility_timestamp, 45_000);

    let outcome = queue
        .delete_message(&DeleteRequest::new(pulled))
        .await
        .unwrap();
    assert_eq!(outcome, DeleteOutcome::Recorded);
    assert_eq!(queue.provider_type(), ProviderType::File);
}
