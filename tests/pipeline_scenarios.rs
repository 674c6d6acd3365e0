//! End-to-end runs of both consumer loops over the in-memory broker and
//! store, with tokio time paused so backoff is observed exactly.

use item_auditor::broker::memory::PublishedMessage;
use item_auditor::broker::MemoryTopic;
use item_auditor::coordination::{GracefulShutdown, ShutdownSignal};
use item_auditor::pipeline::{PrimaryConsumer, RetryPolicy, RetryWorker};
use item_auditor::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const CREATED: &[u8] = br#"{"type":"item.created","item":{"id":1,"name":"X"}}"#;
const MALFORMED: &[u8] = b"{oops}";

/// Longer than the whole default retry schedule (2 + 4 + 8 + 16 seconds)
const SETTLE: Duration = Duration::from_secs(120);

struct Pipeline {
    main: Arc<MemoryTopic>,
    dlq: Arc<MemoryTopic>,
    store: Arc<MemoryStore>,
    shutdown: Arc<GracefulShutdown>,
    primary: Arc<PrimaryConsumer>,
    retry: Arc<RetryWorker>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    fn start(store: Arc<MemoryStore>) -> Self {
        let main = Arc::new(MemoryTopic::new("item"));
        let dlq = Arc::new(MemoryTopic::new("item-dlq"));
        let shutdown = Arc::new(GracefulShutdown::new());

        let primary = Arc::new(PrimaryConsumer::new(
            main.clone(),
            store.clone(),
            dlq.clone(),
            store.clone(),
        ));
        let retry = Arc::new(RetryWorker::new(
            dlq.clone(),
            store.clone(),
            dlq.clone(),
            store.clone(),
            RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_secs(2),
            },
        ));

        let tasks = vec![
            {
                let primary = primary.clone();
                let token = shutdown.token();
                tokio::spawn(async move { primary.run(token).await })
            },
            {
                let retry = retry.clone();
                let token = shutdown.token();
                tokio::spawn(async move { retry.run(token).await })
            },
        ];

        Self {
            main,
            dlq,
            store,
            shutdown,
            primary,
            retry,
            tasks,
        }
    }

    async fn stop(self) -> Self {
        self.shutdown.request_shutdown(ShutdownSignal::Requested);
        let mut this = self;
        for task in this.tasks.drain(..) {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("loop should stop on cancellation")
                .expect("loop should not panic");
        }
        this
    }
}

fn headers(published: &[PublishedMessage]) -> Vec<u32> {
    published.iter().map(|p| p.envelope.attempts()).collect()
}

fn intervals(published: &[PublishedMessage]) -> Vec<Duration> {
    published
        .windows(2)
        .map(|pair| pair[1].at.duration_since(pair[0].at))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn healthy_store_writes_one_audit_record() {
    let pipeline = Pipeline::start(Arc::new(MemoryStore::new()));
    pipeline.main.push(CREATED).unwrap();

    tokio::time::sleep(SETTLE).await;
    let pipeline = pipeline.stop().await;

    let records = pipeline.store.audit_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].evt_type, "item.created");
    assert_eq!(records[0].payload, CREATED);

    assert!(pipeline.dlq.published().await.is_empty());
    assert!(pipeline.store.parked_records().await.is_empty());
    assert_eq!(pipeline.main.acked().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_store_outage_recovers_after_one_backoff() {
    let store = Arc::new(MemoryStore::new());
    // Primary insert and first retry fail
    store.fail_next_inserts(2).await;
    let pipeline = Pipeline::start(store);
    pipeline.main.push(CREATED).unwrap();

    tokio::time::sleep(SETTLE).await;
    let pipeline = pipeline.stop().await;

    let published = pipeline.dlq.published().await;
    assert_eq!(headers(&published), vec![0, 1]);
    assert_eq!(intervals(&published), vec![Duration::from_secs(2)]);

    assert_eq!(pipeline.store.insert_calls(), 3);
    assert_eq!(pipeline.store.audit_records().await.len(), 1);
    assert!(pipeline.store.parked_records().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn longer_store_outage_backs_off_exponentially_then_succeeds() {
    let store = Arc::new(MemoryStore::new());
    store.fail_next_inserts(3).await;
    let pipeline = Pipeline::start(store);
    pipeline.main.push(CREATED).unwrap();

    tokio::time::sleep(SETTLE).await;
    let pipeline = pipeline.stop().await;

    let published = pipeline.dlq.published().await;
    assert_eq!(headers(&published), vec![0, 1, 2]);
    assert_eq!(
        intervals(&published),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );

    let records = pipeline.store.audit_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, CREATED);
    assert!(pipeline.store.parked_records().await.is_empty());
    assert_eq!(pipeline.retry.metrics().snapshot().persisted, 1);
}

#[tokio::test(start_paused = true)]
async fn permanent_store_outage_parks_after_final_attempt() {
    let store = Arc::new(MemoryStore::new());
    store.fail_all_inserts().await;
    let pipeline = Pipeline::start(store);
    pipeline.main.push(CREATED).unwrap();

    tokio::time::sleep(SETTLE).await;
    let pipeline = pipeline.stop().await;

    // One dead-letter entry, then republishes with 1..=4
    let published = pipeline.dlq.published().await;
    assert_eq!(headers(&published), vec![0, 1, 2, 3, 4]);
    assert!(published[0].envelope.headers.is_empty());
    assert_eq!(
        intervals(&published),
        vec![
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
            Duration::from_secs(16),
        ]
    );

    let parked = pipeline.store.parked_records().await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].attempts, 5);
    assert_eq!(parked[0].payload.as_deref(), Some(CREATED));

    // Every copy carried the original bytes
    assert!(published
        .iter()
        .all(|p| p.envelope.payload.as_deref() == Some(CREATED)));
    assert!(pipeline.store.audit_records().await.is_empty());
    // One primary attempt plus five retries
    assert_eq!(pipeline.store.insert_calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn nothing_is_republished_after_parking() {
    let store = Arc::new(MemoryStore::new());
    store.fail_all_inserts().await;
    let pipeline = Pipeline::start(store);
    pipeline.main.push(CREATED).unwrap();

    tokio::time::sleep(SETTLE).await;
    let published_at_park = pipeline.dlq.published().await.len();
    assert_eq!(pipeline.store.parked_records().await.len(), 1);

    tokio::time::sleep(SETTLE).await;
    let pipeline = pipeline.stop().await;

    assert_eq!(pipeline.dlq.published().await.len(), published_at_park);
    assert_eq!(pipeline.store.parked_records().await.len(), 1);
    assert_eq!(pipeline.dlq.acked().await.len(), published_at_park);
}

#[tokio::test(start_paused = true)]
async fn malformed_event_is_retried_then_parked_byte_for_byte() {
    let pipeline = Pipeline::start(Arc::new(MemoryStore::new()));
    pipeline.main.push(MALFORMED).unwrap();

    tokio::time::sleep(SETTLE).await;
    let pipeline = pipeline.stop().await;

    let published = pipeline.dlq.published().await;
    assert_eq!(headers(&published), vec![0, 1, 2, 3, 4]);
    assert!(published
        .iter()
        .all(|p| p.envelope.payload.as_deref() == Some(MALFORMED)));

    let parked = pipeline.store.parked_records().await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].payload.as_deref(), Some(MALFORMED));
    assert_eq!(parked[0].attempts, 5);

    // Parse failures never reach the datastore
    assert_eq!(pipeline.store.insert_calls(), 0);
    assert_eq!(pipeline.primary.metrics().snapshot().dead_lettered, 1);
}

#[tokio::test(start_paused = true)]
async fn every_event_ends_audited_or_parked() {
    let store = Arc::new(MemoryStore::new());
    store.fail_next_inserts(4).await;
    let pipeline = Pipeline::start(store);

    let events: Vec<Vec<u8>> = (1..=4)
        .map(|id| format!(r#"{{"type":"item.updated","id":{id}}}"#).into_bytes())
        .chain(std::iter::once(MALFORMED.to_vec()))
        .collect();
    for event in &events {
        pipeline.main.push(event.clone()).unwrap();
    }

    tokio::time::sleep(SETTLE * 4).await;
    let pipeline = pipeline.stop().await;

    let audited = pipeline.store.audit_records().await;
    let parked = pipeline.store.parked_records().await;
    for event in &events {
        assert!(
            audited.iter().any(|r| &r.payload == event)
                || parked.iter().any(|r| r.payload.as_ref() == Some(event)),
            "event lost: {}",
            String::from_utf8_lossy(event)
        );
    }
    assert_eq!(pipeline.main.acked().await.len(), events.len());
}

#[tokio::test(start_paused = true)]
async fn idle_loops_stop_on_cancellation() {
    let pipeline = Pipeline::start(Arc::new(MemoryStore::new()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(pipeline.primary.metrics().is_running());
    assert!(pipeline.retry.metrics().is_running());

    let pipeline = pipeline.stop().await;

    assert!(!pipeline.primary.metrics().is_running());
    assert!(!pipeline.retry.metrics().is_running());
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_leaves_message_unacknowledged() {
    let store = Arc::new(MemoryStore::new());
    store.fail_all_inserts().await;
    let pipeline = Pipeline::start(store);
    pipeline.main.push(CREATED).unwrap();

    // Inside the first 2s backoff
    tokio::time::sleep(Duration::from_secs(1)).await;
    let pipeline = pipeline.stop().await;

    // Only the primary's dead-letter entry exists; no retry publish, no park
    assert_eq!(headers(&pipeline.dlq.published().await), vec![0]);
    assert!(pipeline.store.parked_records().await.is_empty());
    assert!(pipeline.dlq.acked().await.is_empty());
    assert_eq!(pipeline.main.acked().await.len(), 1);
    assert_eq!(pipeline.retry.metrics().snapshot().unresolved, 1);
}

#[tokio::test(start_paused = true)]
async fn stranded_event_holds_back_later_offsets() {
    let store = Arc::new(MemoryStore::new());
    store.fail_all_inserts().await;
    store.set_parking_down(true);
    let pipeline = Pipeline::start(store);
    pipeline.dlq.set_publish_down(true);

    let first = br#"{"type":"item.created","id":1}"#;
    let second = br#"{"type":"item.created","id":2}"#;
    pipeline.main.push(&first[..]).unwrap();
    pipeline.main.push(&second[..]).unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(pipeline.main.acked().await.is_empty());
    assert!(pipeline.store.parked_records().await.is_empty());
    // Only the first event has been tried, repeatedly
    assert!(pipeline.store.insert_calls() > 1);

    pipeline.store.set_parking_down(false);
    tokio::time::sleep(Duration::from_secs(10)).await;
    let pipeline = pipeline.stop().await;

    let offsets: Vec<i64> = pipeline
        .main
        .acked()
        .await
        .iter()
        .map(|p| p.offset)
        .collect();
    assert_eq!(offsets, vec![0, 1]);

    let parked = pipeline.store.parked_records().await;
    assert_eq!(parked.len(), 2);
    assert_eq!(parked[0].payload.as_deref(), Some(&first[..]));
    assert_eq!(parked[1].payload.as_deref(), Some(&second[..]));
    assert_eq!(parked[0].attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_while_stranded_leaves_offset_unstored() {
    let store = Arc::new(MemoryStore::new());
    store.fail_all_inserts().await;
    store.set_parking_down(true);
    let pipeline = Pipeline::start(store);
    pipeline.dlq.set_publish_down(true);
    pipeline.main.push(CREATED).unwrap();
    pipeline.main.push(CREATED).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    let pipeline = pipeline.stop().await;

    assert!(pipeline.main.acked().await.is_empty());
    assert_eq!(pipeline.primary.metrics().snapshot().unresolved, 1);
    assert_eq!(pipeline.primary.metrics().snapshot().received, 1);
}

#[tokio::test(start_paused = true)]
async fn tombstone_is_parked_as_null() {
    let pipeline = Pipeline::start(Arc::new(MemoryStore::new()));
    pipeline
        .main
        .produce(Some(b"item-9".to_vec()), None, Vec::new())
        .unwrap();

    tokio::time::sleep(SETTLE).await;
    let pipeline = pipeline.stop().await;

    let published = pipeline.dlq.published().await;
    assert_eq!(headers(&published), vec![0, 1, 2, 3, 4]);
    assert!(published.iter().all(|p| p.envelope.payload.is_none()));

    let parked = pipeline.store.parked_records().await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].payload, None);
    assert_eq!(parked[0].attempts, 5);
}
