#![cfg(feature = "test-utils")]

use cdc::error::ErrorKind;
use cdc::pipeline::{Pipeline, SHUTDOWN_TIMEOUT};
use cdc::sink::memory::MemorySink;
use cdc::test_utils::envelope::{envelope, insert_record, row};
use cdc::test_utils::event::{EventLog, TestEvent};
use cdc::test_utils::sink::{HangingSink, PanickingSink, RecordingSink};
use cdc::test_utils::stream::{OpenStep, PollStep, ScriptedOpener};
use cdc::types::{PgLsn, PollResult};
use config::shared::ReplicationConfig;
use std::sync::Arc;
use std::time::Duration;
use telemetry::init_test_tracing;
use tokio::time::Instant;

fn orders_config() -> Arc<ReplicationConfig> {
    Arc::new(ReplicationConfig::new("orders_slot", "public", "orders"))
}

fn orders_envelope_step(cursor: u64) -> OpenStep {
    OpenStep::Stream(vec![PollStep::changes(
        envelope(1, &[insert_record("orders", 1, "a")]),
        cursor,
    )])
}

fn polled_changes(events: &[TestEvent]) -> bool {
    events.iter().any(|event| {
        matches!(
            event,
            TestEvent::Polled {
                result: Some(PollResult::Changes { .. }),
                ..
            }
        )
    })
}

#[tokio::test(start_paused = true)]
async fn pipeline_publishes_acknowledges_and_shuts_down() {
    init_test_tracing();

    let log = EventLog::new();
    let opener = ScriptedOpener::new(vec![orders_envelope_step(10)], log.clone());
    let mut pipeline = Pipeline::new(opener, RecordingSink::new(log.clone()), orders_config());

    pipeline.start();
    log.wait_until(|events| events.contains(&TestEvent::Acknowledged(PgLsn::from(10))))
        .await;

    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(
        log.events_without_polls(),
        vec![
            TestEvent::Opened,
            TestEvent::Published(row(1, "a")),
            TestEvent::Acknowledged(PgLsn::from(10)),
            TestEvent::Closed,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn memory_sink_keeps_rows_across_reconnects() {
    init_test_tracing();

    let log = EventLog::new();
    let opener = ScriptedOpener::new(
        vec![
            OpenStep::Stream(vec![
                PollStep::changes(envelope(1, &[insert_record("orders", 1, "a")]), 10),
                PollStep::Fail(ErrorKind::SourceConnectionFailed),
            ]),
            OpenStep::Fail(ErrorKind::ReplicationSlotBusy),
            OpenStep::Stream(vec![PollStep::changes(
                envelope(2, &[insert_record("orders", 2, "b")]),
                20,
            )]),
        ],
        log.clone(),
    );
    let sink = MemorySink::new();
    let mut pipeline = Pipeline::new(opener, sink.clone(), orders_config());

    pipeline.start();
    log.wait_until(|events| events.contains(&TestEvent::Acknowledged(PgLsn::from(20))))
        .await;

    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(sink.rows().await, vec![row(1, "a"), row(2, "b")]);
    assert_eq!(log.acknowledged(), vec![PgLsn::from(10), PgLsn::from(20)]);
}

#[tokio::test(start_paused = true)]
async fn external_shutdown_stops_waiting_pipeline() {
    init_test_tracing();

    let log = EventLog::new();
    let opener = ScriptedOpener::new(vec![], log.clone());
    let mut pipeline = Pipeline::new(opener, RecordingSink::new(log.clone()), orders_config());
    let shutdown_tx = pipeline.shutdown_tx();

    pipeline.start();
    log.wait_until(|events| events.contains(&TestEvent::Opened))
        .await;

    shutdown_tx.shutdown().unwrap();
    pipeline.wait().await.unwrap();

    assert_eq!(log.events_without_polls().last(), Some(&TestEvent::Closed));
}

#[tokio::test(start_paused = true)]
async fn hanging_sink_is_aborted_after_shutdown_timeout() {
    init_test_tracing();

    let log = EventLog::new();
    let opener = ScriptedOpener::new(vec![orders_envelope_step(10)], log.clone());
    let mut pipeline = Pipeline::new(opener, HangingSink, orders_config());

    pipeline.start();
    log.wait_until(polled_changes).await;

    let requested = Instant::now();
    let err = pipeline.shutdown_and_wait().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ShutdownTimeout);
    assert!(requested.elapsed() >= SHUTDOWN_TIMEOUT);
    assert!(log.acknowledged().is_empty());
    assert_eq!(log.count(|event| *event == TestEvent::Closed), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_timeout_can_be_overridden() {
    init_test_tracing();

    let log = EventLog::new();
    let opener = ScriptedOpener::new(vec![orders_envelope_step(10)], log.clone());
    let timeout = Duration::from_secs(1);
    let mut pipeline =
        Pipeline::new(opener, HangingSink, orders_config()).with_shutdown_timeout(timeout);

    pipeline.start();
    log.wait_until(polled_changes).await;

    let requested = Instant::now();
    let err = pipeline.shutdown_and_wait().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ShutdownTimeout);
    assert!(requested.elapsed() >= timeout);
    assert!(requested.elapsed() < SHUTDOWN_TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn pipeline_that_was_not_started_finishes_immediately() {
    init_test_tracing();

    let log = EventLog::new();
    let opener = ScriptedOpener::new(vec![], log.clone());
    let pipeline = Pipeline::new(opener, RecordingSink::new(log.clone()), orders_config());

    pipeline.wait().await.unwrap();

    assert!(log.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn starting_twice_runs_a_single_consumer() {
    init_test_tracing();

    let log = EventLog::new();
    let opener = ScriptedOpener::new(vec![], log.clone());
    let mut pipeline = Pipeline::new(opener, RecordingSink::new(log.clone()), orders_config());

    pipeline.start();
    pipeline.start();
    log.wait_until(|events| events.contains(&TestEvent::Opened))
        .await;

    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(log.count(|event| *event == TestEvent::Opened), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_before_start_stops_worker() {
    init_test_tracing();

    let log = EventLog::new();
    let opener = ScriptedOpener::new(vec![orders_envelope_step(10)], log.clone());
    let mut pipeline = Pipeline::new(opener, RecordingSink::new(log.clone()), orders_config());

    pipeline.shutdown_tx().shutdown().unwrap();
    pipeline.start();
    pipeline.wait().await.unwrap();

    assert_eq!(log.count(|event| *event == TestEvent::Opened), 0);
    assert!(log.acknowledged().is_empty());
}

#[tokio::test(start_paused = true)]
async fn worker_panic_is_reported_without_shutdown() {
    init_test_tracing();

    let log = EventLog::new();
    let opener = ScriptedOpener::new(vec![orders_envelope_step(10)], log.clone());
    let mut pipeline = Pipeline::new(opener, PanickingSink, orders_config());

    pipeline.start();
    let err = pipeline.wait_with_shutdown_timeout().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConsumerWorkerPanic);
    assert!(log.acknowledged().is_empty());
}

#[tokio::test(start_paused = true)]
async fn external_shutdown_is_bounded_by_shutdown_timeout() {
    init_test_tracing();

    let log = EventLog::new();
    let opener = ScriptedOpener::new(vec![orders_envelope_step(10)], log.clone());
    let mut pipeline = Pipeline::new(opener, HangingSink, orders_config());
    let shutdown_tx = pipeline.shutdown_tx();

    pipeline.start();
    log.wait_until(polled_changes).await;

    let requested = Instant::now();
    shutdown_tx.shutdown().unwrap();
    let err = pipeline.wait_with_shutdown_timeout().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ShutdownTimeout);
    assert!(requested.elapsed() >= SHUTDOWN_TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn external_shutdown_completes_gracefully() {
    init_test_tracing();

    let log = EventLog::new();
    let opener = ScriptedOpener::new(vec![orders_envelope_step(10)], log.clone());
    let mut pipeline = Pipeline::new(opener, RecordingSink::new(log.clone()), orders_config());
    let shutdown_tx = pipeline.shutdown_tx();

    pipeline.start();
    log.wait_until(|events| events.contains(&TestEvent::Acknowledged(PgLsn::from(10))))
        .await;

    shutdown_tx.shutdown().unwrap();
    pipeline.wait_with_shutdown_timeout().await.unwrap();

    assert_eq!(log.events_without_polls().last(), Some(&TestEvent::Closed));
}
