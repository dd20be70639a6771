//! End-to-end pipeline tests over the in-memory stores.
//!
//! Mutations go through the applier, the detector drains the change stream
//! and alerts reach a recording channel through the real dispatcher.

mod common;

use std::sync::Arc;
use std::time::Duration;

use stateset_inventory::detector::RecordOutcome;
use stateset_inventory::dispatch::DispatchOutcome;
use stateset_inventory::infra::{
    CursorStore, FailedAlertStore, FailureReason, InMemoryCursorStore, InventoryStore,
    ShutdownCoordinator, ShutdownSignal,
};
use stateset_inventory::stream::ChangeStream;
use stateset_inventory::{ItemId, Mutation, StoreId};

use common::*;

// ============================================================================
// Ingestion
// ============================================================================

#[tokio::test]
async fn test_batch_applies_valid_rows_and_reports_invalid() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::accepting());

    let report = pipeline
        .state
        .applier
        .apply_batch(vec![
            raw("Berlin", "Widget-001", "100"),
            raw("Berlin", "Widget-009", "notanumber"),
            raw("Berlin", "Widget-002", "50"),
        ])
        .await;

    assert_eq!(report.total, 3);
    assert_eq!(report.applied, 2);
    assert_eq!(report.skipped(), 1);
    assert_eq!(report.skipped_rows[0].row, 2);

    let items = pipeline.state.query.get_all_items().await.unwrap();
    assert_eq!(items.count, 2);
    assert_eq!(pipeline.store.head().await.unwrap(), 2);
}

#[tokio::test]
async fn test_same_key_rows_apply_in_submission_order() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::accepting());

    let rows: Vec<_> = (1..=20)
        .map(|i| raw("Berlin", "Widget-001", &i.to_string()))
        .collect();
    let report = pipeline.state.applier.apply_batch(rows).await;
    assert!(report.is_clean());

    let record = pipeline
        .store
        .get(&StoreId("Berlin".into()), &ItemId("Widget-001".into()))
        .await
        .unwrap();
    assert_eq!(record.quantity, 20);
    assert_eq!(record.version, 20);

    let changes = pipeline.store.read_changes(0, 100).await.unwrap();
    let quantities: Vec<u64> = changes.iter().map(|c| c.new_quantity).collect();
    assert_eq!(quantities, (1..=20).collect::<Vec<u64>>());
}

// ============================================================================
// Detection and dispatch
// ============================================================================

#[tokio::test]
async fn test_alert_only_on_downward_crossing() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::accepting());
    let applier = &pipeline.state.applier;
    let detector = &pipeline.state.detector;
    let never = ShutdownSignal::never();

    applier.apply_raw(&raw("Berlin", "Widget-001", "100")).await.unwrap();
    detector.drain(&never).await.unwrap();
    assert!(pipeline.channel.delivered().is_empty());

    // 100 -> 40 crosses
    applier.apply_raw(&raw("Berlin", "Widget-001", "40")).await.unwrap();
    // 40 -> 30 stays below
    applier.apply_raw(&raw("Berlin", "Widget-001", "30")).await.unwrap();
    // 30 -> 60 goes back up
    applier.apply_raw(&raw("Berlin", "Widget-001", "60")).await.unwrap();
    // 60 -> 10 crosses again
    applier.apply_raw(&raw("Berlin", "Widget-001", "10")).await.unwrap();

    assert_eq!(detector.drain(&never).await.unwrap(), 4);

    let delivered = pipeline.channel.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].quantity, 40);
    assert_eq!(delivered[1].quantity, 10);
    assert_eq!(delivered[0].subject(), "[ALERT] Low stock: Widget-001 at Berlin");
    assert_ne!(delivered[0].dedup_key, delivered[1].dedup_key);

    let stats = detector.stats().await;
    assert_eq!(stats.records_evaluated, 5);
    assert_eq!(stats.alerts_delivered, 2);
    assert_eq!(detector.cursor(), 5);
}

#[tokio::test]
async fn test_first_observation_below_threshold_alerts() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::accepting());

    pipeline
        .state
        .applier
        .apply_raw(&raw("Munich", "Gadget-7", "3"))
        .await
        .unwrap();
    pipeline.state.detector.drain(&ShutdownSignal::never()).await.unwrap();

    let delivered = pipeline.channel.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].store, "Munich");
    assert_eq!(delivered[0].threshold, 50);
}

#[tokio::test]
async fn test_exactly_at_threshold_does_not_alert() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::accepting());

    pipeline
        .state
        .applier
        .apply_raw(&raw("Berlin", "Widget-002", "50"))
        .await
        .unwrap();
    pipeline.state.detector.drain(&ShutdownSignal::never()).await.unwrap();

    assert!(pipeline.channel.delivered().is_empty());
}

#[tokio::test]
async fn test_replay_from_zero_is_suppressed_by_dedup() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::accepting());
    let never = ShutdownSignal::never();

    pipeline.state.applier.apply_raw(&raw("Berlin", "Widget-001", "100")).await.unwrap();
    pipeline.state.applier.apply_raw(&raw("Berlin", "Widget-001", "40")).await.unwrap();
    pipeline.state.detector.drain(&never).await.unwrap();
    assert_eq!(pipeline.channel.delivered().len(), 1);

    // A second consumer that lost its cursor replays everything
    let replaying = pipeline.detector_with_cursors(Arc::new(InMemoryCursorStore::new()));
    assert_eq!(replaying.drain(&never).await.unwrap(), 2);

    assert_eq!(pipeline.channel.delivered().len(), 1);
    assert_eq!(replaying.stats().await.alerts_suppressed, 1);
}

#[tokio::test]
async fn test_restarted_detector_resumes_from_persisted_cursor() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::accepting());
    let never = ShutdownSignal::never();

    pipeline.state.applier.apply_raw(&raw("Berlin", "Widget-001", "100")).await.unwrap();
    pipeline.state.detector.drain(&never).await.unwrap();

    let saved = pipeline.cursors.load("low-stock-detector").await.unwrap().unwrap();
    assert_eq!(saved.last_acknowledged_sequence, 1);

    pipeline.state.applier.apply_raw(&raw("Berlin", "Widget-001", "20")).await.unwrap();

    let restarted = pipeline.detector_with_cursors(pipeline.cursors.clone());
    assert_eq!(restarted.drain(&never).await.unwrap(), 1);
    assert_eq!(restarted.cursor(), 2);
    assert_eq!(restarted.stats().await.records_evaluated, 1);
    assert_eq!(pipeline.channel.delivered().len(), 1);
}

#[tokio::test]
async fn test_transient_channel_failures_are_retried() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::new(ChannelBehavior::FailTimes(2)));

    pipeline.state.applier.apply_raw(&raw("Berlin", "Widget-001", "5")).await.unwrap();
    pipeline.state.detector.drain(&ShutdownSignal::never()).await.unwrap();

    assert_eq!(pipeline.channel.calls(), 3);
    assert_eq!(pipeline.channel.delivered().len(), 1);
    assert_eq!(pipeline.failed_alerts.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_exhausted_retries_are_recorded_and_cursor_advances() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::new(ChannelBehavior::AlwaysRetryable));

    pipeline.state.applier.apply_raw(&raw("Berlin", "Widget-001", "5")).await.unwrap();
    pipeline.state.applier.apply_raw(&raw("Berlin", "Widget-002", "500")).await.unwrap();
    pipeline.state.detector.drain(&ShutdownSignal::never()).await.unwrap();

    // max attempts from test_config
    assert_eq!(pipeline.channel.calls(), 3);
    assert_eq!(pipeline.state.detector.cursor(), 2);

    let failed = pipeline.failed_alerts.list(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].reason, FailureReason::RetriesExhausted);
    assert_eq!(failed[0].item, "Widget-001");
    assert_eq!(failed[0].attempts, 3);
}

#[tokio::test]
async fn test_fatal_channel_error_is_recorded_once() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::new(ChannelBehavior::AlwaysFatal));

    pipeline.state.applier.apply_raw(&raw("Berlin", "Widget-001", "5")).await.unwrap();

    let record = pipeline.store.read_changes(0, 1).await.unwrap().remove(0);
    let outcome = pipeline.state.detector.process_record(&record).await.unwrap();
    assert!(matches!(
        outcome,
        RecordOutcome::Alerted(DispatchOutcome::Fatal { .. })
    ));
    assert_eq!(pipeline.channel.calls(), 1);

    // Fatal marks the key, so a replay does not hit the channel again
    let outcome = pipeline.state.detector.process_record(&record).await.unwrap();
    assert_eq!(outcome, RecordOutcome::Alerted(DispatchOutcome::Suppressed));
    assert_eq!(pipeline.channel.calls(), 1);

    let failed = pipeline.failed_alerts.list(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].reason, FailureReason::Fatal);
}

#[tokio::test]
async fn test_keys_are_evaluated_independently() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::accepting());

    pipeline
        .state
        .applier
        .apply_batch(vec![
            raw("Berlin", "Widget-001", "100"),
            raw("Paris", "Widget-001", "100"),
        ])
        .await;
    pipeline
        .state
        .applier
        .apply_batch(vec![
            raw("Berlin", "Widget-001", "10"),
            raw("Paris", "Widget-001", "60"),
        ])
        .await;
    pipeline.state.detector.drain(&ShutdownSignal::never()).await.unwrap();

    let delivered = pipeline.channel.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].store, "Berlin");
}

// ============================================================================
// Change stream
// ============================================================================

#[tokio::test]
async fn test_stream_replay_is_identical() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::accepting());
    for i in 0..10u64 {
        pipeline
            .store
            .upsert(&Mutation::new("Berlin", format!("Widget-{i:03}"), i * 10))
            .await
            .unwrap();
    }

    let stream = ChangeStream::new(pipeline.store.clone());
    let first = stream.read_batch(3, 100).await.unwrap();
    let second = stream.read_batch(3, 100).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 7);
    assert_eq!(first[0].sequence, 4);
    assert!(first.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
}

// ============================================================================
// Background loop
// ============================================================================

#[tokio::test]
async fn test_running_detector_picks_up_new_mutations_and_stops_on_shutdown() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::accepting());
    let coordinator = ShutdownCoordinator::new();

    let detector = pipeline.state.detector.clone();
    let signal = coordinator.signal();
    let handle = tokio::spawn(async move { detector.run(signal).await });

    pipeline.state.applier.apply_raw(&raw("Berlin", "Widget-001", "100")).await.unwrap();
    pipeline.state.applier.apply_raw(&raw("Berlin", "Widget-001", "12")).await.unwrap();

    let channel = pipeline.channel.clone();
    assert!(eventually(Duration::from_secs(5), || channel.delivered().len() == 1).await);

    coordinator.shutdown().await;
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("detector did not stop")
        .unwrap();
    assert!(result.is_ok());

    let cursor = pipeline.cursors.load("low-stock-detector").await.unwrap().unwrap();
    assert_eq!(cursor.last_acknowledged_sequence, 2);
}

#[tokio::test]
async fn test_second_loop_on_same_detector_is_rejected() {
    let pipeline = InMemoryPipeline::new(RecordingChannel::accepting());
    let coordinator = ShutdownCoordinator::new();

    let detector = pipeline.state.detector.clone();
    let signal = coordinator.signal();
    let handle = tokio::spawn(async move { detector.run(signal).await });

    // Let the loop take its guard
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pipeline
        .state
        .detector
        .drain(&ShutdownSignal::never())
        .await
        .is_err());

    coordinator.shutdown().await;
    handle.await.unwrap().unwrap();
}
