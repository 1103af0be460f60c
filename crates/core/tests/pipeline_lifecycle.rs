//! Pipeline engine integration tests.
//!
//! These tests drive single engines against the in-memory mocks:
//! - Extract, transform, load and commit of one batch
//! - Batch admission limits and resource signals
//! - Checkpoint idempotence across nodes
//! - Counter groups never overtaking their documents
//! - Failure handling: runtime errors, load fallback, broken scripts

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use changefeed_core::alerts::{Alert, AlertType};
use changefeed_core::engine::NO_MORE_ITEMS;
use changefeed_core::item::{ItemType, RawDocument};
use changefeed_core::resources::SharedMemoryBudget;
use changefeed_core::state::ProcessState;
use changefeed_core::storage::{ChangeKind, StorageChange};
use changefeed_core::testing::{fixtures, Harness, MockStorage};
use changefeed_core::{EngineContext, EngineState, IterationOutcome, TestScriptInput};

const SCRIPT: &str = "load(this)";

/// Poll `condition` until it holds or `timeout` passes.
async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn ids(items: &[changefeed_core::transform::TransformedItem]) -> Vec<String> {
    items.iter().map(|i| i.id.clone()).collect()
}

#[tokio::test]
async fn test_batch_is_loaded_and_checkpointed() {
    let harness = Harness::new();
    harness.storage.put_document("orders/1", "Orders", json!({"total": 10}));
    harness.storage.put_document("orders/2", "Orders", json!({"total": 20}));
    harness.storage.put_document("customers/1", "Customers", json!({"name": "ann"}));
    harness.storage.put_document("orders/3", "Orders", json!({"total": 30}));
    harness.storage.put_document("customers/2", "Customers", json!({"name": "bob"}));

    let config = fixtures::orders_configuration("orders-etl", SCRIPT);
    let engine = harness.engine(&config);

    let outcome = engine.run_iteration().await.unwrap();
    // Customers are never enumerated, but the snapshot watermark covers them.
    assert_eq!(outcome, IterationOutcome::Progress { checkpoint: 5 });

    let destination = harness.destination("orders-etl");
    assert_eq!(
        ids(&destination.loaded_items()),
        vec!["orders/1", "orders/2", "orders/3"]
    );
    assert_eq!(harness.consensus.committed_etags(), vec![5]);

    let state = harness
        .consensus
        .state(fixtures::DATABASE, "orders-etl", "orders");
    assert_eq!(state.last_processed_etag_for(fixtures::NODE), 5);
    assert_eq!(state.node_tag.as_deref(), Some(fixtures::NODE));

    let latest = engine.performance_history().pop().unwrap();
    assert_eq!(latest.extracted.get(ItemType::Document), 3);
    assert_eq!(latest.loaded, 3);
    assert_eq!(latest.committed_etag, Some(5));
    assert_eq!(latest.batch_complete_reason.as_deref(), Some(NO_MORE_ITEMS));

    assert_eq!(engine.run_iteration().await.unwrap(), IterationOutcome::Idle);
    assert_eq!(destination.load_attempts(), 1);
    assert_eq!(engine.statistics().last_processed_etag, 5);
}

#[tokio::test]
async fn test_deletes_are_loaded_as_tombstones() {
    let harness = Harness::new();
    harness.storage.put_document("orders/1", "Orders", json!({"total": 10}));
    harness.storage.delete_document("orders/1");

    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));
    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 2 }
    );

    let loaded = harness.destination("orders-etl").loaded_items();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, "orders/1");
    assert!(loaded[0].is_delete);
    assert!(loaded[0].payload.is_none());
}

#[tokio::test]
async fn test_batch_stops_at_document_limit() {
    let settings = fixtures::settings().with_max_extracted_documents(3);
    let harness = Harness::with_settings(settings);
    for i in 1..=4 {
        harness
            .storage
            .put_document(&format!("orders/{}", i), "Orders", json!({"n": i}));
    }

    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));
    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 3 }
    );

    let first = engine.performance_history().pop().unwrap();
    assert_eq!(first.extracted.get(ItemType::Document), 3);
    let reason = first.batch_stop_reason.unwrap();
    assert!(
        reason.contains("maximum number of extracted documents (3)"),
        "unexpected stop reason: {}",
        reason
    );

    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 4 }
    );
    let second = engine.performance_history().pop().unwrap();
    assert_eq!(second.batch_complete_reason.as_deref(), Some(NO_MORE_ITEMS));

    let batches = harness.destination("orders-etl").batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(ids(&batches[1]), vec!["orders/4"]);
}

#[tokio::test]
async fn test_committed_checkpoints_never_decrease() {
    let settings = fixtures::settings().with_max_extracted_documents(2);
    let harness = Harness::with_settings(settings);
    for i in 1..=3 {
        harness
            .storage
            .put_document(&format!("orders/{}", i), "Orders", json!({"n": i}));
    }
    harness.storage.put_document("customers/1", "Customers", json!({}));
    harness.storage.put_document("customers/2", "Customers", json!({}));
    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));

    // Stopped by the limit, then drained, then only uninteresting changes.
    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 2 }
    );
    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 5 }
    );
    harness.storage.put_document("customers/3", "Customers", json!({}));
    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 6 }
    );
    assert_eq!(engine.run_iteration().await.unwrap(), IterationOutcome::Idle);

    let etags = harness.consensus.committed_etags();
    assert_eq!(etags, vec![2, 5, 6]);
    assert!(etags.windows(2).all(|w| w[0] <= w[1]));

    let state = harness
        .consensus
        .state(fixtures::DATABASE, "orders-etl", "orders");
    assert_eq!(state.last_processed_etag_for(fixtures::NODE), 6);
}

#[tokio::test]
async fn test_checkpoint_survives_failover() {
    let harness = Harness::new();
    for i in 1..=3 {
        harness
            .storage
            .put_document(&format!("orders/{}", i), "Orders", json!({"n": i}));
    }
    let config = fixtures::orders_configuration("orders-etl", SCRIPT);
    let destination = harness.destination("orders-etl");

    let on_a = harness.engine(&config);
    assert_eq!(
        on_a.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 3 }
    );
    assert_eq!(destination.loaded_items().len(), 3);

    // Node B holds the replicated documents under its own etags, plus one
    // written locally after the failover.
    let storage_b = Arc::new(MockStorage::new(fixtures::OTHER_NODE, "dbB"));
    for i in 1..=3 {
        let document = harness.storage.document(&format!("orders/{}", i)).unwrap();
        storage_b.put_raw_document("Orders", document);
    }
    storage_b.put_document("orders/4", "Orders", json!({"n": 4}));

    let ctx_b = EngineContext::new(
        fixtures::DATABASE,
        fixtures::OTHER_NODE,
        storage_b.clone(),
        harness.consensus.clone(),
        harness.compiler.clone(),
    )
    .with_settings(fixtures::settings());
    let on_b = harness.engine_with_context(ctx_b, &config);

    assert_eq!(
        on_b.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 4 }
    );
    let loaded = destination.loaded_items();
    assert_eq!(loaded.len(), 4);
    assert_eq!(loaded[3].id, "orders/4");
    let batch = on_b.performance_history().pop().unwrap();
    assert_eq!(batch.filtered.get(ItemType::Document), 3);

    // Node A restarts after a crash and finds nothing new to send.
    let restarted = harness.engine(&config);
    assert_eq!(restarted.run_iteration().await.unwrap(), IterationOutcome::Idle);
    assert_eq!(destination.loaded_items().len(), 4);

    let state = harness
        .consensus
        .state(fixtures::DATABASE, "orders-etl", "orders");
    assert_eq!(state.last_processed_etag_for(fixtures::NODE), 3);
    assert_eq!(state.last_processed_etag_for(fixtures::OTHER_NODE), 4);
}

#[tokio::test]
async fn test_replicated_document_with_older_vector_is_delivered() {
    let harness = Harness::new();
    let config = fixtures::orders_configuration("orders-etl", SCRIPT);
    let engine = harness.engine(&config);
    let destination = harness.destination("orders-etl");

    harness.storage.put_raw_document(
        "Orders",
        RawDocument {
            id: "orders/2".to_string(),
            etag: 0,
            change_vector: "B:5-dbB".to_string(),
            data: json!({"n": 2}),
        },
    );
    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 1 }
    );

    // Our own checkpoint already merged B:5, but this document was never sent.
    harness.storage.put_raw_document(
        "Orders",
        RawDocument {
            id: "orders/1".to_string(),
            etag: 0,
            change_vector: "B:3-dbB".to_string(),
            data: json!({"n": 1}),
        },
    );
    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 2 }
    );

    assert_eq!(ids(&destination.loaded_items()), vec!["orders/2", "orders/1"]);
    let batch = engine.performance_history().pop().unwrap();
    assert_eq!(batch.filtered.get(ItemType::Document), 0);
}

#[tokio::test]
async fn test_fallback_ends_when_nothing_is_left_to_load() {
    let harness = Harness::new();
    harness.storage.put_document("orders/1", "Orders", json!({}));
    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));
    let destination = harness.destination("orders-etl");
    destination.fail_next(1);

    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::LoadFailed
    );
    assert!(engine.fallback_time().is_some());

    // Node B delivered orders/1 in the meantime.
    let mut taken_over = ProcessState::new("orders-etl", "orders");
    taken_over.advance(fixtures::OTHER_NODE, 10, "A:5-dbA".to_string());
    harness.consensus.set_state(fixtures::DATABASE, taken_over);

    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 1 }
    );
    assert_eq!(engine.fallback_time(), None);
    assert_eq!(destination.load_attempts(), 1);
    assert!(destination.loaded_items().is_empty());
}

#[tokio::test]
async fn test_reset_state_reprocesses_everything() {
    let harness = Harness::new();
    harness.storage.put_document("orders/1", "Orders", json!({}));
    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));

    engine.run_iteration().await.unwrap();
    harness
        .consensus
        .reset_state(fixtures::DATABASE, "orders-etl", "orders");

    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 1 }
    );
    assert_eq!(harness.destination("orders-etl").loaded_items().len(), 2);
}

#[tokio::test]
async fn test_counter_groups_never_precede_their_documents() {
    let settings = fixtures::settings().with_max_extracted_documents(1);
    let harness = Harness::with_settings(settings);
    harness.storage.put_document("orders/1", "Orders", json!({"n": 1}));
    harness.storage.put_counter("orders/1", "likes", 1);
    harness.storage.put_document("orders/2", "Orders", json!({"n": 2}));
    harness.storage.put_counter("orders/2", "likes", 2);
    // orders/1 moves past both counter groups.
    harness.storage.put_document("orders/1", "Orders", json!({"n": 10}));

    let engine = harness.engine(&fixtures::peer_configuration("orders-peer", "counters"));
    assert!(engine.handles_counters());

    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 3 }
    );
    let first = engine.performance_history().pop().unwrap();
    assert_eq!(first.filtered.get(ItemType::CounterGroup), 1);

    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 5 }
    );
    assert_eq!(engine.run_iteration().await.unwrap(), IterationOutcome::Idle);

    let batches = harness.destination("orders-peer").batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(ids(&batches[0]), vec!["orders/2"]);
    assert_eq!(ids(&batches[1]), vec!["orders/1", "orders/2"]);
    assert_eq!(batches[1][1].item_type, ItemType::CounterGroup);

    let loaded = harness.destination("orders-peer").loaded_items();
    for (position, item) in loaded.iter().enumerate() {
        if item.item_type == ItemType::CounterGroup {
            assert!(
                loaded[..position]
                    .iter()
                    .any(|d| d.item_type == ItemType::Document && d.id == item.id),
                "counters of {} were loaded before the document",
                item.id
            );
        }
    }
}

#[tokio::test]
async fn test_relational_destination_skips_counters() {
    let harness = Harness::new();
    harness.storage.put_document("orders/1", "Orders", json!({}));
    harness.storage.put_counter("orders/1", "likes", 1);

    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", "counters"));
    assert!(!engine.handles_counters());
    assert!(!engine.notify_change(&StorageChange::new(
        ChangeKind::CounterChange,
        "orders/1",
        "Orders"
    )));

    engine.run_iteration().await.unwrap();
    let loaded = harness.destination("orders-etl").loaded_items();
    assert_eq!(ids(&loaded), vec!["orders/1"]);
}

#[tokio::test]
async fn test_runtime_errors_do_not_stop_the_batch() {
    let harness = Harness::new();
    for i in 1..=3 {
        harness
            .storage
            .put_document(&format!("orders/{}", i), "Orders", json!({"n": i}));
    }

    let engine = harness.engine(&fixtures::orders_configuration(
        "orders-etl",
        "fail-runtime:orders/2",
    ));
    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 3 }
    );

    let loaded = harness.destination("orders-etl").loaded_items();
    assert_eq!(ids(&loaded), vec!["orders/1", "orders/3"]);

    let statistics = engine.statistics();
    assert_eq!(statistics.transformation_errors, 1);
    assert_eq!(statistics.transformation_successes, 2);
    assert_eq!(
        engine.performance_history().pop().unwrap().transformation_errors,
        1
    );
}

#[tokio::test]
async fn test_load_failure_enters_fallback_without_commit() {
    let harness = Harness::new();
    harness.storage.put_document("orders/1", "Orders", json!({}));
    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));
    let destination = harness.destination("orders-etl");
    destination.fail_next(1);

    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::LoadFailed
    );
    assert_eq!(engine.fallback_time(), Some(Duration::from_secs(5)));
    assert!(harness.consensus.committed_etags().is_empty());
    assert!(engine
        .performance_history()
        .pop()
        .unwrap()
        .load_error
        .is_some());

    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 1 }
    );
    assert_eq!(engine.fallback_time(), None);
    assert_eq!(destination.load_attempts(), 2);
    assert_eq!(destination.loaded_items().len(), 1);
}

#[tokio::test]
async fn test_transient_commit_failures_are_retried() {
    let harness = Harness::new();
    harness.storage.put_document("orders/1", "Orders", json!({}));
    harness.consensus.fail_transiently(2);

    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));
    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 1 }
    );
    assert_eq!(harness.consensus.committed_etags(), vec![1]);
}

#[tokio::test]
async fn test_rejected_commit_is_an_error() {
    let harness = Harness::new();
    harness.storage.put_document("orders/1", "Orders", json!({}));
    harness.consensus.set_rejecting(true);

    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));
    assert!(engine.run_iteration().await.is_err());

    harness.consensus.set_rejecting(false);
    // The batch was delivered but not checkpointed, so it is delivered again.
    engine.run_iteration().await.unwrap();
    assert_eq!(harness.destination("orders-etl").loaded_items().len(), 2);
}

#[tokio::test]
async fn test_storage_failure_is_an_error() {
    let harness = Harness::new();
    harness.storage.set_read_failure(true);
    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));
    assert!(engine.run_iteration().await.is_err());
    assert!(engine.progress().is_err());
}

#[tokio::test]
async fn test_compile_error_faults_the_engine_once() {
    let harness = Harness::new();
    harness.spawn_alert_writer();
    harness.storage.put_document("orders/1", "Orders", json!({}));

    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", "fail-compile"));
    engine.start().unwrap();

    assert!(wait_until(Duration::from_secs(2), || engine.state() == EngineState::ScriptFaulted).await);
    assert!(
        wait_until(Duration::from_secs(2), || !harness
            .center
            .raised_of(AlertType::EtlScriptError)
            .is_empty())
        .await
    );

    assert_eq!(engine.run_iteration().await.unwrap(), IterationOutcome::ScriptFaulted);
    engine.stop("test finished").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.state(), EngineState::ScriptFaulted);
    assert_eq!(harness.center.raised_of(AlertType::EtlScriptError).len(), 1);
    assert_eq!(harness.destination("orders-etl").load_attempts(), 0);
}

#[tokio::test]
async fn test_compile_error_during_transform_faults_the_engine() {
    let harness = Harness::new();
    harness.storage.put_document("orders/1", "Orders", json!({}));

    let engine = harness.engine(&fixtures::orders_configuration(
        "orders-etl",
        "compile-error-at-runtime",
    ));
    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::ScriptFaulted
    );
    assert_eq!(engine.state(), EngineState::ScriptFaulted);
    assert!(harness.consensus.committed_etags().is_empty());
    assert_eq!(harness.destination("orders-etl").load_attempts(), 0);
}

#[tokio::test]
async fn test_low_memory_caps_the_batch() {
    let harness = Harness::new();
    for i in 1..=20 {
        harness
            .storage
            .put_document(&format!("orders/{}", i), "Orders", json!({"n": i}));
    }
    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));
    harness.low_memory.notify_low_memory();

    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 16 }
    );
    let batch = engine.performance_history().pop().unwrap();
    assert!(batch.batch_stop_reason.unwrap().contains("low memory"));

    harness.low_memory.notify_pressure_over();
    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 20 }
    );
}

#[tokio::test]
async fn test_refused_memory_budget_ends_the_batch() {
    let settings = fixtures::settings().with_initial_memory_budget(1);
    let harness = Harness::with_settings(settings);
    harness.storage.put_document("orders/1", "Orders", json!({"total": 10}));
    harness.storage.put_document("orders/2", "Orders", json!({"total": 20}));

    let ctx = harness
        .engine_context()
        .with_memory_budget(Arc::new(SharedMemoryBudget::new(0)));
    let engine =
        harness.engine_with_context(ctx, &fixtures::orders_configuration("orders-etl", SCRIPT));

    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 1 }
    );
    let batch = engine.performance_history().pop().unwrap();
    assert!(batch.batch_stop_reason.unwrap().contains("could not be increased"));
    assert_eq!(harness.storage.non_reusable_count(), 1);
}

#[tokio::test]
async fn test_cpu_credit_exhaustion_pauses_the_engine() {
    let harness = Harness::new();
    harness.spawn_alert_writer();
    harness.storage.put_document("orders/1", "Orders", json!({}));

    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));
    harness.cpu_credits.raise();

    // A batch that starts without credits ends before its first item.
    assert_eq!(engine.run_iteration().await.unwrap(), IterationOutcome::Idle);
    assert!(engine
        .performance_history()
        .is_empty());

    engine.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || engine.state() == EngineState::CpuCreditsWait).await);
    assert!(
        wait_until(Duration::from_secs(2), || !harness
            .center
            .raised_of(AlertType::CpuCreditsExhausted)
            .is_empty())
        .await
    );
    assert!(harness.destination("orders-etl").loaded_items().is_empty());

    harness.cpu_credits.clear();
    let alert_id = Alert::id_for(AlertType::CpuCreditsExhausted, engine.name());
    assert!(
        wait_until(Duration::from_secs(2), || harness
            .center
            .dismissed()
            .contains(&alert_id))
        .await
    );
    assert!(
        wait_until(Duration::from_secs(2), || harness
            .destination("orders-etl")
            .loaded_items()
            .len()
            == 1)
        .await
    );

    engine.stop("test finished").unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_started_engine_wakes_on_notification() {
    let harness = Harness::new();
    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));
    engine.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || engine.state() == EngineState::Idle).await);

    harness.storage.put_document("customers/1", "Customers", json!({}));
    assert!(!engine.notify_change(&StorageChange::new(
        ChangeKind::DocumentPut,
        "customers/1",
        "Customers"
    )));

    harness.storage.put_document("orders/1", "Orders", json!({}));
    assert!(engine.notify_change(&StorageChange::new(
        ChangeKind::DocumentPut,
        "orders/1",
        "Orders"
    )));

    assert!(
        wait_until(Duration::from_secs(2), || harness.consensus.committed_etags().last() == Some(&2))
            .await
    );
    assert_eq!(
        ids(&harness.destination("orders-etl").loaded_items()),
        vec!["orders/1"]
    );

    engine.stop("test finished").unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn test_early_notification_does_not_shorten_fallback() {
    let fallback = Duration::from_millis(600);
    let harness = Harness::with_settings(fixtures::settings().with_min_fallback_time(fallback));
    harness.storage.put_document("orders/1", "Orders", json!({}));
    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));
    let destination = harness.destination("orders-etl");
    destination.fail_next(1);

    engine.start().unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || engine.state() == EngineState::FallbackWait).await
    );
    let failed_at = std::time::Instant::now();
    assert_eq!(destination.load_attempts(), 1);
    assert_eq!(engine.fallback_time(), Some(fallback));

    harness.storage.put_document("orders/2", "Orders", json!({}));
    assert!(engine.notify_change(&StorageChange::new(
        ChangeKind::DocumentPut,
        "orders/2",
        "Orders"
    )));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(destination.load_attempts(), 1);
    assert_eq!(engine.state(), EngineState::FallbackWait);

    assert!(
        wait_until(Duration::from_secs(3), || destination.loaded_items().len() == 2).await
    );
    assert!(failed_at.elapsed() >= Duration::from_millis(400));
    assert_eq!(destination.load_attempts(), 2);
    assert_eq!(engine.fallback_time(), None);

    engine.stop("test finished").unwrap();
}

#[tokio::test]
async fn test_progress_reports_remaining_work() {
    let settings = fixtures::settings().with_max_extracted_documents(2);
    let harness = Harness::with_settings(settings);
    for i in 1..=3 {
        harness
            .storage
            .put_document(&format!("orders/{}", i), "Orders", json!({"n": i}));
    }
    harness.storage.put_document("orders/9", "Orders", json!({}));
    harness.storage.delete_document("orders/9");

    let engine = harness.engine(&fixtures::orders_configuration("orders-etl", SCRIPT));
    let before = engine.progress().unwrap();
    assert_eq!(before.collections.len(), 1);
    assert_eq!(before.collections[0].collection, "Orders");
    assert_eq!(before.collections[0].remaining_documents, 3);
    assert_eq!(before.collections[0].remaining_tombstones, 1);
    assert!(!before.is_completed());

    engine.run_iteration().await.unwrap();
    let partial = engine.progress().unwrap();
    assert_eq!(partial.collections[0].remaining_documents, 1);
    assert_eq!(partial.collections[0].remaining_tombstones, 1);

    engine.run_iteration().await.unwrap();
    let done = engine.progress().unwrap();
    assert!(done.is_completed());
    assert!(done.processed_per_second > 0.0);
}

#[tokio::test]
async fn test_script_dry_run_delivers_nothing() {
    let harness = Harness::new();
    harness.spawn_alert_writer();
    let document = RawDocument {
        id: "orders/1".to_string(),
        etag: 7,
        change_vector: "A:7-dbA".to_string(),
        data: json!({"total": 10, "@metadata": {"@collection": "Orders"}}),
    };

    let relational = harness.engine(&fixtures::orders_configuration("orders-etl", "debug"));
    let result = relational.test_script(TestScriptInput {
        document: document.clone(),
        is_delete: false,
    });
    assert_eq!(ids(&result.transformed), vec!["orders/1"]);
    assert!(result.captured.is_none());
    assert_eq!(result.debug_output, vec!["orders/1 @ 7"]);
    assert!(!result.filtered);

    let deleted = relational.test_script(TestScriptInput {
        document: document.clone(),
        is_delete: true,
    });
    assert!(deleted.transformed[0].is_delete);

    let peer = harness.engine(&fixtures::peer_configuration("orders-peer", SCRIPT));
    let captured = peer
        .test_script(TestScriptInput {
            document: document.clone(),
            is_delete: false,
        })
        .captured
        .unwrap();
    assert_eq!(ids(&captured), vec!["orders/1"]);

    let mut customer = document.clone();
    customer.data = json!({"@metadata": {"@collection": "Customers"}});
    assert!(relational
        .test_script(TestScriptInput {
            document: customer,
            is_delete: false,
        })
        .filtered);

    let broken = harness.engine(&fixtures::orders_configuration("broken-etl", "fail-compile"));
    let failed = broken.test_script(TestScriptInput {
        document,
        is_delete: false,
    });
    assert_eq!(failed.transformation_errors.len(), 1);
    assert!(failed.transformed.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.center.raised().is_empty());
    assert!(harness.consensus.committed_etags().is_empty());
    assert!(harness.destination("orders-etl").loaded_items().is_empty());
    assert!(harness.destination("orders-peer").loaded_items().is_empty());
}

#[tokio::test]
async fn test_id_generator_documents_are_filtered_for_all_collections() {
    let harness = Harness::new();
    harness.storage.put_document("hilo/orders", "@hilo", json!({"max": 32}));
    harness.storage.put_document("orders/1", "Orders", json!({}));

    let engine = harness.engine(&fixtures::peer_configuration("orders-peer", SCRIPT));
    assert_eq!(
        engine.run_iteration().await.unwrap(),
        IterationOutcome::Progress { checkpoint: 2 }
    );
    assert_eq!(
        ids(&harness.destination("orders-peer").loaded_items()),
        vec!["orders/1"]
    );
}

#[tokio::test]
async fn test_attachment_tombstones_follow_destination_interest() {
    let harness = Harness::new();
    harness.storage.put_document("orders/1", "Orders", json!({}));
    harness.storage.delete_attachment("orders/1", "Orders", "invoice.pdf");

    let destination = harness.destination("orders-peer");
    destination.set_cares_about_attachments(true);
    let engine = harness.engine(&fixtures::peer_configuration("orders-peer", SCRIPT));
    engine.run_iteration().await.unwrap();

    let loaded = destination.loaded_items();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[1].id, "orders/1/invoice.pdf");
    assert!(loaded[1].is_delete);
}
