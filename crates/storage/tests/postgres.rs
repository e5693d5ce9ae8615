//! Runs only when `TEST_DATABASE_DSN` points at a disposable database.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use error_stack::Report;
use metric_types::Metrics;
use metric_types::Sample;
use metric_types::ValueMetric;
use similar_asserts::assert_eq;
use storage::PostgresStore;
use storage::Store;
use storage::StoreError;
use tokio_util::sync::CancellationToken;

async fn connect(batch_limit: usize) -> Option<PostgresStore> {
    let Ok(dsn) = std::env::var("TEST_DATABASE_DSN") else {
        eprintln!("TEST_DATABASE_DSN not set, skipping");
        return None;
    };
    let store = PostgresStore::connect(&dsn, batch_limit, &CancellationToken::new())
        .await
        .expect("should connect to test database");
    Some(store)
}

fn unique(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after epoch")
        .as_nanos();
    format!("{prefix}_{}_{nanos}", std::process::id())
}

#[test_log::test(tokio::test)]
async fn counters_sum_and_gauges_replace() {
    let Some(store) = connect(100).await else {
        return;
    };
    let requests = unique("requests");
    let temp = unique("temp");

    store.add(&requests, ValueMetric::Counter(5)).await.expect("should add");
    let merged = store.add(&requests, ValueMetric::Counter(7)).await.expect("should add");
    assert_eq!(merged, ValueMetric::Counter(12));

    store.add(&temp, ValueMetric::Gauge(36.6)).await.expect("should add");
    let merged = store.add(&temp, ValueMetric::Gauge(37.1)).await.expect("should add");
    assert_eq!(merged, ValueMetric::Gauge(37.1));
    assert_eq!(store.get(&temp).await.expect("should exist"), ValueMetric::Gauge(37.1));
}

#[test_log::test(tokio::test)]
async fn kind_mismatch_leaves_row_unchanged() {
    let Some(store) = connect(100).await else {
        return;
    };
    let name = unique("x");

    store.add(&name, ValueMetric::Gauge(1.0)).await.expect("should add");
    let err = store
        .add(&name, ValueMetric::Counter(1))
        .await
        .expect_err("should reject");

    assert!(matches!(err.current_context(), StoreError::KindMismatch { .. }));
    assert_eq!(store.get(&name).await.expect("should exist"), ValueMetric::Gauge(1.0));
}

#[test_log::test(tokio::test)]
async fn failing_chunk_rolls_back_the_whole_batch() {
    let Some(store) = connect(100).await else {
        return;
    };
    let prefix = unique("bulk");
    let poisoned = format!("{prefix}_poisoned");
    store.add(&poisoned, ValueMetric::Gauge(1.0)).await.expect("should add");

    // row 150 lands in the second chunk and conflicts with the gauge
    let records: Vec<Metrics> = (0..250)
        .map(|i| {
            let name = if i == 150 {
                poisoned.clone()
            } else {
                format!("{prefix}_{i}")
            };
            Metrics::from(Sample::counter(name, 1))
        })
        .collect();

    let err = store.add_multi(records).await.expect_err("should roll back");
    assert!(matches!(err.current_context(), StoreError::KindMismatch { .. }));

    let first_chunk_row = store.get(&format!("{prefix}_0")).await;
    assert!(matches!(
        first_chunk_row.expect_err("should be rolled back").current_context(),
        StoreError::NotFound { .. }
    ));
}

#[test_log::test(tokio::test)]
async fn batch_of_250_commits_in_one_call() {
    let Some(store) = connect(100).await else {
        return;
    };
    let prefix = unique("bulk_ok");
    let records: Vec<Metrics> = (0..250)
        .map(|i| Metrics::from(Sample::counter(format!("{prefix}_{}", i % 10), 1)))
        .collect();

    let merged = store.add_multi(records).await.expect("should commit");

    assert_eq!(merged.len(), 250);
    assert_eq!(
        store.get(&format!("{prefix}_3")).await.expect("should exist"),
        ValueMetric::Counter(25)
    );
}

#[test_log::test(tokio::test)]
async fn read_all_and_clear_zeroes_counters() {
    let Some(store) = connect(100).await else {
        return;
    };
    let name = unique("cleared");
    store.add(&name, ValueMetric::Counter(4)).await.expect("should add");

    let mut seen = None;
    store
        .read_all_and_clear(&mut |n, value| {
            if n == name {
                seen = Some(*value);
            }
            Ok(())
        })
        .await
        .expect("should read");

    assert_eq!(seen, Some(ValueMetric::Counter(4)));
    assert_eq!(store.get(&name).await.expect("should exist"), ValueMetric::Counter(0));
    store.ping().await.expect("should ping");
}

#[test_log::test(tokio::test)]
async fn repeated_adds_reuse_cached_statements() {
    let Some(store) = connect(100).await else {
        return;
    };
    let hits = unique("hits");
    let load = unique("load");

    for round in 1..=20_i64 {
        let merged = store.add(&hits, ValueMetric::Counter(1)).await.expect("should add");
        assert_eq!(merged, ValueMetric::Counter(round));
        let reading = round as f64 / 10.0;
        let merged = store.add(&load, ValueMetric::Gauge(reading)).await.expect("should add");
        assert_eq!(merged, ValueMetric::Gauge(reading));
    }
    let err = store
        .add(&load, ValueMetric::Counter(1))
        .await
        .expect_err("should reject");
    assert!(matches!(err.current_context(), StoreError::KindMismatch { .. }));
}

#[test_log::test(tokio::test)]
async fn failed_visit_leaves_counters_intact() {
    let Some(store) = connect(100).await else {
        return;
    };
    let name = unique("kept");
    store.add(&name, ValueMetric::Counter(5)).await.expect("should add");

    store
        .read_all_and_clear(&mut |_, _| Err(Report::new(StoreError::persistence("stop"))))
        .await
        .expect_err("should abort");

    assert_eq!(store.get(&name).await.expect("should exist"), ValueMetric::Counter(5));
}
