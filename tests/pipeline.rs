use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use asnstats::export::PipelineMetrics;
use asnstats::pipeline::merge::{Pass, PrefixCountRecord};
use asnstats::pipeline::snapshot::{ChangeRatios, SnapshotRow};
use asnstats::pipeline::{Pipeline, PipelineSettings, RunContext};
use asnstats::store::memory::{FailureKind, MemoryStore, Statement};

const T0: i64 = 1_700_000_000;

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

fn ctx_at(secs: i64) -> RunContext {
    RunContext::at(
        ts(secs),
        Arc::new(PipelineMetrics::new("").expect("metrics register")),
        CancellationToken::new(),
    )
}

fn pipeline(store: &MemoryStore, workers: usize, batch_size: usize) -> Pipeline<MemoryStore> {
    Pipeline::new(
        store.clone(),
        PipelineSettings {
            workers,
            origin_batch_size: batch_size,
            transit_batch_size: batch_size,
            last_state_window: Duration::from_secs(8 * 60),
            origin_query: "SELECT origin_as AS asn FROM rib WHERE origin_as IN ({asn_list})"
                .to_string(),
            transit_query: "SELECT asn FROM as_path_analysis WHERE asn IN ({asn_list})"
                .to_string(),
        },
    )
}

/// Universe {100, 200, 23456, 300}: 100 originates and transits, 300 only
/// transits, 200 has no prefixes, 23456 is AS_TRANS.
fn reference_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.set_asns([100, 200, 23456, 300]);
    store.set_counts(Pass::Origin, 100, 3, 1);
    store.set_counts(Pass::Transit, 100, 0, 2);
    store.set_counts(Pass::Transit, 300, 5, 0);
    store
}

fn rows_at(store: &MemoryStore, secs: i64) -> Vec<SnapshotRow> {
    store
        .snapshots()
        .into_iter()
        .filter(|r| r.timestamp == ts(secs))
        .collect()
}

#[tokio::test]
async fn test_reference_run_end_to_end() {
    let store = reference_store();
    let summary = pipeline(&store, 2, 2)
        .run(&ctx_at(T0))
        .await
        .expect("run completes");

    assert_eq!(summary.asns, 3);
    assert_eq!(summary.origin.batches, 2, "[100,200] and [300]");
    assert_eq!(summary.transit.batches, 2);
    assert_eq!(summary.records, 3);
    assert_eq!(summary.snapshot.inserted, 3);
    assert!(summary.snapshot.written);
    assert!(summary.snapshot.last_state_refreshed);

    let rows = rows_at(&store, T0);
    assert_eq!(rows.len(), 3);

    let by_asn = |asn: u32| {
        rows.iter()
            .find(|r| r.asn == asn)
            .unwrap_or_else(|| panic!("no row for {asn}"))
    };

    let r100 = by_asn(100);
    assert_eq!(
        r100.counts,
        PrefixCountRecord {
            origin_v4: 3,
            origin_v6: 1,
            transit_v4: 0,
            transit_v6: 2,
        }
    );
    assert!(r100.is_origin() && r100.is_transit());

    let r200 = by_asn(200);
    assert_eq!(r200.counts, PrefixCountRecord::default());
    assert!(!r200.is_origin() && !r200.is_transit());

    let r300 = by_asn(300);
    assert_eq!(r300.counts.transit_v4, 5);
    assert!(!r300.is_origin() && r300.is_transit());

    assert!(rows.iter().all(|r| r.change == ChangeRatios::default()));
    assert!(rows.iter().all(|r| r.repeats == 0));
    assert!(store.snapshots().iter().all(|r| r.asn != 23456));

    let last: Vec<u32> = store.last_state().iter().map(|r| r.asn).collect();
    assert_eq!(last, vec![100, 200, 300]);

    assert_eq!(store.open_connections(), 0, "every session closed");
    assert_eq!(store.connections_opened(), 3, "two workers and one control session");
}

#[tokio::test]
async fn test_unchanged_rerun_collapses_into_repeats() {
    let store = reference_store();
    let p = pipeline(&store, 2, 2);

    p.run(&ctx_at(T0)).await.expect("first run");
    let summary = p.run(&ctx_at(T0 + 300)).await.expect("second run");

    assert_eq!(summary.snapshot.inserted, 0);
    assert_eq!(summary.snapshot.repeated, 3);

    let all = store.snapshots();
    assert_eq!(all.len(), 3, "no second timestamp");
    assert!(all.iter().all(|r| r.timestamp == ts(T0)));
    assert!(all.iter().all(|r| r.repeats == 1));
    assert!(all.iter().all(|r| r.updated_at == ts(T0 + 300)));

    p.run(&ctx_at(T0 + 600)).await.expect("third run");
    assert!(store.snapshots().iter().all(|r| r.repeats == 2));

    let last = store.last_state();
    assert!(last.iter().all(|r| r.timestamp == ts(T0 + 600)));
}

#[tokio::test]
async fn test_changed_counts_insert_rows_with_ratios() {
    let store = reference_store();
    store.set_counts(Pass::Origin, 100, 100, 1);
    let p = pipeline(&store, 2, 2);

    p.run(&ctx_at(T0)).await.expect("first run");

    store.set_counts(Pass::Origin, 100, 150, 1);
    let summary = p.run(&ctx_at(T0 + 300)).await.expect("growth run");
    assert_eq!(summary.snapshot.inserted, 1);
    assert_eq!(summary.snapshot.repeated, 2);

    let grown = rows_at(&store, T0 + 300);
    assert_eq!(grown.len(), 1);
    assert_eq!(grown[0].asn, 100);
    assert_eq!(grown[0].change.origin_v4, 1.5);
    assert_eq!(grown[0].change.origin_v6, 0.0);

    store.set_counts(Pass::Origin, 100, 100, 1);
    p.run(&ctx_at(T0 + 600)).await.expect("shrink run");
    let shrunk = rows_at(&store, T0 + 600);
    assert_eq!(shrunk.len(), 1);
    assert_eq!(shrunk[0].change.origin_v4, -1.5);

    let last = store.last_state();
    let r100 = last.iter().find(|r| r.asn == 100).expect("last state for 100");
    assert_eq!(r100.counts.origin_v4, 100);
}

#[tokio::test]
async fn test_same_run_resubmission_is_noop() {
    let store = reference_store();
    let p = pipeline(&store, 2, 2);

    p.run(&ctx_at(T0)).await.expect("first run");
    store.set_counts(Pass::Origin, 100, 9, 9);
    let summary = p.run(&ctx_at(T0)).await.expect("resubmitted run");

    assert_eq!(summary.snapshot.unchanged, 3);
    assert!(!summary.snapshot.written);

    let all = store.snapshots();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|r| r.repeats == 0));
    assert_eq!(store.bulk_writes(), 1);
}

#[tokio::test]
async fn test_failed_batch_undercounts_without_failing_run() {
    let store = reference_store();
    store.fail_batches_containing(300, FailureKind::Query);

    let ctx = ctx_at(T0);
    let summary = pipeline(&store, 2, 1)
        .run(&ctx)
        .await
        .expect("query failures are not fatal");

    assert_eq!(summary.origin.failed_batches, 1);
    assert_eq!(summary.transit.failed_batches, 1);
    assert_eq!(
        ctx.metrics
            .batch_failures
            .with_label_values(&["transit"])
            .get(),
        1
    );

    assert_eq!(summary.records, 2);
    let rows = rows_at(&store, T0);
    assert!(rows.iter().all(|r| r.asn != 300), "no made-up row for 300");
    let r100 = rows.iter().find(|r| r.asn == 100).expect("row for 100");
    assert_eq!(r100.counts.origin_v4, 3);
    assert!(store.last_state().iter().all(|r| r.asn != 300));
}

#[tokio::test]
async fn test_failed_batch_keeps_prior_snapshot_intact() {
    let store = MemoryStore::new();
    store.set_asns([100, 300]);
    store.set_counts(Pass::Origin, 100, 1, 0);
    store.set_counts(Pass::Origin, 300, 7, 2);
    store.set_counts(Pass::Transit, 300, 5, 1);
    let p = pipeline(&store, 2, 1);

    p.run(&ctx_at(T0)).await.expect("first run");

    store.fail_batches_containing(300, FailureKind::Query);
    p.run(&ctx_at(T0 + 300)).await.expect("degraded run");

    let r300: Vec<SnapshotRow> = store
        .snapshots()
        .into_iter()
        .filter(|r| r.asn == 300)
        .collect();
    assert_eq!(r300.len(), 1, "no zero row inserted for the failed ASN");
    assert_eq!(r300[0].timestamp, ts(T0));
    assert_eq!(r300[0].repeats, 0);

    let last = store.last_state();
    let last300 = last.iter().find(|r| r.asn == 300).expect("last state for 300");
    assert_eq!(last300.counts.origin_v4, 7);
    assert_eq!(last300.counts.transit_v4, 5);

    store.clear_failures();
    let summary = p.run(&ctx_at(T0 + 600)).await.expect("recovered run");
    assert_eq!(summary.snapshot.inserted, 0, "recovery is a repeat, not a change");
    assert_eq!(store.snapshots().len(), 2);
}

#[tokio::test]
async fn test_panicking_batch_fails_run_without_writing() {
    let store = reference_store();
    store.fail_batches_containing(300, FailureKind::Panic);

    let err = pipeline(&store, 2, 1)
        .run(&ctx_at(T0))
        .await
        .expect_err("panic is fatal");

    assert!(format!("{err:#}").contains("batch task panicked"));
    assert!(store.snapshots().is_empty());
    assert!(store.last_state().is_empty());
    assert_eq!(store.open_connections(), 0);
}

#[tokio::test]
async fn test_unreachable_store_fails_before_work() {
    let store = reference_store();
    store.set_unreachable(true);

    let err = pipeline(&store, 2, 2)
        .run(&ctx_at(T0))
        .await
        .expect_err("connection failure is fatal");

    assert!(format!("{err:#}").contains("store connection failed"));
    assert!(store.snapshots().is_empty());
    assert_eq!(store.connections_opened(), 0);
}

#[tokio::test]
async fn test_connection_loss_mid_pass_aborts_run() {
    let store = reference_store();
    store.fail_batches_containing(300, FailureKind::Connection);

    let err = pipeline(&store, 2, 1)
        .run(&ctx_at(T0))
        .await
        .expect_err("lost connection is fatal");

    assert!(format!("{err:#}").contains("running origin pass"));
    assert!(store.snapshots().is_empty());
    assert!(store.last_state().is_empty());
    assert_eq!(store.open_connections(), 0, "every session closed on abort");
}

#[tokio::test]
async fn test_cancelled_run_writes_nothing() {
    let store = reference_store();
    store.set_latency(Duration::from_secs(30));

    let ctx = ctx_at(T0);
    ctx.cancel.cancel();

    let err = pipeline(&store, 1, 1)
        .run(&ctx)
        .await
        .expect_err("cancelled run fails");

    assert!(format!("{err:#}").contains("cancelled"));
    assert!(store.snapshots().is_empty());
    assert_eq!(store.open_connections(), 0);
}

#[tokio::test]
async fn test_bulk_write_failure_is_logged_and_counted() {
    let store = reference_store();
    store.fail_statement(Statement::WriteSnapshots, FailureKind::Query);

    let ctx = ctx_at(T0);
    let summary = pipeline(&store, 2, 2)
        .run(&ctx)
        .await
        .expect("write failure is not fatal");

    assert_eq!(summary.snapshot.inserted, 3);
    assert!(!summary.snapshot.written);
    assert!(summary.snapshot.last_state_refreshed);
    assert_eq!(
        ctx.metrics
            .snapshot_write_errors
            .with_label_values(&["bulk_write"])
            .get(),
        1
    );
    assert!(store.snapshots().is_empty());
}

#[tokio::test]
async fn test_empty_universe_skips_snapshot_stage() {
    let store = MemoryStore::new();

    let summary = pipeline(&store, 2, 2)
        .run(&ctx_at(T0))
        .await
        .expect("empty run completes");

    assert_eq!(summary.records, 0);
    assert!(!summary.snapshot.written);
    assert!(!summary.snapshot.last_state_refreshed);
    assert_eq!(store.bulk_writes(), 0);
}

#[tokio::test]
async fn test_last_state_keeps_asns_outside_window() {
    let store = reference_store();
    let p = pipeline(&store, 2, 2);

    p.run(&ctx_at(T0)).await.expect("first run");

    store.set_asns([100, 200]);
    p.run(&ctx_at(T0 + 3_600)).await.expect("later run");

    let last = store.last_state();
    assert_eq!(last.len(), 3);

    let stamp = |asn: u32| last.iter().find(|r| r.asn == asn).map(|r| r.timestamp);
    assert_eq!(stamp(100), Some(ts(T0 + 3_600)));
    assert_eq!(stamp(300), Some(ts(T0)), "untouched ASN keeps its last row");
}

#[tokio::test]
async fn test_worker_count_bounds_concurrency() {
    let store = MemoryStore::new();
    store.set_latency(Duration::from_millis(2));
    let universe: Vec<u32> = (10_000..10_200).collect();
    for asn in &universe {
        store.set_counts(Pass::Origin, *asn, 1, 1);
        store.set_counts(Pass::Transit, *asn, 2, 0);
    }
    store.set_asns(universe);

    let summary = pipeline(&store, 4, 10)
        .run(&ctx_at(T0))
        .await
        .expect("run completes");

    assert_eq!(summary.origin.batches, 20);
    assert_eq!(summary.transit.batches, 20);
    assert!(store.peak_concurrent_queries() <= 4);
    assert_eq!(summary.snapshot.inserted, 200);
}
