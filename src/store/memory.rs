//! In-process store used by tests and benchmarks.
//!
//! Emulates the ClickHouse tables closely enough for the pipeline: grouped
//! prefix counts only return non-zero groups, snapshot rows replace each
//! other per `(asn, timestamp)` by highest `repeats`, and the last-state
//! table keeps one row per ASN.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::pipeline::merge::Pass;
use crate::pipeline::snapshot::{LastStateRow, SnapshotRow};

use super::{AggregationQuery, Connection, Connector, PrefixCountRow, StoreError};

/// How an injected failure surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Query,
    Connection,
    /// The call panics instead of returning.
    Panic,
}

impl FailureKind {
    fn error(self, what: &str) -> StoreError {
        match self {
            Self::Query => StoreError::Query(format!("injected failure: {what}")),
            Self::Connection => StoreError::Connection(format!("injected failure: {what}")),
            Self::Panic => panic!("injected panic: {what}"),
        }
    }
}

/// Non-batch statements that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statement {
    FetchActiveAsns,
    FetchLatestSnapshots,
    WriteSnapshots,
    RefreshLastState,
    Execute,
}

#[derive(Default)]
struct State {
    asns: Vec<u32>,
    counts: HashMap<(Pass, u32), (u64, u64)>,
    failing_asns: HashMap<u32, FailureKind>,
    failing_statements: HashMap<Statement, FailureKind>,
    unreachable: bool,
    connection_limit: Option<usize>,
    latency: Duration,

    snapshots: BTreeMap<(u32, DateTime<Utc>), SnapshotRow>,
    last_state: BTreeMap<u32, LastStateRow>,
    executed: Vec<String>,
    bulk_writes: usize,

    open: usize,
    opened: usize,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Shared in-memory store. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the ASN universe returned by `fetch_active_asns`.
    pub fn set_asns(&self, asns: impl IntoIterator<Item = u32>) {
        self.state.lock().asns = asns.into_iter().collect();
    }

    /// Sets the distinct prefix counts one pass reports for an ASN.
    pub fn set_counts(&self, pass: Pass, asn: u32, v4: u64, v6: u64) {
        self.state.lock().counts.insert((pass, asn), (v4, v6));
    }

    /// Makes every batch query containing `asn` fail.
    pub fn fail_batches_containing(&self, asn: u32, kind: FailureKind) {
        self.state.lock().failing_asns.insert(asn, kind);
    }

    /// Makes a non-batch statement fail.
    pub fn fail_statement(&self, statement: Statement, kind: FailureKind) {
        self.state.lock().failing_statements.insert(statement, kind);
    }

    /// Removes every injected failure.
    pub fn clear_failures(&self) {
        let mut st = self.state.lock();
        st.failing_asns.clear();
        st.failing_statements.clear();
    }

    /// Refuses new connections while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Refuses connections once `limit` sessions have been opened in total.
    pub fn set_connection_limit(&self, limit: usize) {
        self.state.lock().connection_limit = Some(limit);
    }

    /// Delay applied to every batch query.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// All snapshot rows in `(asn, timestamp)` order.
    pub fn snapshots(&self) -> Vec<SnapshotRow> {
        self.state.lock().snapshots.values().cloned().collect()
    }

    /// All last-state rows in ASN order.
    pub fn last_state(&self) -> Vec<LastStateRow> {
        self.state.lock().last_state.values().cloned().collect()
    }

    /// Statements passed to `execute`, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    /// Number of accepted bulk snapshot writes.
    pub fn bulk_writes(&self) -> usize {
        self.state.lock().bulk_writes
    }

    /// Sessions neither closed nor dropped.
    pub fn open_connections(&self) -> usize {
        self.state.lock().open
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().opened
    }

    /// Highest number of batch queries observed running at once.
    pub fn peak_concurrent_queries(&self) -> usize {
        self.state.lock().peak_in_flight
    }
}

impl Connector for MemoryStore {
    type Conn = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, StoreError> {
        let mut st = self.state.lock();
        if st.unreachable || st.connection_limit.is_some_and(|limit| st.opened >= limit) {
            return Err(StoreError::Connection("connection refused".to_string()));
        }

        st.open += 1;
        st.opened += 1;

        Ok(MemoryConnection {
            state: Arc::clone(&self.state),
        })
    }
}

/// One session on a [`MemoryStore`].
///
/// Dropping the session releases it, like a ClickHouse handle going back to
/// its pool.
pub struct MemoryConnection {
    state: Arc<Mutex<State>>,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        st.open = st.open.saturating_sub(1);
    }
}

/// Counts a batch query as running until dropped, including mid-sleep.
struct QueryInFlight<'a> {
    state: &'a Mutex<State>,
}

impl Drop for QueryInFlight<'_> {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        st.in_flight = st.in_flight.saturating_sub(1);
    }
}

impl MemoryConnection {
    fn check(&self, statement: Statement) -> Result<(), StoreError> {
        let failure = self.state.lock().failing_statements.get(&statement).copied();
        match failure {
            Some(kind) => Err(kind.error(&format!("{statement:?}"))),
            None => Ok(()),
        }
    }
}

impl Connection for MemoryConnection {
    async fn fetch_active_asns(&mut self) -> Result<Vec<u32>, StoreError> {
        self.check(Statement::FetchActiveAsns)?;
        Ok(self.state.lock().asns.clone())
    }

    async fn fetch_prefix_counts(
        &mut self,
        query: &AggregationQuery,
        asns: &[u32],
    ) -> Result<Vec<PrefixCountRow>, StoreError> {
        let (failure, latency) = {
            let mut st = self.state.lock();
            let failure = asns.iter().find_map(|asn| st.failing_asns.get(asn).copied());
            st.in_flight += 1;
            st.peak_in_flight = st.peak_in_flight.max(st.in_flight);
            (failure, st.latency)
        };
        let _running = QueryInFlight { state: &self.state };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(kind) = failure {
            return Err(kind.error(&query.render(asns)));
        }

        let st = self.state.lock();

        let mut rows = Vec::new();
        for &asn in asns {
            let Some(&(v4, v6)) = st.counts.get(&(query.pass, asn)) else {
                continue;
            };
            for (is_ipv4, prefixes) in [(true, v4), (false, v6)] {
                if prefixes > 0 {
                    rows.push(PrefixCountRow {
                        asn,
                        is_ipv4,
                        prefixes,
                    });
                }
            }
        }

        Ok(rows)
    }

    async fn fetch_latest_snapshots(&mut self) -> Result<Vec<SnapshotRow>, StoreError> {
        self.check(Statement::FetchLatestSnapshots)?;

        let st = self.state.lock();
        let mut latest: BTreeMap<u32, SnapshotRow> = BTreeMap::new();
        for ((asn, _), row) in &st.snapshots {
            // Keys are ordered by timestamp within an ASN.
            latest.insert(*asn, row.clone());
        }

        Ok(latest.into_values().collect())
    }

    async fn write_snapshots(&mut self, rows: &[SnapshotRow]) -> Result<(), StoreError> {
        self.check(Statement::WriteSnapshots)?;

        let mut st = self.state.lock();
        for row in rows {
            let key = (row.asn, row.timestamp);
            let keep_existing = st
                .snapshots
                .get(&key)
                .is_some_and(|existing| existing.repeats > row.repeats);
            if !keep_existing {
                st.snapshots.insert(key, row.clone());
            }
        }
        st.bulk_writes += 1;

        Ok(())
    }

    async fn refresh_last_state(&mut self, since: DateTime<Utc>) -> Result<(), StoreError> {
        self.check(Statement::RefreshLastState)?;

        let mut st = self.state.lock();
        let mut fresh: BTreeMap<u32, LastStateRow> = BTreeMap::new();
        for row in st.snapshots.values().filter(|r| r.updated_at >= since) {
            fresh.insert(
                row.asn,
                LastStateRow {
                    asn: row.asn,
                    counts: row.counts,
                    timestamp: row.updated_at,
                },
            );
        }
        st.last_state.extend(fresh);

        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<(), StoreError> {
        self.check(Statement::Execute)?;
        self.state.lock().executed.push(sql.to_string());
        Ok(())
    }

    async fn close(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::merge::PrefixCountRecord;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn snapshot(asn: u32, at: i64, repeats: u64, origin_v4: u64) -> SnapshotRow {
        SnapshotRow {
            asn,
            counts: PrefixCountRecord {
                origin_v4,
                ..Default::default()
            },
            change: Default::default(),
            repeats,
            timestamp: ts(at),
            updated_at: ts(at),
        }
    }

    #[tokio::test]
    async fn test_prefix_counts_skip_zero_groups() {
        let store = MemoryStore::new();
        store.set_counts(Pass::Transit, 300, 5, 0);

        let mut conn = store.connect().await.expect("connect");
        let rows = conn
            .fetch_prefix_counts(&AggregationQuery::new(Pass::Transit, "q"), &[300, 400])
            .await
            .expect("query");

        assert_eq!(
            rows,
            vec![PrefixCountRow {
                asn: 300,
                is_ipv4: true,
                prefixes: 5
            }]
        );
    }

    #[tokio::test]
    async fn test_write_keeps_highest_repeats_per_key() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.expect("connect");

        conn.write_snapshots(&[snapshot(1, 100, 3, 7)]).await.expect("write");
        conn.write_snapshots(&[snapshot(1, 100, 1, 9)]).await.expect("write");
        assert_eq!(store.snapshots()[0].repeats, 3);

        conn.write_snapshots(&[snapshot(1, 100, 4, 7)]).await.expect("write");
        assert_eq!(store.snapshots()[0].repeats, 4);
        assert_eq!(store.bulk_writes(), 3);
    }

    #[tokio::test]
    async fn test_latest_snapshot_per_asn() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.expect("connect");
        conn.write_snapshots(&[
            snapshot(1, 100, 0, 1),
            snapshot(1, 200, 0, 2),
            snapshot(2, 150, 0, 3),
        ])
        .await
        .expect("write");

        let latest = conn.fetch_latest_snapshots().await.expect("fetch");
        let pairs: Vec<(u32, i64)> = latest.iter().map(|r| (r.asn, r.timestamp.timestamp())).collect();
        assert_eq!(pairs, vec![(1, 200), (2, 150)]);
    }

    #[tokio::test]
    async fn test_last_state_only_touches_recent_rows() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.expect("connect");
        conn.write_snapshots(&[snapshot(1, 100, 0, 1), snapshot(2, 1_000, 0, 2)])
            .await
            .expect("write");

        conn.refresh_last_state(ts(500)).await.expect("refresh");
        let last = store.last_state();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].asn, 2);
        assert_eq!(last[0].counts.origin_v4, 2);
        assert_eq!(last[0].timestamp, ts(1_000));
    }

    #[tokio::test]
    async fn test_dropped_query_leaves_no_phantom_in_flight() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_millis(50));
        let query = AggregationQuery::new(Pass::Origin, "q");
        let mut conn = store.connect().await.expect("connect");

        let timed_out =
            tokio::time::timeout(Duration::from_millis(1), conn.fetch_prefix_counts(&query, &[1]))
                .await;
        assert!(timed_out.is_err());

        store.set_latency(Duration::ZERO);
        conn.fetch_prefix_counts(&query, &[1]).await.expect("query");
        assert_eq!(store.peak_concurrent_queries(), 1);
    }

    #[tokio::test]
    async fn test_dropped_session_is_released() {
        let store = MemoryStore::new();
        let conn = store.connect().await.expect("connect");
        assert_eq!(store.open_connections(), 1);
        drop(conn);
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_injected_statement_failure() {
        let store = MemoryStore::new();
        store.fail_statement(Statement::WriteSnapshots, FailureKind::Query);
        let mut conn = store.connect().await.expect("connect");

        let err = conn
            .write_snapshots(&[snapshot(1, 100, 0, 1)])
            .await
            .expect_err("write fails");
        assert!(!err.is_connection());

        store.clear_failures();
        conn.write_snapshots(&[snapshot(1, 100, 0, 1)]).await.expect("write");
    }
}
