pub mod clickhouse;
pub mod memory;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::pipeline::merge::Pass;
use crate::pipeline::snapshot::SnapshotRow;

/// Errors surfaced by a backing store.
///
/// The split matters to callers: a failed statement is logged and skipped,
/// while a lost connection aborts the run.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// Returns true if the error means the store is unreachable.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// One row of a grouped prefix-count query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixCountRow {
    pub asn: u32,
    pub is_ipv4: bool,
    pub prefixes: u64,
}

/// An aggregation query for one pass.
///
/// `template` carries an `{asn_list}` placeholder substituted per batch.
#[derive(Debug, Clone)]
pub struct AggregationQuery {
    pub pass: Pass,
    pub template: Arc<str>,
}

impl AggregationQuery {
    pub const ASN_LIST_PLACEHOLDER: &'static str = "{asn_list}";

    pub fn new(pass: Pass, template: impl Into<Arc<str>>) -> Self {
        Self {
            pass,
            template: template.into(),
        }
    }

    /// Substitutes the batch's ASN list into the template.
    pub fn render(&self, asns: &[u32]) -> String {
        self.template
            .replace(Self::ASN_LIST_PLACEHOLDER, &crate::asn::join_list(asns))
    }
}

/// Opens store sessions.
pub trait Connector: Send + Sync {
    type Conn: Connection;

    /// Opens one exclusive session.
    fn connect(&self) -> impl Future<Output = Result<Self::Conn, StoreError>> + Send;
}

/// An exclusive store session.
///
/// Sessions are never shared between tasks; each worker owns one.
pub trait Connection: Send + 'static {
    /// Returns the ASN universe to aggregate, in store order.
    fn fetch_active_asns(&mut self) -> impl Future<Output = Result<Vec<u32>, StoreError>> + Send;

    /// Runs one grouped prefix-count query for a batch of ASNs.
    fn fetch_prefix_counts(
        &mut self,
        query: &AggregationQuery,
        asns: &[u32],
    ) -> impl Future<Output = Result<Vec<PrefixCountRow>, StoreError>> + Send;

    /// Returns the most recent snapshot row of every ASN.
    fn fetch_latest_snapshots(
        &mut self,
    ) -> impl Future<Output = Result<Vec<SnapshotRow>, StoreError>> + Send;

    /// Writes all rows in one bulk statement.
    ///
    /// A row whose `(asn, timestamp)` already exists replaces it when its
    /// `repeats` is higher.
    fn write_snapshots(
        &mut self,
        rows: &[SnapshotRow],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Replaces the last-state row of every ASN touched at or after `since`.
    fn refresh_last_state(
        &mut self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Executes a statement that returns no rows.
    fn execute(&mut self, sql: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Releases the session.
    fn close(self) -> impl Future<Output = ()> + Send;
}
