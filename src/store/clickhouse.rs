use std::fmt::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clickhouse_rs::errors::Error as ChError;
use clickhouse_rs::types::{Block, Complex};
use clickhouse_rs::{ClientHandle, Pool};

use crate::config::{ClickHouseConfig, QueriesConfig};
use crate::pipeline::merge::PrefixCountRecord;
use crate::pipeline::snapshot::{ChangeRatios, SnapshotRow};

use super::{AggregationQuery, Connection, Connector, PrefixCountRow, StoreError};

const SNAPSHOT_COLUMNS: &str = "asn, is_transit, is_origin, \
     transit_v4_prefixes, transit_v6_prefixes, origin_v4_prefixes, origin_v6_prefixes, \
     transit_v4_change, transit_v6_change, origin_v4_change, origin_v6_change, \
     repeats, timestamp, updated_at";

/// Opens pooled ClickHouse sessions over the native TCP protocol.
pub struct ClickHouseConnector {
    pool: Pool,
    database: Arc<str>,
    distinct_asns: Arc<str>,
}

impl ClickHouseConnector {
    /// Creates a connector whose pool holds up to `pool_max` sessions.
    ///
    /// No connection is opened until the first `connect`.
    pub fn new(cfg: &ClickHouseConfig, queries: &QueriesConfig, pool_max: usize) -> Self {
        Self {
            pool: Pool::new(cfg.dsn(pool_max)),
            database: cfg.database.as_str().into(),
            distinct_asns: queries.distinct_asns.as_str().into(),
        }
    }

    /// Returns the underlying pool, shared with the migrator.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

impl Connector for ClickHouseConnector {
    type Conn = ClickHouseConnection;

    async fn connect(&self) -> Result<ClickHouseConnection, StoreError> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        handle
            .ping()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(ClickHouseConnection {
            handle,
            database: Arc::clone(&self.database),
            distinct_asns: Arc::clone(&self.distinct_asns),
        })
    }
}

/// One exclusive ClickHouse session.
pub struct ClickHouseConnection {
    handle: ClientHandle,
    database: Arc<str>,
    distinct_asns: Arc<str>,
}

impl ClickHouseConnection {
    async fn fetch(&mut self, sql: &str) -> Result<Block<Complex>, StoreError> {
        self.handle.query(sql).fetch_all().await.map_err(classify)
    }
}

impl Connection for ClickHouseConnection {
    async fn fetch_active_asns(&mut self) -> Result<Vec<u32>, StoreError> {
        let sql = Arc::clone(&self.distinct_asns);
        let block = self.fetch(&sql).await?;

        let mut asns = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            asns.push(row.get::<u32, _>("asn").map_err(classify)?);
        }

        Ok(asns)
    }

    async fn fetch_prefix_counts(
        &mut self,
        query: &AggregationQuery,
        asns: &[u32],
    ) -> Result<Vec<PrefixCountRow>, StoreError> {
        let sql = query.render(asns);
        let block = self.fetch(&sql).await?;

        let mut rows = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            rows.push(PrefixCountRow {
                asn: row.get::<u32, _>("asn").map_err(classify)?,
                is_ipv4: row.get::<u8, _>("is_ipv4").map_err(classify)? != 0,
                prefixes: row.get::<u64, _>("prefixes").map_err(classify)?,
            });
        }

        Ok(rows)
    }

    async fn fetch_latest_snapshots(&mut self) -> Result<Vec<SnapshotRow>, StoreError> {
        let sql = render_latest_snapshots_query(&self.database);
        let block = self.fetch(&sql).await?;

        let mut rows = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let timestamp = from_unix(row.get::<u32, _>("ts").map_err(classify)?)?;
            let updated_at = from_unix(row.get::<u32, _>("updated").map_err(classify)?)?;

            rows.push(SnapshotRow {
                asn: row.get::<u32, _>("asn").map_err(classify)?,
                counts: PrefixCountRecord {
                    origin_v4: row.get::<u64, _>("origin_v4_prefixes").map_err(classify)?,
                    origin_v6: row.get::<u64, _>("origin_v6_prefixes").map_err(classify)?,
                    transit_v4: row.get::<u64, _>("transit_v4_prefixes").map_err(classify)?,
                    transit_v6: row.get::<u64, _>("transit_v6_prefixes").map_err(classify)?,
                },
                change: ChangeRatios {
                    transit_v4: row.get::<f64, _>("transit_v4_change").map_err(classify)?,
                    transit_v6: row.get::<f64, _>("transit_v6_change").map_err(classify)?,
                    origin_v4: row.get::<f64, _>("origin_v4_change").map_err(classify)?,
                    origin_v6: row.get::<f64, _>("origin_v6_change").map_err(classify)?,
                },
                repeats: row.get::<u64, _>("repeats").map_err(classify)?,
                timestamp,
                updated_at,
            });
        }

        Ok(rows)
    }

    async fn write_snapshots(&mut self, rows: &[SnapshotRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let sql = render_snapshot_insert(&self.database, rows);
        self.handle.execute(sql.as_str()).await.map_err(classify)
    }

    async fn refresh_last_state(&mut self, since: DateTime<Utc>) -> Result<(), StoreError> {
        let sql = render_last_state_refresh(&self.database, since);
        self.handle.execute(sql.as_str()).await.map_err(classify)
    }

    async fn execute(&mut self, sql: &str) -> Result<(), StoreError> {
        self.handle.execute(sql).await.map_err(classify)
    }

    async fn close(self) {
        // Dropping the handle returns it to the pool.
        drop(self.handle);
    }
}

/// Maps a driver error onto the fatal/non-fatal split.
///
/// Server-side exceptions and column conversion failures are statement
/// errors; everything else means the session is unusable.
fn classify(err: ChError) -> StoreError {
    match &err {
        ChError::Server(_) | ChError::FromSql(_) => StoreError::Query(err.to_string()),
        _ => StoreError::Connection(err.to_string()),
    }
}

fn from_unix(secs: u32) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(i64::from(secs), 0)
        .ok_or_else(|| StoreError::Query(format!("timestamp {secs} out of range")))
}

/// Latest row per ASN, after replacing-merge deduplication.
pub fn render_latest_snapshots_query(database: &str) -> String {
    format!(
        "SELECT asn, \
         argMax(transit_v4_prefixes, timestamp) AS transit_v4_prefixes, \
         argMax(transit_v6_prefixes, timestamp) AS transit_v6_prefixes, \
         argMax(origin_v4_prefixes, timestamp) AS origin_v4_prefixes, \
         argMax(origin_v6_prefixes, timestamp) AS origin_v6_prefixes, \
         argMax(transit_v4_change, timestamp) AS transit_v4_change, \
         argMax(transit_v6_change, timestamp) AS transit_v6_change, \
         argMax(origin_v4_change, timestamp) AS origin_v4_change, \
         argMax(origin_v6_change, timestamp) AS origin_v6_change, \
         argMax(repeats, timestamp) AS repeats, \
         toUnixTimestamp(max(timestamp)) AS ts, \
         toUnixTimestamp(argMax(updated_at, timestamp)) AS updated \
         FROM {database}.gen_asn_stats FINAL \
         GROUP BY asn"
    )
}

/// One multi-row INSERT for every planned snapshot row.
pub fn render_snapshot_insert(database: &str, rows: &[SnapshotRow]) -> String {
    let table = format!("{database}.gen_asn_stats");
    let mut sql = String::with_capacity(64 + table.len() + SNAPSHOT_COLUMNS.len() + rows.len() * 160);
    let _ = write!(sql, "INSERT INTO {table} ({SNAPSHOT_COLUMNS}) VALUES ");

    for (idx, r) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let _ = write!(
            sql,
            "({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
            r.asn,
            u8::from(r.is_transit()),
            u8::from(r.is_origin()),
            r.counts.transit_v4,
            r.counts.transit_v6,
            r.counts.origin_v4,
            r.counts.origin_v6,
            r.change.transit_v4,
            r.change.transit_v6,
            r.change.origin_v4,
            r.change.origin_v6,
            r.repeats,
            format_datetime(r.timestamp),
            format_datetime(r.updated_at),
        );
    }

    sql
}

/// Rebuilds last-state rows from snapshots touched since `since`.
pub fn render_last_state_refresh(database: &str, since: DateTime<Utc>) -> String {
    format!(
        "INSERT INTO {database}.gen_asn_stats_last \
         (asn, is_transit, is_origin, transit_v4_prefixes, transit_v6_prefixes, \
         origin_v4_prefixes, origin_v6_prefixes, timestamp) \
         SELECT asn, \
         argMax(is_transit, timestamp), \
         argMax(is_origin, timestamp), \
         argMax(transit_v4_prefixes, timestamp), \
         argMax(transit_v6_prefixes, timestamp), \
         argMax(origin_v4_prefixes, timestamp), \
         argMax(origin_v6_prefixes, timestamp), \
         max(updated_at) \
         FROM {database}.gen_asn_stats FINAL \
         WHERE updated_at >= {} \
         GROUP BY asn",
        format_datetime(since),
    )
}

/// Statements that replace the active ASN table with the source's ASNs.
///
/// Rows are stamped with `seeded_at`; anything left with an older stamp
/// after the insert is deleted.
pub fn render_seed_statements(
    database: &str,
    seed_query: &str,
    seeded_at: DateTime<Utc>,
) -> Vec<String> {
    let ts = format_datetime(seeded_at);
    vec![
        format!(
            "INSERT INTO {database}.gen_active_asns (asn, seeded_at) \
             SELECT asn, {ts} FROM ({seed_query})"
        ),
        format!("ALTER TABLE {database}.gen_active_asns DELETE WHERE seeded_at < {ts}"),
    ]
}

/// Formats a timestamp as a quoted ClickHouse `DateTime` literal.
fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S"))
}
