use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::store::{Connection, StoreError};

use super::merge::{Accumulator, PrefixCountRecord};
use super::RunContext;

/// Relative change per metric against the previous snapshot.
///
/// Positive values are growth factors (`new / old`), negative values are
/// shrink factors (`-(old / new)`), 0 means unchanged or not comparable.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChangeRatios {
    pub transit_v4: f64,
    pub transit_v6: f64,
    pub origin_v4: f64,
    pub origin_v6: f64,
}

impl ChangeRatios {
    pub fn between(old: &PrefixCountRecord, new: &PrefixCountRecord) -> Self {
        Self {
            transit_v4: change_ratio(old.transit_v4, new.transit_v4),
            transit_v6: change_ratio(old.transit_v6, new.transit_v6),
            origin_v4: change_ratio(old.origin_v4, new.origin_v4),
            origin_v6: change_ratio(old.origin_v6, new.origin_v6),
        }
    }
}

/// One persisted, timestamped set of counts for an ASN.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub asn: u32,
    pub counts: PrefixCountRecord,
    pub change: ChangeRatios,
    /// Number of later runs that observed identical counts.
    pub repeats: u64,
    pub timestamp: DateTime<Utc>,
    /// Timestamp of the last run that inserted or repeated this row.
    pub updated_at: DateTime<Utc>,
}

impl SnapshotRow {
    pub fn is_origin(&self) -> bool {
        self.counts.is_origin()
    }

    pub fn is_transit(&self) -> bool {
        self.counts.is_transit()
    }
}

/// The most recent counts of one ASN, without ratios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastStateRow {
    pub asn: u32,
    pub counts: PrefixCountRecord,
    pub timestamp: DateTime<Utc>,
}

/// Change ratio from `old` to `new`, rounded to 5 decimals.
pub fn change_ratio(old: u64, new: u64) -> f64 {
    if old == 0 || new == 0 || old == new {
        return 0.0;
    }

    let (old, new) = (old as f64, new as f64);
    let ratio = if new > old { new / old } else { -(old / new) };

    (ratio * 1e5).round() / 1e5
}

/// What a run does with one ASN's snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotAction {
    /// Counts changed (or first sighting): new row at the run timestamp.
    Insert,
    /// Counts identical to the prior row: bump its `repeats`.
    Repeat,
    /// The prior row already belongs to this run.
    Unchanged,
}

impl SnapshotAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "inserted",
            Self::Repeat => "repeated",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Decides the action for one ASN and builds the row to write, if any.
pub fn plan_row(
    asn: u32,
    counts: &PrefixCountRecord,
    prior: Option<&SnapshotRow>,
    run_ts: DateTime<Utc>,
) -> (SnapshotAction, Option<SnapshotRow>) {
    let Some(prior) = prior else {
        return (
            SnapshotAction::Insert,
            Some(SnapshotRow {
                asn,
                counts: *counts,
                change: ChangeRatios::default(),
                repeats: 0,
                timestamp: run_ts,
                updated_at: run_ts,
            }),
        );
    };

    if prior.timestamp == run_ts {
        return (SnapshotAction::Unchanged, None);
    }

    if prior.counts == *counts {
        return (
            SnapshotAction::Repeat,
            Some(SnapshotRow {
                repeats: prior.repeats + 1,
                updated_at: run_ts,
                ..prior.clone()
            }),
        );
    }

    (
        SnapshotAction::Insert,
        Some(SnapshotRow {
            asn,
            counts: *counts,
            change: ChangeRatios::between(&prior.counts, counts),
            repeats: 0,
            timestamp: run_ts,
            updated_at: run_ts,
        }),
    )
}

/// Rows to write for one run, in ascending ASN order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotPlan {
    pub rows: Vec<SnapshotRow>,
    pub inserted: usize,
    pub repeated: usize,
    pub unchanged: usize,
}

impl SnapshotPlan {
    fn count(&mut self, action: SnapshotAction) {
        match action {
            SnapshotAction::Insert => self.inserted += 1,
            SnapshotAction::Repeat => self.repeated += 1,
            SnapshotAction::Unchanged => self.unchanged += 1,
        }
    }
}

/// Plans every record of the accumulator against the prior snapshots.
pub fn plan(
    acc: &Accumulator,
    priors: &HashMap<u32, SnapshotRow>,
    run_ts: DateTime<Utc>,
) -> SnapshotPlan {
    let mut out = SnapshotPlan::default();

    for (asn, counts) in acc.iter() {
        let (action, row) = plan_row(asn, counts, priors.get(&asn), run_ts);
        out.count(action);
        out.rows.extend(row);
    }

    out
}

/// Keeps the newest row per ASN.
fn latest_by_asn(rows: Vec<SnapshotRow>) -> HashMap<u32, SnapshotRow> {
    let mut latest: HashMap<u32, SnapshotRow> = HashMap::with_capacity(rows.len());

    for row in rows {
        match latest.get(&row.asn) {
            Some(existing) if existing.timestamp >= row.timestamp => {}
            _ => {
                latest.insert(row.asn, row);
            }
        }
    }

    latest
}

/// Outcome of the snapshot stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub inserted: usize,
    pub repeated: usize,
    pub unchanged: usize,
    /// True when the bulk statement was sent and accepted.
    pub written: bool,
    pub last_state_refreshed: bool,
}

/// Persists the accumulator as snapshot rows and refreshes the last state.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotWriter {
    last_state_window: Duration,
}

impl SnapshotWriter {
    pub fn new(last_state_window: Duration) -> Self {
        Self { last_state_window }
    }

    /// Runs the snapshot stage over `conn`.
    ///
    /// Statement failures are logged and counted; only a lost connection is
    /// returned as an error. An empty accumulator writes nothing.
    pub async fn write<C: Connection>(
        &self,
        conn: &mut C,
        acc: &Accumulator,
        ctx: &RunContext,
    ) -> Result<SnapshotSummary> {
        let mut summary = SnapshotSummary::default();

        if acc.is_empty() {
            info!("no records, skipping snapshot write");
            return Ok(summary);
        }

        let since = self.last_state_since(ctx.timestamp)?;

        if let Some(plan) = self.plan_against_store(conn, acc, ctx).await? {
            summary.inserted = plan.inserted;
            summary.repeated = plan.repeated;
            summary.unchanged = plan.unchanged;
            summary.written = self.write_plan(conn, &plan, ctx).await?;
        }

        summary.last_state_refreshed = self.refresh_last_state(conn, since, ctx).await?;

        info!(
            inserted = summary.inserted,
            repeated = summary.repeated,
            unchanged = summary.unchanged,
            written = summary.written,
            last_state = summary.last_state_refreshed,
            "snapshot stage completed",
        );

        Ok(summary)
    }

    async fn plan_against_store<C: Connection>(
        &self,
        conn: &mut C,
        acc: &Accumulator,
        ctx: &RunContext,
    ) -> Result<Option<SnapshotPlan>> {
        let priors = match conn.fetch_latest_snapshots().await {
            Ok(rows) => latest_by_asn(rows),
            Err(e) => {
                soft_failure(e, "fetch_prior", ctx).context("fetching prior snapshots")?;
                return Ok(None);
            }
        };

        let plan = plan(acc, &priors, ctx.timestamp);

        for (action, n) in [
            (SnapshotAction::Insert, plan.inserted),
            (SnapshotAction::Repeat, plan.repeated),
            (SnapshotAction::Unchanged, plan.unchanged),
        ] {
            ctx.metrics
                .snapshot_rows
                .with_label_values(&[action.as_str()])
                .inc_by(n as u64);
        }

        Ok(Some(plan))
    }

    async fn write_plan<C: Connection>(
        &self,
        conn: &mut C,
        plan: &SnapshotPlan,
        ctx: &RunContext,
    ) -> Result<bool> {
        if plan.rows.is_empty() {
            debug!("every snapshot already written by this run");
            return Ok(false);
        }

        match conn.write_snapshots(&plan.rows).await {
            Ok(()) => Ok(true),
            Err(e) => {
                soft_failure(e, "bulk_write", ctx).context("writing snapshots")?;
                Ok(false)
            }
        }
    }

    /// Start of the trailing last-state window ending at `run_ts`.
    fn last_state_since(&self, run_ts: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let window = chrono::Duration::from_std(self.last_state_window)
            .context("converting last state window")?;

        run_ts.checked_sub_signed(window).with_context(|| {
            format!(
                "last state window of {}s reaches before the earliest representable time",
                self.last_state_window.as_secs()
            )
        })
    }

    async fn refresh_last_state<C: Connection>(
        &self,
        conn: &mut C,
        since: DateTime<Utc>,
        ctx: &RunContext,
    ) -> Result<bool> {
        match conn.refresh_last_state(since).await {
            Ok(()) => Ok(true),
            Err(e) => {
                soft_failure(e, "last_state", ctx).context("refreshing last state")?;
                Ok(false)
            }
        }
    }
}

/// Logs and counts a statement failure; a connection failure is passed back.
fn soft_failure(e: StoreError, stage: &str, ctx: &RunContext) -> Result<(), StoreError> {
    if e.is_connection() {
        return Err(e);
    }

    warn!(stage, error = %e, "snapshot statement failed");
    ctx.metrics
        .snapshot_write_errors
        .with_label_values(&[stage])
        .inc();

    Ok(())
}
