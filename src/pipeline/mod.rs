pub mod merge;
pub mod partition;
pub mod scheduler;
pub mod snapshot;
pub mod worker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::asn::is_reserved;
use crate::config::Config;
use crate::export::health::PipelineMetrics;
use crate::store::{AggregationQuery, Connection, Connector};

use self::merge::{Accumulator, Pass};
use self::partition::Partitioner;
use self::scheduler::{run_pass, PassSummary};
use self::snapshot::{SnapshotSummary, SnapshotWriter};
use self::worker::WorkerPool;

/// State shared by every stage of one invocation.
#[derive(Clone)]
pub struct RunContext {
    /// Captured once; every row of the run carries it.
    pub timestamp: DateTime<Utc>,
    pub metrics: Arc<PipelineMetrics>,
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Creates a context stamped with the current time, truncated to seconds.
    pub fn new(metrics: Arc<PipelineMetrics>, cancel: CancellationToken) -> Self {
        Self::at(Utc::now().trunc_subsecs(0), metrics, cancel)
    }

    pub fn at(
        timestamp: DateTime<Utc>,
        metrics: Arc<PipelineMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            timestamp,
            metrics,
            cancel,
        }
    }
}

/// Tunables for one run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workers: usize,
    pub origin_batch_size: usize,
    pub transit_batch_size: usize,
    pub last_state_window: Duration,
    pub origin_query: String,
    pub transit_query: String,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            workers: cfg.pipeline.workers,
            origin_batch_size: cfg.pipeline.origin_batch_size,
            transit_batch_size: cfg.pipeline.transit_batch_size,
            last_state_window: cfg.pipeline.last_state_window,
            origin_query: cfg.queries.origin_prefixes.clone(),
            transit_query: cfg.queries.transit_prefixes.clone(),
        }
    }

    fn batch_size(&self, pass: Pass) -> usize {
        match pass {
            Pass::Origin => self.origin_batch_size,
            Pass::Transit => self.transit_batch_size,
        }
    }

    fn query(&self, pass: Pass) -> AggregationQuery {
        match pass {
            Pass::Origin => AggregationQuery::new(pass, self.origin_query.as_str()),
            Pass::Transit => AggregationQuery::new(pass, self.transit_query.as_str()),
        }
    }
}

/// Counters for one completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Non-reserved ASNs in the universe.
    pub asns: usize,
    pub origin: PassSummary,
    pub transit: PassSummary,
    /// Records in the accumulator after both passes.
    pub records: usize,
    pub snapshot: SnapshotSummary,
}

/// One aggregation run: fetch the universe, run both passes, write snapshots.
pub struct Pipeline<K> {
    connector: K,
    settings: PipelineSettings,
}

impl<K: Connector> Pipeline<K> {
    pub fn new(connector: K, settings: PipelineSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// Runs the pipeline once.
    ///
    /// A control session fetches the universe and writes the snapshots; the
    /// worker pool holds `workers` further sessions for the passes.
    pub async fn run(&self, ctx: &RunContext) -> Result<RunSummary> {
        let started = Instant::now();
        ctx.metrics.run_timestamp.set(ctx.timestamp.timestamp() as f64);

        info!(timestamp = %ctx.timestamp, workers = self.settings.workers, "run started");

        let mut control = self
            .connector
            .connect()
            .await
            .context("opening control session")?;

        let result = self.run_with(&mut control, ctx).await;
        control.close().await;

        let elapsed = started.elapsed();
        ctx.metrics.run_duration.set(elapsed.as_secs_f64());

        let summary = result?;
        info!(
            asns = summary.asns,
            records = summary.records,
            inserted = summary.snapshot.inserted,
            repeated = summary.snapshot.repeated,
            failed_batches = summary.origin.failed_batches + summary.transit.failed_batches,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "run completed",
        );

        Ok(summary)
    }

    async fn run_with(&self, control: &mut K::Conn, ctx: &RunContext) -> Result<RunSummary> {
        let universe = control
            .fetch_active_asns()
            .await
            .context("fetching active ASNs")?;

        let asns = universe.iter().filter(|asn| !is_reserved(**asn)).count();
        ctx.metrics.asns_total.set(asns as i64);
        info!(total = universe.len(), asns, "fetched active ASNs");

        let mut acc = Accumulator::new();

        let mut pool = WorkerPool::open(&self.connector, self.settings.workers)
            .await
            .context("opening worker pool")?;

        let passes = self.run_passes(&mut pool, &universe, &mut acc, ctx).await;
        pool.close().await;
        let (origin, transit) = passes?;

        ctx.metrics.records_merged.set(acc.len() as i64);
        info!(records = acc.len(), "passes merged");

        if ctx.cancel.is_cancelled() {
            bail!("run cancelled before snapshot write");
        }

        let snapshot = SnapshotWriter::new(self.settings.last_state_window)
            .write(control, &acc, ctx)
            .await?;

        Ok(RunSummary {
            asns,
            origin,
            transit,
            records: acc.len(),
            snapshot,
        })
    }

    async fn run_passes(
        &self,
        pool: &mut WorkerPool<K::Conn>,
        universe: &[u32],
        acc: &mut Accumulator,
        ctx: &RunContext,
    ) -> Result<(PassSummary, PassSummary)> {
        let mut summaries = [PassSummary::default(); 2];

        for (slot, pass) in summaries.iter_mut().zip(Pass::ALL) {
            let batches = Partitioner::new(self.settings.batch_size(pass)).batches(universe);
            *slot = run_pass(
                pool,
                self.settings.query(pass),
                batches,
                acc,
                &ctx.metrics,
                &ctx.cancel,
            )
            .await
            .with_context(|| format!("running {pass} pass"))?;
        }

        let [origin, transit] = summaries;
        Ok((origin, transit))
    }
}

/// Replaces the active ASN table by running `statements` in order.
///
/// Any failed statement aborts the seed.
pub async fn seed_active_asns<K: Connector>(connector: &K, statements: &[String]) -> Result<()> {
    let mut conn = connector
        .connect()
        .await
        .context("opening session for active ASN seed")?;

    let mut result = Ok(());
    for (idx, sql) in statements.iter().enumerate() {
        if let Err(e) = conn.execute(sql).await {
            result = Err(e).with_context(|| format!("executing seed statement {}", idx + 1));
            break;
        }
    }
    conn.close().await;
    result?;

    info!(statements = statements.len(), "active ASNs seeded");

    Ok(())
}
