use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::export::health::PipelineMetrics;
use crate::store::{AggregationQuery, Connection, StoreError};

use super::merge::{Accumulator, Pass};
use super::partition::Batch;
use super::worker::{BatchOutcome, Worker, WorkerPool};

type InFlight<C> = JoinSet<Result<BatchOutcome<C>, StoreError>>;

/// Counters for one completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub batches: usize,
    pub failed_batches: usize,
    pub asns_queried: usize,
    pub records_returned: usize,
    /// Highest number of batches in flight at once.
    pub peak_in_flight: usize,
}

/// Dispatches batches to the pool and merges completed results.
///
/// At most `pool.size()` batches run concurrently. When every worker is busy
/// the scheduler waits for the next completion, merges it, and reuses the
/// freed worker. After the last batch it drains everything still in flight.
///
/// On a fatal error the remaining tasks are aborted and every worker that
/// survived is parked back in the pool before the error is returned.
pub async fn run_pass<C, I>(
    pool: &mut WorkerPool<C>,
    query: AggregationQuery,
    batches: I,
    acc: &mut Accumulator,
    metrics: &PipelineMetrics,
    cancel: &CancellationToken,
) -> Result<PassSummary>
where
    C: Connection,
    I: IntoIterator<Item = Batch>,
{
    let pass = query.pass;
    let query = Arc::new(query);
    let started = Instant::now();

    let mut idle = pool.take_all();
    let mut in_flight: InFlight<C> = JoinSet::new();
    let mut summary = PassSummary::default();

    let dispatched: Result<()> = async {
        for batch in batches {
            let worker = match idle.pop() {
                Some(worker) => worker,
                None => {
                    let outcome = next_completed(&mut in_flight, cancel).await?;
                    absorb(outcome, pass, acc, metrics, &mut summary)
                }
            };

            summary.batches += 1;
            summary.asns_queried += batch.len();
            metrics
                .batches_dispatched
                .with_label_values(&[pass.as_str()])
                .inc();

            in_flight.spawn(worker.run(Arc::clone(&query), batch));
            summary.peak_in_flight = summary.peak_in_flight.max(in_flight.len());
        }

        while !in_flight.is_empty() {
            let outcome = next_completed(&mut in_flight, cancel).await?;
            idle.push(absorb(outcome, pass, acc, metrics, &mut summary));
        }

        Ok(())
    }
    .await;

    if dispatched.is_err() {
        reclaim(&mut in_flight, &mut idle).await;
    }
    pool.restore(idle);
    dispatched?;

    let elapsed = started.elapsed();
    metrics
        .pass_duration
        .with_label_values(&[pass.as_str()])
        .set(elapsed.as_secs_f64());

    info!(
        pass = %pass,
        batches = summary.batches,
        failed_batches = summary.failed_batches,
        asns = summary.asns_queried,
        records = summary.records_returned,
        elapsed_ms = duration_ms(elapsed),
        "pass completed",
    );

    Ok(summary)
}

/// Aborts whatever is still running and keeps the workers of tasks that
/// had already finished cleanly. Their results are discarded.
async fn reclaim<C: Connection>(in_flight: &mut InFlight<C>, idle: &mut Vec<Worker<C>>) {
    in_flight.abort_all();

    while let Some(joined) = in_flight.join_next().await {
        if let Ok(Ok(outcome)) = joined {
            idle.push(outcome.worker);
        }
    }
}

/// Waits for the next in-flight batch.
///
/// A panicked task or a lost connection aborts the pass; dropping the
/// `JoinSet` on the way out aborts whatever is still running.
async fn next_completed<C: Connection>(
    in_flight: &mut InFlight<C>,
    cancel: &CancellationToken,
) -> Result<BatchOutcome<C>> {
    let joined = tokio::select! {
        _ = cancel.cancelled() => bail!("run cancelled with {} batches in flight", in_flight.len()),
        joined = in_flight.join_next() => joined,
    };

    let Some(joined) = joined else {
        bail!("no batch in flight to wait for");
    };

    let outcome = joined
        .context("batch task panicked")?
        .context("batch query lost its store connection")?;

    Ok(outcome)
}

/// Merges a completed batch and returns its worker for reuse.
fn absorb<C>(
    outcome: BatchOutcome<C>,
    pass: Pass,
    acc: &mut Accumulator,
    metrics: &PipelineMetrics,
    summary: &mut PassSummary,
) -> Worker<C> {
    let label = [pass.as_str()];

    metrics
        .batch_query_duration
        .with_label_values(&label)
        .observe(outcome.elapsed.as_secs_f64());

    if outcome.failed {
        summary.failed_batches += 1;
        metrics.batch_failures.with_label_values(&label).inc();
    } else {
        // The query ran, so ASNs without rows really have zero prefixes.
        acc.seed(outcome.asns.iter().copied());
        summary.records_returned += outcome.partial.len();
        acc.merge(pass, &outcome.partial);
    }

    outcome.worker
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
