use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::store::{AggregationQuery, Connection, Connector, PrefixCountRow, StoreError};

use super::partition::Batch;

/// Per-ASN counts returned by one batch query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialCount {
    pub asn: u32,
    pub v4: u64,
    pub v6: u64,
}

/// Result of one batch, handed back together with the worker that ran it.
pub struct BatchOutcome<C> {
    pub worker: Worker<C>,
    pub batch_index: usize,
    /// ASNs the batch queried, whether or not any rows came back.
    pub asns: Vec<u32>,
    pub partial: Vec<PartialCount>,
    /// True when the query failed and `partial` is empty because of it.
    pub failed: bool,
    pub elapsed: Duration,
}

/// A pool slot owning one exclusive store connection.
pub struct Worker<C> {
    id: usize,
    conn: C,
}

impl<C: Connection> Worker<C> {
    pub fn new(id: usize, conn: C) -> Self {
        Self { id, conn }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Runs one grouped query for `batch`.
    ///
    /// Statement failures are logged and produce an empty result. Only a
    /// connection-level failure is returned as an error.
    pub async fn run(
        mut self,
        query: Arc<AggregationQuery>,
        batch: Batch,
    ) -> Result<BatchOutcome<C>, StoreError> {
        let started = Instant::now();
        let result = self.conn.fetch_prefix_counts(&query, &batch.asns).await;
        let elapsed = started.elapsed();

        let (partial, failed) = match result {
            Ok(rows) => {
                let partial = fold_rows(&rows);
                debug!(
                    worker = self.id,
                    pass = %query.pass,
                    batch = batch.index,
                    asns = batch.len(),
                    rows = rows.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "batch query completed",
                );
                (partial, false)
            }
            Err(e) if e.is_connection() => {
                self.conn.close().await;
                return Err(e);
            }
            Err(e) => {
                warn!(
                    worker = self.id,
                    pass = %query.pass,
                    batch = batch.index,
                    asn_list = %batch.asn_list(),
                    error = %e,
                    "batch query failed, skipping batch",
                );
                (Vec::new(), true)
            }
        };

        Ok(BatchOutcome {
            worker: self,
            batch_index: batch.index,
            asns: batch.asns,
            partial,
            failed,
            elapsed,
        })
    }

    async fn close(self) {
        self.conn.close().await;
    }
}

/// Collapses `(asn, ip_version, count)` rows into one `(asn, v4, v6)` per ASN.
///
/// An IP version missing from the rows counts as 0.
pub fn fold_rows(rows: &[PrefixCountRow]) -> Vec<PartialCount> {
    let mut by_asn: BTreeMap<u32, (u64, u64)> = BTreeMap::new();

    for row in rows {
        let entry = by_asn.entry(row.asn).or_insert((0, 0));
        if row.is_ipv4 {
            entry.0 = row.prefixes;
        } else {
            entry.1 = row.prefixes;
        }
    }

    by_asn
        .into_iter()
        .map(|(asn, (v4, v6))| PartialCount { asn, v4, v6 })
        .collect()
}

/// Fixed set of workers, opened once and reused for every pass.
pub struct WorkerPool<C> {
    idle: Vec<Worker<C>>,
    size: usize,
}

impl<C: Connection> WorkerPool<C> {
    /// Opens `size` connections up front. Any connect failure is returned.
    pub async fn open<K>(connector: &K, size: usize) -> Result<Self, StoreError>
    where
        K: Connector<Conn = C>,
    {
        let size = size.max(1);
        let mut idle = Vec::with_capacity(size);

        for id in 0..size {
            match connector.connect().await {
                Ok(conn) => idle.push(Worker::new(id, conn)),
                Err(e) => {
                    for worker in idle {
                        worker.close().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(workers = size, "worker pool opened");

        Ok(Self { idle, size })
    }

    /// Number of workers the pool was opened with.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently parked in the pool.
    pub fn available(&self) -> usize {
        self.idle.len()
    }

    /// Takes every parked worker out of the pool.
    pub(crate) fn take_all(&mut self) -> Vec<Worker<C>> {
        std::mem::take(&mut self.idle)
    }

    /// Parks workers back into the pool.
    pub(crate) fn restore(&mut self, workers: Vec<Worker<C>>) {
        self.idle.extend(workers);
    }

    /// Closes every parked connection.
    pub async fn close(mut self) {
        let workers = self.take_all();
        let closed = workers.len();
        for worker in workers {
            worker.close().await;
        }
        if closed < self.size {
            warn!(closed, size = self.size, "worker pool closed with missing workers");
        } else {
            info!(closed, "worker pool closed");
        }
    }
}
