use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::store::AggregationQuery;

/// Longest accepted last-state window.
pub const MAX_LAST_STATE_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Top-level configuration for asnstats.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Pool size, batch sizes and snapshot window.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Source queries run against the store.
    #[serde(default)]
    pub queries: QueriesConfig,

    /// Prometheus metrics output configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Database holding the source and generated tables. Default: "openbmp".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Use LZ4 block compression. Default: true.
    #[serde(default = "default_true")]
    pub compression: bool,
}

/// Aggregation pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Number of parallel workers, each with its own connection. Default: 20.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// ASNs per origin query. Default: 10.
    #[serde(default = "default_batch_size")]
    pub origin_batch_size: usize,

    /// ASNs per transit query. Default: 10.
    #[serde(default = "default_batch_size")]
    pub transit_batch_size: usize,

    /// Snapshots touched within this window feed the last-state table. Default: 8m.
    #[serde(default = "default_last_state_window", with = "humantime_serde")]
    pub last_state_window: Duration,
}

/// Source queries. Prefix queries must contain `{asn_list}`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueriesConfig {
    /// Returns the ASN universe as column `asn`.
    #[serde(default = "default_distinct_asns_query")]
    pub distinct_asns: String,

    /// Returns every ASN seen in the source tables as column `asn`; used by `init`.
    #[serde(default = "default_seed_active_asns_query")]
    pub seed_active_asns: String,

    /// Origin prefix counts as `(asn, is_ipv4, prefixes)`.
    #[serde(default = "default_origin_prefixes_query")]
    pub origin_prefixes: String,

    /// Transit prefix counts as `(asn, is_ipv4, prefixes)`.
    #[serde(default = "default_transit_prefixes_query")]
    pub transit_prefixes: String,
}

/// Prometheus metrics output configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Serve /metrics and /healthz on this address while running (e.g. ":9090").
    #[serde(default)]
    pub addr: String,

    /// Write a node-exporter textfile here when the command finishes.
    #[serde(default)]
    pub textfile: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database() -> String {
    "openbmp".to_string()
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    20
}

fn default_batch_size() -> usize {
    10
}

fn default_last_state_window() -> Duration {
    Duration::from_secs(8 * 60)
}

fn default_distinct_asns_query() -> String {
    "SELECT asn FROM gen_active_asns FINAL".to_string()
}

fn default_seed_active_asns_query() -> String {
    "SELECT DISTINCT asn FROM as_path_analysis WHERE is_withdrawn = 0".to_string()
}

fn default_origin_prefixes_query() -> String {
    "SELECT origin_as AS asn, is_ipv4, uniqExact(prefix, prefix_len) AS prefixes \
     FROM rib \
     WHERE origin_as IN ({asn_list}) \
     AND (is_withdrawn = 0 OR timestamp >= now() - INTERVAL 30 MINUTE) \
     GROUP BY asn, is_ipv4"
        .to_string()
}

fn default_transit_prefixes_query() -> String {
    "SELECT asn, is_ipv4, uniqExact(prefix, prefix_len) AS prefixes \
     FROM as_path_analysis \
     WHERE asn IN ({asn_list}) AND asn_left != 0 AND asn_right != 0 \
     AND (is_withdrawn = 0 OR timestamp >= now() - INTERVAL 30 MINUTE) \
     GROUP BY asn, is_ipv4"
        .to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            clickhouse: ClickHouseConfig::default(),
            pipeline: PipelineConfig::default(),
            queries: QueriesConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            compression: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            origin_batch_size: default_batch_size(),
            transit_batch_size: default_batch_size(),
            last_state_window: default_last_state_window(),
        }
    }
}

impl Default for QueriesConfig {
    fn default() -> Self {
        Self {
            distinct_asns: default_distinct_asns_query(),
            seed_active_asns: default_seed_active_asns_query(),
            origin_prefixes: default_origin_prefixes_query(),
            transit_prefixes: default_transit_prefixes_query(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.clickhouse.endpoint.is_empty() {
            bail!("clickhouse.endpoint is required");
        }

        if self.clickhouse.database.is_empty() {
            bail!("clickhouse.database is required");
        }

        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be positive");
        }

        if self.pipeline.origin_batch_size == 0 {
            bail!("pipeline.origin_batch_size must be positive");
        }

        if self.pipeline.transit_batch_size == 0 {
            bail!("pipeline.transit_batch_size must be positive");
        }

        if self.pipeline.last_state_window.is_zero() {
            bail!("pipeline.last_state_window must be positive");
        }

        if self.pipeline.last_state_window > MAX_LAST_STATE_WINDOW {
            bail!(
                "pipeline.last_state_window must not exceed {}",
                humantime_serde::re::humantime::format_duration(MAX_LAST_STATE_WINDOW)
            );
        }

        for (key, query) in [
            ("queries.distinct_asns", &self.queries.distinct_asns),
            ("queries.seed_active_asns", &self.queries.seed_active_asns),
        ] {
            if query.trim().is_empty() {
                bail!("{key} is required");
            }
        }

        for (key, query) in [
            ("queries.origin_prefixes", &self.queries.origin_prefixes),
            ("queries.transit_prefixes", &self.queries.transit_prefixes),
        ] {
            if !query.contains(AggregationQuery::ASN_LIST_PLACEHOLDER) {
                bail!(
                    "{key} must contain the {} placeholder",
                    AggregationQuery::ASN_LIST_PLACEHOLDER
                );
            }
        }

        Ok(())
    }
}

impl ClickHouseConfig {
    /// Builds a clickhouse-rs compatible TCP DSN.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    pub fn dsn(&self, pool_max: usize) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.username.is_empty() {
            dsn.push_str(&self.username);
            if !self.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.endpoint);
        dsn.push('/');
        dsn.push_str(&self.database);

        let compression = if self.compression { "lz4" } else { "none" };
        let pool_max = pool_max.max(1);
        dsn.push_str(&format!(
            "?compression={compression}&pool_min=1&pool_max={pool_max}"
        ));

        dsn
    }
}
