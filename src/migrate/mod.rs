use std::future::Future;

use anyhow::{bail, Context, Result};
use clickhouse_rs::{ClientHandle, Pool};
use tracing::info;

/// Embedded schema step with its forward and rollback SQL.
struct Migration {
    version: u32,
    name: &'static str,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "init",
        up_sql: include_str!("sql/001_init.up.sql"),
        down_sql: include_str!("sql/001_init.down.sql"),
    },
    Migration {
        version: 2,
        name: "last_state",
        up_sql: include_str!("sql/002_last_state.up.sql"),
        down_sql: include_str!("sql/002_last_state.down.sql"),
    },
];

/// Highest embedded migration version.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Applied schema version as recorded in `schema_migrations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: u32,
    /// Set while a migration is half-applied.
    pub dirty: bool,
}

impl MigrationStatus {
    pub fn pending(&self) -> usize {
        MIGRATIONS
            .iter()
            .filter(|m| m.version > self.version)
            .count()
    }
}

/// Schema migration control for the generated tables.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl Future<Output = Result<MigrationStatus>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl Future<Output = Result<MigrationStatus>> + Send;

    /// Returns the applied version and dirty flag.
    fn status(&self) -> impl Future<Output = Result<MigrationStatus>> + Send;
}

/// Runs migrations over a ClickHouse pool.
///
/// Keeps the golang-migrate `schema_migrations` layout so the tables can be
/// managed by either tool.
pub struct ClickHouseMigrator {
    pool: Pool,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn handle(&self) -> Result<ClientHandle> {
        self.pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migrations")
    }

    async fn ensure_migrations_table(handle: &mut ClientHandle) -> Result<()> {
        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog",
            )
            .await
            .context("creating schema_migrations table")
    }

    async fn current(handle: &mut ClientHandle) -> Result<MigrationStatus> {
        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying migration version")?;

        let Some(row) = block.rows().next() else {
            return Ok(MigrationStatus {
                version: 0,
                dirty: false,
            });
        };

        let version: i64 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty flag")?;

        Ok(MigrationStatus {
            version: u32::try_from(version).context("migration version out of range")?,
            dirty: dirty != 0,
        })
    }

    /// Records `version`; version 0 clears the tracking table.
    async fn record(handle: &mut ClientHandle, version: u32, dirty: bool) -> Result<()> {
        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        if version == 0 {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {}, 1)",
            u8::from(dirty)
        );
        handle
            .execute(sql.as_str())
            .await
            .context("inserting migration version")
    }

    async fn apply(handle: &mut ClientHandle, m: &Migration, sql: &str, target: u32) -> Result<()> {
        Self::record(handle, m.version, true).await?;

        for statement in split_statements(sql) {
            handle.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("migration {} ({}): {preview}...", m.version, m.name)
            })?;
        }

        Self::record(handle, target, false).await
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<MigrationStatus> {
        let mut handle = self.handle().await?;
        Self::ensure_migrations_table(&mut handle).await?;

        let status = Self::current(&mut handle).await?;
        if status.dirty {
            bail!(
                "migration version {} is dirty, manual intervention required",
                status.version
            );
        }

        let pending: Vec<&Migration> = MIGRATIONS
            .iter()
            .filter(|m| m.version > status.version)
            .collect();

        if pending.is_empty() {
            info!(version = status.version, "schema up to date");
            return Ok(status);
        }

        for m in &pending {
            info!(version = m.version, name = m.name, "applying migration");
            Self::apply(&mut handle, m, m.up_sql, m.version).await?;
        }

        let status = Self::current(&mut handle).await?;
        info!(version = status.version, applied = pending.len(), "migrations completed");

        Ok(status)
    }

    async fn down(&self) -> Result<MigrationStatus> {
        let mut handle = self.handle().await?;
        Self::ensure_migrations_table(&mut handle).await?;

        let status = Self::current(&mut handle).await?;
        if status.version == 0 {
            info!("no migrations to roll back");
            return Ok(status);
        }

        let m = MIGRATIONS
            .iter()
            .find(|m| m.version == status.version)
            .with_context(|| format!("migration version {} not found", status.version))?;

        let previous = MIGRATIONS
            .iter()
            .map(|m| m.version)
            .filter(|v| *v < status.version)
            .max()
            .unwrap_or(0);

        info!(version = m.version, name = m.name, "rolling back migration");
        Self::apply(&mut handle, m, m.down_sql, previous).await?;
        info!(version = previous, "rollback completed");

        Self::current(&mut handle).await
    }

    async fn status(&self) -> Result<MigrationStatus> {
        let mut handle = self.handle().await?;
        Self::ensure_migrations_table(&mut handle).await?;
        Self::current(&mut handle).await
    }
}

/// Splits SQL text into statements on semicolons, dropping `--` comment lines.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| s.lines().any(|l| !l.trim().is_empty() && !l.trim_start().starts_with("--")))
        .collect()
}
