use libsql::params;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Instrument, Span, debug, info, warn};

use super::error::DbError;
use super::models::{NewTarget, Target, TargetDescriptor, UrlId};
use super::runner::{Outcome, StatementRunner};
use super::schema::Tables;
use crate::pool::LibsqlPool;
use crate::validation::validate_target;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid target: {0}")]
    Invalid(String),
    #[error(transparent)]
    Storage(#[from] DbError),
}

/// Enabled targets keyed by `url_id`
pub type EnabledTargets = HashMap<UrlId, TargetDescriptor>;

/// Access to the monitored endpoint definitions.
pub struct TargetRegistry {
    tables: Tables,
    pool: LibsqlPool,
    runner: Arc<dyn StatementRunner>,
    span: Span,
}

impl TargetRegistry {
    pub fn new(tables: Tables, pool: LibsqlPool, runner: Arc<dyn StatementRunner>, span: Span) -> Self {
        Self { tables, pool, runner, span }
    }

    /// Statements that insert each of `defaults` unless an identical row is
    /// already present.
    pub fn seed_statements(&self, defaults: &[NewTarget]) -> Vec<String> {
        let table = &self.tables.targets;
        defaults
            .iter()
            .map(|target| {
                let enabled = if target.is_enabled { "TRUE" } else { "FALSE" };
                let frequency = target.sample_frequency_s;
                let url = sql_literal(&target.url_path);
                let pattern = target.regex_pattern.as_deref().map_or_else(|| "NULL".to_string(), sql_literal);
                format!(
                    "INSERT INTO {table} (is_enabled, sample_frequency_s, url_path, regex_pattern) \
                     SELECT {enabled}, {frequency}, {url}, {pattern} \
                     WHERE NOT EXISTS (SELECT 1 FROM {table} \
                     WHERE is_enabled = {enabled} AND sample_frequency_s = {frequency} \
                     AND url_path = {url} AND regex_pattern IS {pattern})"
                )
            })
            .collect()
    }

    /// Insert the bootstrap rows. Seeding twice leaves a single copy of each.
    pub async fn seed(&self, defaults: &[NewTarget]) -> Outcome {
        let outcome = self.runner.run(self.seed_statements(defaults)).await;
        match &outcome {
            Outcome::Planned(statements) => {
                info!(parent: &self.span, count = statements.len(), "Planned seed statements")
            }
            Outcome::Applied => info!(parent: &self.span, rows = defaults.len(), "Registry seeded"),
            Outcome::Failed(kind) => warn!(parent: &self.span, %kind, "Seeding the registry failed"),
        }
        outcome
    }

    /// Targets that should be probed this round.
    ///
    /// A backend failure is logged and yields an empty map; callers treat that
    /// as nothing to probe rather than as fatal. A single row that cannot be
    /// read is skipped without hiding the others.
    pub async fn list_enabled(&self) -> EnabledTargets {
        match self.fetch_enabled().instrument(self.span.clone()).await {
            Ok(targets) => {
                debug!(parent: &self.span, count = targets.len(), "Fetched enabled targets");
                targets
            }
            Err(err) => {
                warn!(parent: &self.span, kind = %err.kind(), "Error while fetching enabled targets: {}", err);
                EnabledTargets::new()
            }
        }
    }

    async fn fetch_enabled(&self) -> Result<EnabledTargets, DbError> {
        let conn = self.pool.get().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT url_id, is_enabled, sample_frequency_s, url_path, regex_pattern FROM {} WHERE is_enabled",
                    self.tables.targets
                ),
                (),
            )
            .await?;

        let mut targets = EnabledTargets::new();
        while let Some(row) = rows.next().await? {
            match target_from_row(&row) {
                Ok(target) => {
                    targets.insert(target.url_id, target.into());
                }
                Err(err) => {
                    let url_id = row.get::<i64>(0).ok();
                    warn!(?url_id, "Skipping unreadable target row: {}", err);
                }
            }
        }
        Ok(targets)
    }

    /// Administrative insert; returns the assigned `url_id`
    pub async fn register(&self, target: &NewTarget) -> Result<UrlId, RegistryError> {
        validate_target(target).into_result().map_err(RegistryError::Invalid)?;

        let conn = self.pool.get().await.map_err(DbError::from)?;
        conn.execute(
            &format!(
                "INSERT INTO {} (is_enabled, sample_frequency_s, url_path, regex_pattern) VALUES (?, ?, ?, ?)",
                self.tables.targets
            ),
            params![
                if target.is_enabled { 1 } else { 0 },
                i64::from(target.sample_frequency_s),
                target.url_path.clone(),
                target.regex_pattern.clone()
            ],
        )
        .await
        .map_err(DbError::from)?;

        let url_id = conn.last_insert_rowid();
        info!(parent: &self.span, url_id, url = %target.url_path, "Registered target");
        Ok(url_id)
    }

    pub async fn get(&self, url_id: UrlId) -> Result<Option<Target>, RegistryError> {
        let conn = self.pool.get().await.map_err(DbError::from)?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT url_id, is_enabled, sample_frequency_s, url_path, regex_pattern FROM {} WHERE url_id = ?",
                    self.tables.targets
                ),
                params![url_id],
            )
            .await
            .map_err(DbError::from)?;

        match rows.next().await.map_err(DbError::from)? {
            Some(row) => Ok(Some(target_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Enable or disable a target. Returns whether a row matched.
    pub async fn set_enabled(&self, url_id: UrlId, is_enabled: bool) -> Result<bool, RegistryError> {
        let conn = self.pool.get().await.map_err(DbError::from)?;
        let changed = conn
            .execute(
                &format!("UPDATE {} SET is_enabled = ? WHERE url_id = ?", self.tables.targets),
                params![if is_enabled { 1 } else { 0 }, url_id],
            )
            .await
            .map_err(DbError::from)?;

        info!(parent: &self.span, url_id, is_enabled, changed, "Updated target state");
        Ok(changed > 0)
    }
}

fn target_from_row(row: &libsql::Row) -> Result<Target, DbError> {
    let frequency: i64 = row.get(2)?;
    Ok(Target {
        url_id: row.get(0)?,
        is_enabled: row.get::<i64>(1)? != 0,
        sample_frequency_s: u32::try_from(frequency)
            .map_err(|_| DbError::OutOfRange { column: "sample_frequency_s", value: frequency })?,
        url_path: row.get(3)?,
        regex_pattern: row.get(4)?,
    })
}

/// Quote `value` as an SQL string literal.
fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// How the enabled set changed between two polls of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    pub added: Vec<UrlId>,
    pub removed: Vec<UrlId>,
    /// Still enabled but with a different path, interval or pattern
    pub changed: Vec<UrlId>,
}

impl RegistryDiff {
    pub fn between(previous: &EnabledTargets, current: &EnabledTargets) -> Self {
        let mut diff = Self::default();
        for (url_id, target) in current {
            match previous.get(url_id) {
                None => diff.added.push(*url_id),
                Some(old) if old != target => diff.changed.push(*url_id),
                Some(_) => {}
            }
        }
        diff.removed = previous.keys().filter(|id| !current.contains_key(id)).copied().collect();

        diff.added.sort_unstable();
        diff.removed.sort_unstable();
        diff.changed.sort_unstable();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}
