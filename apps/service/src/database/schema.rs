use std::sync::Arc;
use tracing::{Span, info, warn};

use super::runner::{Outcome, StatementRunner};
use crate::config::Namespace;

/// Names of the schema objects in one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    pub prefix: &'static str,
    pub targets: String,
    pub metrics: String,
}

impl Tables {
    pub fn new(namespace: Namespace) -> Self {
        let prefix = namespace.prefix();
        Self {
            prefix,
            targets: format!("{prefix}target_urls"),
            metrics: format!("{prefix}url_performance_metrics"),
        }
    }
}

/// Creates and drops the registry and metrics tables.
pub struct SchemaManager {
    tables: Tables,
    runner: Arc<dyn StatementRunner>,
    span: Span,
}

impl SchemaManager {
    pub fn new(tables: Tables, runner: Arc<dyn StatementRunner>, span: Span) -> Self {
        Self { tables, runner, span }
    }

    /// DDL for `provision`, in dependency order
    pub fn create_statements(&self) -> Vec<String> {
        let Tables { prefix, targets, metrics } = &self.tables;
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {targets} (
            url_id INTEGER PRIMARY KEY AUTOINCREMENT,
            is_enabled BOOLEAN NOT NULL DEFAULT FALSE,
            sample_frequency_s INTEGER NOT NULL DEFAULT 60 CHECK (sample_frequency_s > 0),
            url_path TEXT NOT NULL,
            regex_pattern TEXT DEFAULT NULL
        )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {metrics} (
            sample_timestamp TIMESTAMPTZ NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%f000Z', 'now')),
            url_id INTEGER NOT NULL REFERENCES {targets}(url_id),
            response_code INTEGER NOT NULL,
            response_time DOUBLE PRECISION NOT NULL CHECK (response_time >= 0),
            match_found BOOLEAN NOT NULL,
            PRIMARY KEY (sample_timestamp, url_id)
        )"
            ),
            format!("CREATE INDEX IF NOT EXISTS {prefix}idx_target_urls_enabled ON {targets}(is_enabled)"),
            format!(
                "CREATE INDEX IF NOT EXISTS {prefix}idx_metrics_url_timestamp ON {metrics}(url_id, sample_timestamp DESC)"
            ),
        ]
    }

    /// DDL for `teardown`; metrics first since they reference targets
    pub fn drop_statements(&self) -> Vec<String> {
        vec![
            format!("DROP TABLE IF EXISTS {}", self.tables.metrics),
            format!("DROP TABLE IF EXISTS {}", self.tables.targets),
        ]
    }

    /// Create both tables if absent
    pub async fn provision(&self) -> Outcome {
        let outcome = self.runner.run(self.create_statements()).await;
        self.report("provision", &outcome);
        outcome
    }

    /// Drop both tables if present
    pub async fn teardown(&self) -> Outcome {
        let outcome = self.runner.run(self.drop_statements()).await;
        self.report("teardown", &outcome);
        outcome
    }

    fn report(&self, operation: &str, outcome: &Outcome) {
        match outcome {
            Outcome::Planned(statements) => {
                info!(parent: &self.span, operation, count = statements.len(), "Planned schema statements")
            }
            Outcome::Applied => info!(parent: &self.span, operation, "Schema {} applied", operation),
            Outcome::Failed(kind) => warn!(parent: &self.span, operation, %kind, "Schema {} failed", operation),
        }
    }
}
