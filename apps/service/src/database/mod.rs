/// Database abstraction layer
///
/// This module owns everything persisted: the schema, the target registry and
/// the measurement store. Each public operation checks a connection out of
/// the pool and returns it before completing.

pub mod error;
pub mod fixtures;
pub mod models;
pub mod registry;
pub mod runner;
pub mod schema;
pub mod store;


pub use error::{DbError, FailureKind, Violation};
pub use registry::{EnabledTargets, RegistryDiff, RegistryError, TargetRegistry};
pub use runner::{DryRun, LiveRunner, Outcome, StatementRunner};
pub use schema::{SchemaManager, Tables};
pub use store::{BatchOutcome, MeasurementSink, MeasurementStore};

use anyhow::Result;
use std::sync::Arc;
use tracing::{Span, info, info_span};

use crate::config::{DatabaseConfig, ModeConfig};
use crate::pool::{LibsqlPool, build_pool};

/// Open the configured backend and wrap it in a pool
pub async fn open_pool(config: &DatabaseConfig) -> Result<LibsqlPool> {
    let database = match config.remote_url() {
        Some(url) => {
            info!("Connecting to remote libSQL at {}", url);
            libsql::Builder::new_remote(url, config.auth_token.clone().unwrap_or_default())
                .build()
                .await?
        }
        None => {
            info!("Opening local database {}", config.name);
            libsql::Builder::new_local(&config.name).build().await?
        }
    };
    build_pool(database, config.pool_size)
}

/// Entry point to the persistence components of one namespace.
///
/// The execution strategy is fixed here; components handed out share it
/// and log under child spans of `span`.
pub struct Storage {
    pool: LibsqlPool,
    tables: Tables,
    runner: Arc<dyn StatementRunner>,
    span: Span,
}

impl Storage {
    pub fn new(pool: LibsqlPool, mode: &ModeConfig, span: Span) -> Self {
        let tables = Tables::new(mode.namespace);
        let runner = runner::runner_for(mode.execution, &pool, span.clone());
        Self { pool, tables, runner, span }
    }

    /// Storage logging under a fresh `storage` span
    pub fn from_pool(pool: LibsqlPool, mode: &ModeConfig) -> Self {
        let span = info_span!("storage", namespace = %mode.namespace, execution = %mode.execution);
        Self::new(pool, mode, span)
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn schema(&self) -> SchemaManager {
        SchemaManager::new(
            self.tables.clone(),
            self.runner.clone(),
            info_span!(parent: &self.span, "schema"),
        )
    }

    pub fn registry(&self) -> TargetRegistry {
        TargetRegistry::new(
            self.tables.clone(),
            self.pool.clone(),
            self.runner.clone(),
            info_span!(parent: &self.span, "target_registry"),
        )
    }

    pub fn measurements(&self) -> MeasurementStore {
        MeasurementStore::new(
            self.tables.clone(),
            self.pool.clone(),
            info_span!(parent: &self.span, "measurement_store"),
        )
    }
}
