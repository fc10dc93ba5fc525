use async_trait::async_trait;
use std::sync::Arc;
use tracing::{Instrument, Span, debug, error};

use super::error::{DbError, FailureKind};
use crate::config::ExecutionMode;
use crate::pool::LibsqlPool;

/// Result of a schema or seed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Dry run: the statements that would have been executed
    Planned(Vec<String>),
    /// Every statement was executed and committed
    Applied,
    /// Nothing was committed
    Failed(FailureKind),
}

impl Outcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, Outcome::Failed(_))
    }

    pub fn planned(&self) -> Option<&[String]> {
        match self {
            Outcome::Planned(statements) => Some(statements),
            _ => None,
        }
    }
}

/// Strategy for mutating statements, chosen once when storage is built.
#[async_trait]
pub trait StatementRunner: Send + Sync {
    async fn run(&self, statements: Vec<String>) -> Outcome;
}

/// Renders statements without touching a backend.
pub struct DryRun;

#[async_trait]
impl StatementRunner for DryRun {
    async fn run(&self, statements: Vec<String>) -> Outcome {
        Outcome::Planned(statements)
    }
}

/// Executes statements in a single transaction on a pooled connection.
pub struct LiveRunner {
    pool: LibsqlPool,
    span: Span,
}

impl LiveRunner {
    pub fn new(pool: LibsqlPool, span: Span) -> Self {
        Self { pool, span }
    }

    async fn execute_all(&self, statements: &[String]) -> Result<(), DbError> {
        let conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        for statement in statements {
            debug!(%statement, "executing");
            if let Err(err) = tx.execute(statement, ()).await {
                if let Err(rollback_err) = tx.rollback().await {
                    error!("Rollback failed: {}", rollback_err);
                }
                return Err(err.into());
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl StatementRunner for LiveRunner {
    async fn run(&self, statements: Vec<String>) -> Outcome {
        let count = statements.len();
        match self.execute_all(&statements).instrument(self.span.clone()).await {
            Ok(()) => {
                debug!(parent: &self.span, count, "statements committed");
                Outcome::Applied
            }
            Err(err) => {
                let kind = err.kind();
                error!(parent: &self.span, %kind, "Statement batch failed: {}", err);
                Outcome::Failed(kind)
            }
        }
    }
}

/// Pick the runner for `mode`. Dry runs never need the pool.
pub fn runner_for(mode: ExecutionMode, pool: &LibsqlPool, span: Span) -> Arc<dyn StatementRunner> {
    match mode {
        ExecutionMode::Live => Arc::new(LiveRunner::new(pool.clone(), span)),
        ExecutionMode::DryRun => Arc::new(DryRun),
    }
}
