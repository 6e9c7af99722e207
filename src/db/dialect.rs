//! Dialect providers.
//!
//! A dialect provider owns the execution primitives for one database dialect.
//! The defaults forward to the command's driver resource; dialects override
//! them only when a database needs different behavior.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Command, ResultSet, Value};
use crate::error::Result;

/// Execution strategy of one database dialect.
#[async_trait]
pub trait DialectProvider: Send + Sync + fmt::Debug {
    /// Dialect name, e.g. `"postgres"`.
    fn name(&self) -> &str;

    /// Quotes an identifier for use in SQL text.
    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Executes a command that returns no rows, yielding the affected row count.
    async fn execute_non_query(&self, cmd: &Command, cancel: &CancellationToken) -> Result<u64> {
        cmd.driver().execute_non_query(cmd.statement(), cancel).await
    }

    /// Executes a command and returns the first column of the first row.
    async fn execute_scalar(&self, cmd: &Command, cancel: &CancellationToken) -> Result<Value> {
        cmd.driver().execute_scalar(cmd.statement(), cancel).await
    }

    /// Executes a command and reads its whole result set.
    async fn execute_reader(&self, cmd: &Command, cancel: &CancellationToken) -> Result<ResultSet> {
        cmd.driver().execute_reader(cmd.statement(), cancel).await
    }
}

/// ANSI dialect with no driver-specific behavior.
#[derive(Debug, Clone, Default)]
pub struct GenericDialect;

impl DialectProvider for GenericDialect {
    fn name(&self) -> &str {
        "generic"
    }
}

/// PostgreSQL dialect.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl DialectProvider for PostgresDialect {
    fn name(&self) -> &str {
        "postgres"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        // Postgres folds unquoted identifiers to lower case; keep simple
        // lower-case names unquoted so they stay readable in logs.
        let simple = !ident.is_empty()
            && ident
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            && !ident.starts_with(|c: char| c.is_ascii_digit());
        if simple {
            ident.to_string()
        } else {
            format!("\"{}\"", ident.replace('"', "\"\""))
        }
    }
}

/// Handle for building SQL for rows of type `T` in a given dialect.
///
/// Query building itself lives outside this crate; the handle only carries
/// the dialect the expression must be rendered for.
pub struct SqlExpression<T> {
    dialect: Arc<dyn DialectProvider>,
    _row: PhantomData<fn() -> T>,
}

impl<T> SqlExpression<T> {
    pub fn new(dialect: Arc<dyn DialectProvider>) -> Self {
        Self {
            dialect,
            _row: PhantomData,
        }
    }

    pub fn dialect(&self) -> &Arc<dyn DialectProvider> {
        &self.dialect
    }

    /// `SELECT * FROM <table>` with the table quoted for the dialect.
    pub fn select_all(&self, table: &str) -> String {
        format!("SELECT * FROM {}", self.dialect.quote_identifier(table))
    }
}

impl<T> fmt::Debug for SqlExpression<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlExpression")
            .field("dialect", &self.dialect.name())
            .field("row", &std::any::type_name::<T>())
            .finish()
    }
}
