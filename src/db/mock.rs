//! Mock driver for testing.
//!
//! Provides an in-memory connection with scripted results that records every
//! command it hands out, so lifecycle and dispatch behavior can be asserted
//! without a live database.

use super::{
    DbConnection, DialectProvider, DriverCommand, GenericDialect, ResultSet, Statement,
    Transaction, Value,
};
use crate::error::{ExecError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A dialect that only carries a name, for telling connections apart in tests.
#[derive(Debug, Clone)]
pub struct MockDialect {
    name: String,
}

impl MockDialect {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl DialectProvider for MockDialect {
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Default)]
struct MockScript {
    result_set: ResultSet,
    scalar: Option<Value>,
    rows_affected: u64,
    latency: Option<Duration>,
    execution_error: Option<String>,
    create_error: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    created: AtomicUsize,
    disposed: AtomicUsize,
    driver_calls: AtomicUsize,
    executed: Mutex<Vec<Statement>>,
}

/// A mock connection that returns scripted results.
pub struct MockConnection {
    dialect: Arc<dyn DialectProvider>,
    script: Arc<MockScript>,
    state: Arc<MockState>,
    transaction: Mutex<Option<Transaction>>,
}

impl MockConnection {
    /// Creates a mock connection with the generic dialect and empty results.
    pub fn new() -> Self {
        Self {
            dialect: Arc::new(GenericDialect),
            script: Arc::new(MockScript::default()),
            state: Arc::new(MockState::default()),
            transaction: Mutex::new(None),
        }
    }

    /// Creates a connection whose `create_command` always fails.
    pub fn unusable(msg: impl Into<String>) -> Self {
        let mut conn = Self::new();
        Arc::make_mut(&mut conn.script).create_error = Some(msg.into());
        conn
    }

    pub fn with_dialect(mut self, dialect: Arc<dyn DialectProvider>) -> Self {
        self.dialect = dialect;
        self
    }

    /// Result set returned by every reader call.
    pub fn with_result_set(mut self, result_set: ResultSet) -> Self {
        Arc::make_mut(&mut self.script).result_set = result_set;
        self
    }

    /// Value returned by scalar calls. Defaults to the first cell of the result set.
    pub fn with_scalar(mut self, value: impl Into<Value>) -> Self {
        Arc::make_mut(&mut self.script).scalar = Some(value.into());
        self
    }

    pub fn with_rows_affected(mut self, rows: u64) -> Self {
        Arc::make_mut(&mut self.script).rows_affected = rows;
        self
    }

    /// Delay applied to every driver call before it answers.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        Arc::make_mut(&mut self.script).latency = Some(latency);
        self
    }

    /// Makes every driver call fail with a command error.
    pub fn with_execution_error(mut self, msg: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.script).execution_error = Some(msg.into());
        self
    }

    pub fn set_transaction(&self, transaction: Option<Transaction>) {
        if let Ok(mut slot) = self.transaction.lock() {
            *slot = transaction;
        }
    }

    /// Number of command resources handed out.
    pub fn commands_created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    /// Number of command resources released.
    pub fn commands_disposed(&self) -> usize {
        self.state.disposed.load(Ordering::SeqCst)
    }

    /// Number of execution calls that reached the driver.
    pub fn driver_calls(&self) -> usize {
        self.state.driver_calls.load(Ordering::SeqCst)
    }

    /// Every statement that reached the driver, in call order.
    pub fn executed(&self) -> Vec<Statement> {
        self.state
            .executed
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn last_statement(&self) -> Option<Statement> {
        self.executed().pop()
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl DbConnection for MockConnection {
    fn create_command(&self) -> Result<Box<dyn DriverCommand>> {
        if let Some(msg) = &self.script.create_error {
            return Err(ExecError::connection(msg.clone()));
        }
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCommand {
            script: Arc::clone(&self.script),
            state: Arc::clone(&self.state),
        }))
    }

    fn dialect_provider(&self) -> Arc<dyn DialectProvider> {
        Arc::clone(&self.dialect)
    }

    fn transaction(&self) -> Option<Transaction> {
        self.transaction.lock().ok().and_then(|t| t.clone())
    }
}

struct MockCommand {
    script: Arc<MockScript>,
    state: Arc<MockState>,
}

impl MockCommand {
    /// Records the call and waits out the scripted latency.
    async fn round_trip(&self, statement: &Statement, cancel: &CancellationToken) -> Result<()> {
        self.state.driver_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut executed) = self.state.executed.lock() {
            executed.push(statement.clone());
        }

        if let Some(latency) = self.script.latency {
            if let Some(timeout) = statement.timeout {
                if latency > timeout {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                        _ = tokio::time::sleep(timeout) => return Err(ExecError::Timeout(timeout)),
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        } else if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        match &self.script.execution_error {
            Some(msg) => Err(ExecError::command(msg.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DriverCommand for MockCommand {
    async fn execute_non_query(
        &self,
        statement: &Statement,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.round_trip(statement, cancel).await?;
        Ok(self.script.rows_affected)
    }

    async fn execute_scalar(
        &self,
        statement: &Statement,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.round_trip(statement, cancel).await?;
        let value = match &self.script.scalar {
            Some(value) => value.clone(),
            None => self
                .script
                .result_set
                .rows
                .first()
                .and_then(|row| row.first())
                .cloned()
                .unwrap_or(Value::Null),
        };
        Ok(value)
    }

    async fn execute_reader(
        &self,
        statement: &Statement,
        cancel: &CancellationToken,
    ) -> Result<ResultSet> {
        self.round_trip(statement, cancel).await?;
        Ok(self.script.result_set.clone())
    }

    fn close(&mut self) {
        self.state.disposed.fetch_add(1, Ordering::SeqCst);
    }
}
