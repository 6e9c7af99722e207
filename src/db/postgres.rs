//! PostgreSQL driver.
//!
//! Provides `PostgresConnection`, a `DbConnection` over one dedicated sqlx
//! connection. Commands created from it share that connection, so a
//! transaction opened with `begin_transaction` covers every command until it
//! is committed or rolled back.

use crate::config::ConnectionConfig;
use crate::db::{
    ColumnInfo, DbConnection, DialectProvider, DriverCommand, IsolationLevel, PostgresDialect,
    ResultSet, Row, Statement, Transaction, Value,
};
use crate::error::{ExecError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column as SqlxColumn, Connection, Postgres, Row as SqlxRow, TypeInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timeout applied when a statement carries none.
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Maximum number of connection retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts (doubles each retry).
const RETRY_BASE_DELAY_MS: u64 = 500;

type SharedConnection = Arc<Mutex<sqlx::PgConnection>>;

/// PostgreSQL connection.
pub struct PostgresConnection {
    conn: SharedConnection,
    dialect: Arc<dyn DialectProvider>,
    transaction: std::sync::Mutex<Option<Transaction>>,
}

impl PostgresConnection {
    /// Connects with retry on transient failures.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn_str = config.to_connection_string()?;

        let mut last_error = None;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            debug!("Connection attempt {} of {}", attempt, MAX_RETRY_ATTEMPTS);

            match sqlx::PgConnection::connect(&conn_str).await {
                Ok(conn) => {
                    debug!("Successfully connected to database");
                    return Ok(Self::from_connection(conn));
                }
                Err(e) => {
                    let is_transient = is_transient_error(&e);
                    last_error = Some(e);

                    if attempt < MAX_RETRY_ATTEMPTS && is_transient {
                        warn!(
                            "Connection attempt {} failed (transient error), retrying in {:?}",
                            attempt, delay
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2; // Exponential backoff
                    } else {
                        break;
                    }
                }
            }
        }

        Err(match last_error {
            Some(e) => map_connection_error(e, config),
            None => ExecError::connection("No connection attempt was made"),
        })
    }

    /// Wraps an already open sqlx connection.
    pub fn from_connection(conn: sqlx::PgConnection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            dialect: Arc::new(PostgresDialect),
            transaction: std::sync::Mutex::new(None),
        }
    }

    /// Opens a transaction; commands created afterwards are bound to it.
    pub async fn begin_transaction(&self, isolation: IsolationLevel) -> Result<Transaction> {
        if self.transaction().is_some() {
            return Err(ExecError::command("A transaction is already open"));
        }
        let sql = format!("BEGIN ISOLATION LEVEL {}", isolation.as_sql());
        self.run_control(&sql).await?;

        let transaction = Transaction::new(isolation);
        self.set_transaction(Some(transaction.clone()));
        debug!(transaction = transaction.id(), "Transaction started");
        Ok(transaction)
    }

    pub async fn commit(&self) -> Result<()> {
        self.finish_transaction("COMMIT").await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.finish_transaction("ROLLBACK").await
    }

    /// Closes the connection. Fails while commands created from it are alive.
    pub async fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| ExecError::internal("Connection still has live commands"))?;
        conn.into_inner()
            .close()
            .await
            .map_err(|e| ExecError::connection(e.to_string()))
    }

    async fn finish_transaction(&self, sql: &str) -> Result<()> {
        let Some(transaction) = self.transaction() else {
            return Err(ExecError::command("No transaction is open"));
        };
        let result = self.run_control(sql).await;
        // The transaction is over even when the statement fails.
        self.set_transaction(None);
        debug!(transaction = transaction.id(), "{}", sql);
        result
    }

    async fn run_control(&self, sql: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query(sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| ExecError::command(format_query_error(e)))?;
        Ok(())
    }

    fn set_transaction(&self, transaction: Option<Transaction>) {
        if let Ok(mut slot) = self.transaction.lock() {
            *slot = transaction;
        }
    }
}

impl DbConnection for PostgresConnection {
    fn create_command(&self) -> Result<Box<dyn DriverCommand>> {
        Ok(Box::new(PgCommand {
            conn: Arc::clone(&self.conn),
        }))
    }

    fn dialect_provider(&self) -> Arc<dyn DialectProvider> {
        Arc::clone(&self.dialect)
    }

    fn transaction(&self) -> Option<Transaction> {
        self.transaction.lock().ok().and_then(|t| t.clone())
    }
}

/// Command resource sharing the connection of its `PostgresConnection`.
struct PgCommand {
    conn: SharedConnection,
}

impl PgCommand {
    /// Runs `op` under the statement timeout, racing the cancellation token.
    async fn run<T, F>(&self, statement: &Statement, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let timeout = statement
            .timeout
            .unwrap_or(Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS));

        tokio::select! {
            _ = cancel.cancelled() => Err(ExecError::Cancelled),
            result = tokio::time::timeout(timeout, op) => match result {
                Err(_) => Err(ExecError::Timeout(timeout)),
                Ok(inner) => inner.map_err(|e| ExecError::command(format_query_error(e))),
            },
        }
    }
}

#[async_trait]
impl DriverCommand for PgCommand {
    async fn execute_non_query(
        &self,
        statement: &Statement,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let query = bind_statement(statement);
        let done = self.run(statement, cancel, query.execute(&mut *conn)).await?;
        Ok(done.rows_affected())
    }

    async fn execute_scalar(
        &self,
        statement: &Statement,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut conn = self.conn.lock().await;
        let query = bind_statement(statement);
        let row = self
            .run(statement, cancel, query.fetch_optional(&mut *conn))
            .await?;

        Ok(match row {
            Some(row) if !row.columns().is_empty() => {
                convert_value(&row, 0, row.columns()[0].type_info().name())
            }
            _ => Value::Null,
        })
    }

    async fn execute_reader(
        &self,
        statement: &Statement,
        cancel: &CancellationToken,
    ) -> Result<ResultSet> {
        let mut conn = self.conn.lock().await;
        let query = bind_statement(statement);
        let rows = self.run(statement, cancel, query.fetch_all(&mut *conn)).await?;

        // Column metadata comes from the first row; empty results carry none.
        let columns: Vec<ColumnInfo> = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(ResultSet {
            columns,
            rows: rows.iter().map(convert_row).collect(),
        })
    }
}

/// Binds statement parameters in order to `$1..$n`.
fn bind_statement(statement: &Statement) -> Query<'_, Postgres, PgArguments> {
    let mut query = sqlx::query::<Postgres>(&statement.text);
    for param in &statement.parameters {
        query = match param.value.clone() {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(b),
            Value::Int(i) => query.bind(i),
            Value::Float(f) => query.bind(f),
            Value::String(s) => query.bind(s),
            Value::Bytes(b) => query.bind(b),
        };
    }
    query
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        // Everything else is read as text
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Determines if an error is transient and worth retrying.
fn is_transient_error(error: &sqlx::Error) -> bool {
    let error_str = error.to_string().to_lowercase();

    error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("timeout")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
}

/// Maps sqlx connection errors to user-friendly messages.
fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> ExecError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port;
    let user = config.user.as_deref().unwrap_or("unknown");
    let database = config.database.as_deref().unwrap_or("unknown");

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        ExecError::connection(format!(
            "Cannot connect to {host}:{port}. Check that the server is running."
        ))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        ExecError::connection(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        ExecError::connection(format!("Database '{database}' does not exist."))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        ExecError::connection(format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        ExecError::connection(error.to_string())
    }
}

/// Formats a query error with detail and hint when Postgres provides them.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = String::from("ERROR: ");
    result.push_str(db_error.message());

    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }
        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }
        if let Some(constraint) = pg_error.constraint() {
            result.push_str("\n  CONSTRAINT: ");
            result.push_str(constraint);
        }
    }

    result
}
