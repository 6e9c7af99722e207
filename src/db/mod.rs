//! Database abstraction layer.
//!
//! Provides the trait-based interface the execution filter consumes from
//! drivers: connections that hand out command resources, and command
//! resources that execute a bound statement.

mod command;
mod dialect;
mod mock;
mod postgres;
mod types;

pub use command::{Command, Parameter, Parameters, Statement};
pub use dialect::{DialectProvider, GenericDialect, PostgresDialect, SqlExpression};
pub use mock::{MockConnection, MockDialect};
pub use postgres::PostgresConnection;
pub use types::{ColumnInfo, ResultSet, Row, Value};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Postgres,
}

impl DatabaseBackend {
    /// Returns the backend as its URL scheme.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
        }
    }

    /// Parses a backend from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            _ => None,
        }
    }

    /// Returns the default port for this backend.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
        }
    }

    /// Returns the dialect provider used by connections of this backend.
    pub fn dialect(&self) -> Arc<dyn DialectProvider> {
        match self {
            Self::Postgres => Arc::new(PostgresDialect),
        }
    }
}

/// Opens a connection for the configured backend.
pub async fn connect(config: &ConnectionConfig) -> Result<Arc<dyn DbConnection>> {
    match config.backend {
        DatabaseBackend::Postgres => {
            let conn = PostgresConnection::connect(config).await?;
            Ok(Arc::new(conn))
        }
    }
}

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to an open transaction a command can participate in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    id: u64,
    isolation: IsolationLevel,
}

impl Transaction {
    /// Allocates a new transaction handle.
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            isolation,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }
}

/// A live connection that can create command resources.
pub trait DbConnection: Send + Sync {
    /// Creates a driver-side command resource.
    fn create_command(&self) -> Result<Box<dyn DriverCommand>>;

    /// The dialect this connection is configured with.
    fn dialect_provider(&self) -> Arc<dyn DialectProvider>;

    /// The transaction explicitly opened on this connection, if any.
    fn transaction(&self) -> Option<Transaction> {
        None
    }
}

/// Driver-side command resource.
///
/// All execution methods take the statement to run and a cancellation token
/// the driver should race against its round trip.
#[async_trait]
pub trait DriverCommand: Send + Sync {
    /// Executes a statement that returns no rows.
    async fn execute_non_query(
        &self,
        statement: &Statement,
        cancel: &CancellationToken,
    ) -> Result<u64>;

    /// Executes a statement and returns the first column of the first row.
    async fn execute_scalar(&self, statement: &Statement, cancel: &CancellationToken)
        -> Result<Value>;

    /// Executes a statement and reads its whole result set.
    async fn execute_reader(
        &self,
        statement: &Statement,
        cancel: &CancellationToken,
    ) -> Result<ResultSet>;

    /// Releases the resource. Called exactly once per command.
    fn close(&mut self) {}
}
