//! db-execfilter - command execution and result interception for database access.
//!
//! [`exec::ExecFilter`] owns the lifecycle of every command: creation from a
//! connection, timeout and transaction binding, the ambient dialect scope, and
//! disposal on every exit path. The per-shape entry points on [`db::Command`]
//! (scalar, list, column, dictionary, lookup and friends) either answer from
//! an installed [`results::ResultsFilter`] or run against the live driver and
//! materialize the rows.

pub mod ambient;
pub mod config;
pub mod db;
pub mod error;
pub mod exec;
pub mod logging;
pub mod materialize;
pub mod results;

pub use error::{ExecError, Result};
pub use exec::ExecFilter;
