//! Flow-scoped ambient state.
//!
//! The active dialect provider and an ambient transaction are stored in tokio
//! task-locals. Async code enters a scope with `scope`-style functions for the
//! lifetime of a future; blocking code enters the same keys with `sync_scope`
//! for the duration of a closure. Either way the previous value is restored
//! when the scope ends, including on error or panic, and concurrent tasks
//! never observe each other's values.

use std::future::Future;
use std::sync::Arc;

use crate::db::{Command, DialectProvider, Transaction};

tokio::task_local! {
    static DIALECT: Arc<dyn DialectProvider>;
    static TRANSACTION: Transaction;
}

/// The dialect provider active in the current flow, if any.
pub fn current_dialect() -> Option<Arc<dyn DialectProvider>> {
    DIALECT.try_with(|d| Arc::clone(d)).ok()
}

/// The dialect a command should execute through: the ambient one when set,
/// otherwise the dialect stamped on the command.
pub fn active_dialect(cmd: &Command) -> Arc<dyn DialectProvider> {
    current_dialect().unwrap_or_else(|| Arc::clone(cmd.dialect()))
}

/// Runs `fut` with `dialect` as the ambient dialect.
pub async fn with_dialect<F>(dialect: Arc<dyn DialectProvider>, fut: F) -> F::Output
where
    F: Future,
{
    DIALECT.scope(dialect, fut).await
}

/// Runs `f` on the current thread with `dialect` as the ambient dialect.
pub fn with_dialect_sync<R>(dialect: Arc<dyn DialectProvider>, f: impl FnOnce() -> R) -> R {
    DIALECT.sync_scope(dialect, f)
}

/// The ambient transaction of the current flow, if any.
pub fn current_transaction() -> Option<Transaction> {
    TRANSACTION.try_with(|t| t.clone()).ok()
}

/// Runs `fut` inside an ambient transaction scope.
///
/// Commands created in the scope join `transaction` unless their connection
/// has an explicit transaction of its own.
pub async fn with_transaction<F>(transaction: Transaction, fut: F) -> F::Output
where
    F: Future,
{
    TRANSACTION.scope(transaction, fut).await
}

/// Blocking counterpart of [`with_transaction`].
pub fn with_transaction_sync<R>(transaction: Transaction, f: impl FnOnce() -> R) -> R {
    TRANSACTION.sync_scope(transaction, f)
}
