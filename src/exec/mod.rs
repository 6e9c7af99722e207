//! Command execution with guaranteed cleanup.
//!
//! `ExecFilter` is the only place commands are created and disposed. Every
//! entry point scopes the connection's dialect as the ambient dialect for the
//! duration of the work, and disposes the command before that scope ends, on
//! every exit path.

mod lazy;

pub use lazy::{LazyResults, LazyStream};

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::{debug, trace};

use crate::ambient;
use crate::config::ExecConfig;
use crate::db::{Command, DbConnection, SqlExpression};
use crate::error::Result;
use crate::results::ResultsFilter;

static GLOBAL: OnceLock<ExecFilter> = OnceLock::new();

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates, runs and disposes commands.
pub struct ExecFilter {
    config: ExecConfig,
    results_filter: RwLock<Option<Arc<dyn ResultsFilter>>>,
    last_command_text: Mutex<Option<String>>,
}

impl ExecFilter {
    pub fn new(config: ExecConfig) -> Self {
        Self {
            config,
            results_filter: RwLock::new(None),
            last_command_text: Mutex::new(None),
        }
    }

    /// The process-wide filter, configured from the environment on first use.
    pub fn global() -> &'static ExecFilter {
        GLOBAL.get_or_init(|| ExecFilter::new(ExecConfig::from_env()))
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// The installed interception target, if any.
    pub fn results_filter(&self) -> Option<Arc<dyn ResultsFilter>> {
        self.results_filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs or clears the interception target. Commands created afterwards
    /// pick up the new value; commands already created keep theirs.
    pub fn set_results_filter(&self, target: Option<Arc<dyn ResultsFilter>>) {
        *self
            .results_filter
            .write()
            .unwrap_or_else(PoisonError::into_inner) = target;
    }

    /// Installs `target` until the returned guard is dropped.
    #[must_use = "the interception target is removed when the guard is dropped"]
    pub fn install_results_filter(&self, target: Arc<dyn ResultsFilter>) -> ResultsFilterGuard<'_> {
        let previous = std::mem::replace(
            &mut *self
                .results_filter
                .write()
                .unwrap_or_else(PoisonError::into_inner),
            Some(target),
        );
        ResultsFilterGuard {
            filter: self,
            previous,
        }
    }

    /// SQL text of the most recently disposed command.
    ///
    /// Cleared whenever a new command is created.
    pub fn last_command_text(&self) -> Option<String> {
        lock(&self.last_command_text).clone()
    }

    /// An expression builder for the connection's dialect.
    pub fn sql_expression<T>(&self, conn: &dyn DbConnection) -> SqlExpression<T> {
        SqlExpression::new(conn.dialect_provider())
    }

    /// Creates a command bound to `conn`.
    ///
    /// The command carries the connection's dialect, the connection's explicit
    /// transaction or else the ambient one, the configured timeout and the
    /// interception target installed right now.
    pub fn create_command(&self, conn: &dyn DbConnection) -> Result<Command> {
        *lock(&self.last_command_text) = None;

        let driver = conn.create_command()?;
        let mut cmd = Command::new(driver, conn.dialect_provider());
        cmd.set_transaction(conn.transaction().or_else(ambient::current_transaction));
        cmd.set_timeout(self.config.command_timeout());
        cmd.set_results_filter(self.results_filter());

        debug!(
            command = cmd.id(),
            dialect = cmd.dialect().name(),
            transaction = cmd.transaction().map(|t| t.id()),
            intercepted = cmd.results_filter().is_some(),
            "command created"
        );
        Ok(cmd)
    }

    /// Records the command's text and releases it.
    pub fn dispose_command(&self, mut cmd: Command) {
        self.release(&mut cmd);
    }

    fn release(&self, cmd: &mut Command) {
        if cmd.is_closed() {
            return;
        }
        if self.config.log_sql {
            debug!(command = cmd.id(), sql = cmd.text(), "command disposed");
        } else {
            trace!(command = cmd.id(), "command disposed");
        }
        *lock(&self.last_command_text) = Some(cmd.text().to_string());
        cmd.close();
    }

    /// Runs `work` against a fresh command on the current thread.
    pub fn exec<T, F>(&self, conn: &dyn DbConnection, work: F) -> Result<T>
    where
        F: FnOnce(&mut Command) -> Result<T>,
    {
        let command = self.create_command(conn)?;
        ambient::with_dialect_sync(conn.dialect_provider(), move || {
            let mut scope = CommandScope::new(self, command);
            let out = work(&mut scope.command);
            drop(scope);
            out
        })
    }

    pub fn exec_void<F>(&self, conn: &dyn DbConnection, work: F) -> Result<()>
    where
        F: FnOnce(&mut Command) -> Result<()>,
    {
        self.exec(conn, work)
    }

    /// Runs async `work` against a fresh command.
    ///
    /// The command is created before the work starts. If the returned future
    /// is dropped before completion the command is still disposed, once.
    ///
    /// ```ignore
    /// let total = filter
    ///     .exec_async(&conn, move |cmd| {
    ///         Box::pin(async move { cmd.long_scalar(Some("SELECT count(*) FROM t"), &cancel).await })
    ///     })
    ///     .await?;
    /// ```
    pub async fn exec_async<T, F>(&self, conn: &dyn DbConnection, work: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Command) -> BoxFuture<'c, Result<T>>,
    {
        let command = self.create_command(conn)?;
        ambient::with_dialect(conn.dialect_provider(), async move {
            let mut scope = CommandScope::new(self, command);
            let out = work(&mut scope.command).await;
            drop(scope);
            out
        })
        .await
    }

    pub async fn exec_async_void<F>(&self, conn: &dyn DbConnection, work: F) -> Result<()>
    where
        F: for<'c> FnOnce(&'c mut Command) -> BoxFuture<'c, Result<()>>,
    {
        self.exec_async(conn, work).await
    }

    /// Runs `work` to obtain an iterator and ties the command's disposal to it.
    ///
    /// The command stays open until the returned iterator is exhausted or
    /// dropped. If `work` fails the command is disposed before returning.
    pub fn exec_lazy<I, F>(&self, conn: &dyn DbConnection, work: F) -> Result<LazyResults<'_, I::IntoIter>>
    where
        I: IntoIterator,
        F: FnOnce(&mut Command) -> Result<I>,
    {
        let dialect = conn.dialect_provider();
        let command = self.create_command(conn)?;
        ambient::with_dialect_sync(Arc::clone(&dialect), move || {
            let mut scope = CommandScope::new(self, command);
            let iter = work(&mut scope.command)?.into_iter();
            Ok(LazyResults::new(scope, iter, dialect))
        })
    }

    /// Async counterpart of [`exec_lazy`](Self::exec_lazy) over a stream.
    pub async fn exec_stream<T, F>(&self, conn: &dyn DbConnection, work: F) -> Result<LazyStream<'_, T>>
    where
        T: 'static,
        F: for<'c> FnOnce(&'c mut Command) -> BoxFuture<'c, Result<BoxStream<'static, Result<T>>>>,
    {
        let dialect = conn.dialect_provider();
        let command = self.create_command(conn)?;
        ambient::with_dialect(Arc::clone(&dialect), async move {
            let mut scope = CommandScope::new(self, command);
            let stream = work(&mut scope.command).await?;
            Ok(LazyStream::new(scope, stream, dialect))
        })
        .await
    }
}

impl Default for ExecFilter {
    fn default() -> Self {
        Self::new(ExecConfig::default())
    }
}

impl std::fmt::Debug for ExecFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecFilter")
            .field("config", &self.config)
            .field("intercepted", &self.results_filter().is_some())
            .finish()
    }
}

/// Restores the previous interception target when dropped.
pub struct ResultsFilterGuard<'f> {
    filter: &'f ExecFilter,
    previous: Option<Arc<dyn ResultsFilter>>,
}

impl Drop for ResultsFilterGuard<'_> {
    fn drop(&mut self) {
        self.filter.set_results_filter(self.previous.take());
    }
}

/// Owns a command and disposes it through its filter when dropped.
pub(crate) struct CommandScope<'f> {
    filter: &'f ExecFilter,
    pub(crate) command: Command,
}

impl<'f> CommandScope<'f> {
    fn new(filter: &'f ExecFilter, command: Command) -> Self {
        Self { filter, command }
    }
}

impl Drop for CommandScope<'_> {
    fn drop(&mut self) {
        self.filter.release(&mut self.command);
    }
}
