//! Results filter dispatch.
//!
//! One async entry point per query shape. Each entry point applies the
//! optional SQL text, then either hands the command to the installed
//! `ResultsFilter` or executes it through the active dialect and materializes
//! the reader.

mod filter;

pub use filter::{AnyValue, ResultsFilter, StubResultsFilter, TypeTag};

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::ambient;
use crate::db::{Command, ResultSet, Value};
use crate::error::{ExecError, Result};
use crate::materialize::{self, AnyRow, FromRow, FromValue, RowType};
use filter::downcast;

impl Command {
    /// Applies `sql` and returns the interception target, if one is installed.
    fn dispatch(&mut self, sql: Option<&str>) -> Option<Arc<dyn ResultsFilter>> {
        if let Some(sql) = sql {
            self.set_text(sql);
        }
        let filter = self.results_filter();
        if filter.is_some() {
            trace!(command = self.id(), sql = self.text(), "intercepted");
        }
        filter
    }

    async fn read(&self, cancel: &CancellationToken) -> Result<ResultSet> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let dialect = ambient::active_dialect(self);
        dialect.execute_reader(self, cancel).await
    }

    async fn read_scalar(&self, cancel: &CancellationToken) -> Result<Value> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let dialect = ambient::active_dialect(self);
        dialect.execute_scalar(self, cancel).await
    }

    /// Executes the current text as a non-query and returns the affected row count.
    pub async fn exec_non_query(&mut self, cancel: &CancellationToken) -> Result<u64> {
        if let Some(filter) = self.dispatch(None) {
            return filter.execute_sql(self);
        }
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let dialect = ambient::active_dialect(self);
        dialect.execute_non_query(self, cancel).await
    }

    /// Binds `params` (when given and non-empty), sets `sql` and executes it
    /// as a non-query.
    pub async fn exec_non_query_sql(
        &mut self,
        sql: &str,
        params: Option<&HashMap<String, Value>>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if let Some(params) = params {
            self.set_named_parameters(params);
        }
        self.set_text(sql);
        self.exec_non_query(cancel).await
    }

    /// Binds the fields of `params` as named parameters, sets `sql` and
    /// executes it as a non-query.
    pub async fn exec_non_query_with<P>(
        &mut self,
        sql: &str,
        params: &P,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        P: Serialize + ?Sized,
    {
        self.set_parameters_from(params)?;
        self.set_text(sql);
        self.exec_non_query(cancel).await
    }

    pub async fn convert_to_list<T>(
        &mut self,
        sql: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>>
    where
        T: FromRow + 'static,
    {
        if let Some(filter) = self.dispatch(sql) {
            return downcast(filter.get_list(self, TypeTag::of::<T>())?);
        }
        let reader = self.read(cancel).await?;
        materialize::convert_to_list(reader, cancel)
    }

    /// Rows of a type chosen at run time.
    pub async fn convert_to_list_of(
        &mut self,
        row_type: &RowType,
        sql: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<AnyRow>> {
        if let Some(filter) = self.dispatch(sql) {
            return filter.get_ref_list(self, row_type);
        }
        let reader = self.read(cancel).await?;
        materialize::convert_to_list_of(reader, row_type, cancel)
    }

    /// The first row as `T`, `None` when nothing was read.
    pub async fn convert_to<T>(
        &mut self,
        sql: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<T>>
    where
        T: FromRow + 'static,
    {
        if let Some(filter) = self.dispatch(sql) {
            return downcast(filter.get_single(self, TypeTag::of::<T>())?);
        }
        let reader = self.read(cancel).await?;
        materialize::convert_to(reader, cancel)
    }

    pub async fn convert_to_of(
        &mut self,
        row_type: &RowType,
        sql: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<AnyRow>> {
        if let Some(filter) = self.dispatch(sql) {
            return filter.get_ref_single(self, row_type);
        }
        let reader = self.read(cancel).await?;
        materialize::convert_to_of(reader, row_type, cancel)
    }

    /// First column of the first row as `T`.
    pub async fn scalar<T: FromValue>(
        &mut self,
        sql: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<T> {
        if let Some(filter) = self.dispatch(sql) {
            return T::from_value(filter.get_scalar(self)?);
        }
        let reader = self.read(cancel).await?;
        materialize::scalar(reader, cancel)
    }

    /// Untyped scalar, read through the dialect's scalar primitive.
    pub async fn scalar_value(
        &mut self,
        sql: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if let Some(filter) = self.dispatch(sql) {
            return filter.get_scalar(self);
        }
        self.read_scalar(cancel).await
    }

    /// Scalar as a 64-bit count; NULL reads as zero.
    pub async fn long_scalar(
        &mut self,
        sql: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        if let Some(filter) = self.dispatch(sql) {
            return filter.get_long_scalar(self);
        }
        let value = self.read_scalar(cancel).await?;
        materialize::long_scalar(value)
    }

    pub async fn column<T>(
        &mut self,
        sql: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>>
    where
        T: FromValue + 'static,
    {
        if let Some(filter) = self.dispatch(sql) {
            return downcast(filter.get_column(self, TypeTag::of::<T>())?);
        }
        let reader = self.read(cancel).await?;
        materialize::column(reader, cancel)
    }

    pub async fn column_distinct<T>(
        &mut self,
        sql: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<HashSet<T>>
    where
        T: FromValue + Eq + Hash + 'static,
    {
        if let Some(filter) = self.dispatch(sql) {
            return downcast(filter.get_column_distinct(self, TypeTag::of::<T>())?);
        }
        let reader = self.read(cancel).await?;
        materialize::column_distinct(reader, cancel)
    }

    /// Two-column result as a map; the last value read wins for a repeated key.
    pub async fn dictionary<K, V>(
        &mut self,
        sql: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<K, V>>
    where
        K: FromValue + Eq + Hash + 'static,
        V: FromValue + 'static,
    {
        if let Some(filter) = self.dispatch(sql) {
            let answer = filter.get_dictionary(self, TypeTag::of::<K>(), TypeTag::of::<V>())?;
            return downcast(answer);
        }
        let reader = self.read(cancel).await?;
        materialize::dictionary(reader, cancel)
    }

    /// Two-column result grouped by key, values in read order.
    pub async fn lookup<K, V>(
        &mut self,
        sql: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<K, Vec<V>>>
    where
        K: FromValue + Eq + Hash + 'static,
        V: FromValue + 'static,
    {
        if let Some(filter) = self.dispatch(sql) {
            let answer = filter.get_lookup(self, TypeTag::of::<K>(), TypeTag::of::<V>())?;
            return downcast(answer);
        }
        let reader = self.read(cancel).await?;
        materialize::lookup(reader, cancel)
    }
}
