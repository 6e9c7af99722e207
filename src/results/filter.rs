//! Interception targets.
//!
//! A `ResultsFilter` answers queries in place of the live driver. Its
//! capabilities are synchronous. Generic shapes are type-erased: the dispatch
//! layer passes `TypeTag`s describing the requested element types and
//! downcasts the returned `AnyValue` back to the concrete shape.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::db::{Command, Value};
use crate::error::{ExecError, Result};
use crate::materialize::{AnyRow, RowType};

/// A type-erased result returned by a generic capability.
pub type AnyValue = Box<dyn Any + Send>;

/// Identifies a requested element type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Recovers a concrete shape from a filter answer.
pub(crate) fn downcast<R: 'static>(value: AnyValue) -> Result<R> {
    value.downcast::<R>().map(|boxed| *boxed).map_err(|_| {
        ExecError::materialize(format!(
            "results filter returned a value that is not {}",
            std::any::type_name::<R>()
        ))
    })
}

fn unanswered(capability: &str, cmd: &Command) -> ExecError {
    ExecError::unsupported(format!(
        "results filter does not answer {capability} for '{}'",
        cmd.text()
    ))
}

/// An interception target that answers queries instead of the live driver.
///
/// Every capability has a default that reports it as unsupported, so targets
/// implement only the shapes they care about.
///
/// Generic capabilities must return the exact shape the dispatch layer
/// expects: `Option<T>` for `get_single`, `Vec<T>` for `get_list` and
/// `get_column`, `HashSet<T>` for `get_column_distinct`, `HashMap<K, V>` for
/// `get_dictionary` and `HashMap<K, Vec<V>>` for `get_lookup`.
///
/// The target consulted by a command is the one installed on its
/// [`ExecFilter`](crate::ExecFilter) when the command was created, not the one
/// installed when a result method runs. Installing or removing a target
/// affects commands created afterwards only.
pub trait ResultsFilter: Send + Sync {
    /// Affected row count of a non-query.
    fn execute_sql(&self, cmd: &Command) -> Result<u64> {
        Err(unanswered("execute_sql", cmd))
    }

    /// Scalar value; typed scalars are converted from it.
    fn get_scalar(&self, cmd: &Command) -> Result<Value> {
        Err(unanswered("get_scalar", cmd))
    }

    fn get_long_scalar(&self, cmd: &Command) -> Result<i64> {
        Err(unanswered("get_long_scalar", cmd))
    }

    fn get_single(&self, cmd: &Command, row: TypeTag) -> Result<AnyValue> {
        let _ = row;
        Err(unanswered("get_single", cmd))
    }

    fn get_ref_single(&self, cmd: &Command, row_type: &RowType) -> Result<Option<AnyRow>> {
        let _ = row_type;
        Err(unanswered("get_ref_single", cmd))
    }

    fn get_list(&self, cmd: &Command, row: TypeTag) -> Result<AnyValue> {
        let _ = row;
        Err(unanswered("get_list", cmd))
    }

    fn get_ref_list(&self, cmd: &Command, row_type: &RowType) -> Result<Vec<AnyRow>> {
        let _ = row_type;
        Err(unanswered("get_ref_list", cmd))
    }

    fn get_column(&self, cmd: &Command, value: TypeTag) -> Result<AnyValue> {
        let _ = value;
        Err(unanswered("get_column", cmd))
    }

    fn get_column_distinct(&self, cmd: &Command, value: TypeTag) -> Result<AnyValue> {
        let _ = value;
        Err(unanswered("get_column_distinct", cmd))
    }

    fn get_dictionary(&self, cmd: &Command, key: TypeTag, value: TypeTag) -> Result<AnyValue> {
        let _ = (key, value);
        Err(unanswered("get_dictionary", cmd))
    }

    fn get_lookup(&self, cmd: &Command, key: TypeTag, value: TypeTag) -> Result<AnyValue> {
        let _ = (key, value);
        Err(unanswered("get_lookup", cmd))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Shape {
    Single,
    List,
    RefSingle,
    RefList,
    Column,
    ColumnDistinct,
    Dictionary,
    Lookup,
}

type Producer = Arc<dyn Fn() -> AnyValue + Send + Sync>;
type ScalarFn = Arc<dyn Fn(&Command) -> Value + Send + Sync>;
type SqlCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A results filter with canned answers per shape and type.
///
/// Every intercepted command's SQL text is captured, which makes the stub
/// double as a query-introspection tool.
#[derive(Default)]
pub struct StubResultsFilter {
    scalar: Option<Value>,
    scalar_fn: Option<ScalarFn>,
    long_scalar: Option<i64>,
    rows_affected: Option<u64>,
    answers: HashMap<(Shape, TypeId, Option<TypeId>), Producer>,
    sql_callback: Option<SqlCallback>,
    print_sql: bool,
    captured: Mutex<Vec<String>>,
}

impl StubResultsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scalar(mut self, value: impl Into<Value>) -> Self {
        self.scalar = Some(value.into());
        self
    }

    /// Computes scalar answers from the intercepted command.
    pub fn with_scalar_fn(mut self, f: impl Fn(&Command) -> Value + Send + Sync + 'static) -> Self {
        self.scalar_fn = Some(Arc::new(f));
        self
    }

    pub fn with_long_scalar(mut self, value: i64) -> Self {
        self.long_scalar = Some(value);
        self
    }

    pub fn with_rows_affected(mut self, rows: u64) -> Self {
        self.rows_affected = Some(rows);
        self
    }

    pub fn with_single<T: Clone + Send + Sync + 'static>(self, row: Option<T>) -> Self {
        self.answer(Shape::Single, TypeId::of::<T>(), None, move || {
            Box::new(row.clone())
        })
    }

    pub fn with_list<T: Clone + Send + Sync + 'static>(self, rows: Vec<T>) -> Self {
        self.answer(Shape::List, TypeId::of::<T>(), None, move || {
            Box::new(rows.clone())
        })
    }

    /// Rows answered for runtime-typed requests whose row type is `T`.
    pub fn with_ref_list<T: Clone + Send + Sync + 'static>(self, rows: Vec<T>) -> Self {
        self.answer(Shape::RefList, TypeId::of::<T>(), None, move || {
            let erased: Vec<AnyRow> = rows
                .iter()
                .cloned()
                .map(|row| Box::new(row) as AnyRow)
                .collect();
            Box::new(erased)
        })
    }

    pub fn with_ref_single<T: Clone + Send + Sync + 'static>(self, row: Option<T>) -> Self {
        self.answer(Shape::RefSingle, TypeId::of::<T>(), None, move || {
            let erased: Option<AnyRow> = row.clone().map(|row| Box::new(row) as AnyRow);
            Box::new(erased)
        })
    }

    pub fn with_column<T: Clone + Send + Sync + 'static>(self, values: Vec<T>) -> Self {
        self.answer(Shape::Column, TypeId::of::<T>(), None, move || {
            Box::new(values.clone())
        })
    }

    pub fn with_column_distinct<T>(self, values: HashSet<T>) -> Self
    where
        T: Clone + Eq + Hash + Send + Sync + 'static,
    {
        self.answer(Shape::ColumnDistinct, TypeId::of::<T>(), None, move || {
            Box::new(values.clone())
        })
    }

    pub fn with_dictionary<K, V>(self, map: HashMap<K, V>) -> Self
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.answer(
            Shape::Dictionary,
            TypeId::of::<K>(),
            Some(TypeId::of::<V>()),
            move || Box::new(map.clone()),
        )
    }

    pub fn with_lookup<K, V>(self, map: HashMap<K, Vec<V>>) -> Self
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.answer(
            Shape::Lookup,
            TypeId::of::<K>(),
            Some(TypeId::of::<V>()),
            move || Box::new(map.clone()),
        )
    }

    /// Called with the SQL text of every intercepted command.
    pub fn with_sql_callback(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.sql_callback = Some(Arc::new(f));
        self
    }

    /// Logs the SQL text of every intercepted command at info level.
    pub fn with_print_sql(mut self) -> Self {
        self.print_sql = true;
        self
    }

    /// SQL text of every intercepted command, in order.
    pub fn captured_sql(&self) -> Vec<String> {
        self.captured
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn answer(
        mut self,
        shape: Shape,
        primary: TypeId,
        secondary: Option<TypeId>,
        producer: impl Fn() -> AnyValue + Send + Sync + 'static,
    ) -> Self {
        self.answers
            .insert((shape, primary, secondary), Arc::new(producer));
        self
    }

    fn observe(&self, cmd: &Command) {
        let sql = cmd.text();
        if self.print_sql {
            info!(sql, "intercepted command");
        }
        if let Some(callback) = &self.sql_callback {
            callback(sql);
        }
        if let Ok(mut captured) = self.captured.lock() {
            captured.push(sql.to_string());
        }
    }

    fn produce(
        &self,
        cmd: &Command,
        capability: &str,
        shape: Shape,
        primary: TypeId,
        secondary: Option<TypeId>,
    ) -> Result<AnyValue> {
        self.observe(cmd);
        self.answers
            .get(&(shape, primary, secondary))
            .map(|producer| producer())
            .ok_or_else(|| unanswered(capability, cmd))
    }
}

impl ResultsFilter for StubResultsFilter {
    fn execute_sql(&self, cmd: &Command) -> Result<u64> {
        self.observe(cmd);
        self.rows_affected
            .ok_or_else(|| unanswered("execute_sql", cmd))
    }

    fn get_scalar(&self, cmd: &Command) -> Result<Value> {
        self.observe(cmd);
        if let Some(f) = &self.scalar_fn {
            return Ok(f(cmd));
        }
        self.scalar
            .clone()
            .ok_or_else(|| unanswered("get_scalar", cmd))
    }

    fn get_long_scalar(&self, cmd: &Command) -> Result<i64> {
        self.observe(cmd);
        self.long_scalar
            .ok_or_else(|| unanswered("get_long_scalar", cmd))
    }

    fn get_single(&self, cmd: &Command, row: TypeTag) -> Result<AnyValue> {
        self.produce(cmd, "get_single", Shape::Single, row.id(), None)
    }

    fn get_ref_single(&self, cmd: &Command, row_type: &RowType) -> Result<Option<AnyRow>> {
        let value = self.produce(cmd, "get_ref_single", Shape::RefSingle, row_type.type_id(), None)?;
        downcast(value)
    }

    fn get_list(&self, cmd: &Command, row: TypeTag) -> Result<AnyValue> {
        self.produce(cmd, "get_list", Shape::List, row.id(), None)
    }

    fn get_ref_list(&self, cmd: &Command, row_type: &RowType) -> Result<Vec<AnyRow>> {
        let value = self.produce(cmd, "get_ref_list", Shape::RefList, row_type.type_id(), None)?;
        downcast(value)
    }

    fn get_column(&self, cmd: &Command, value: TypeTag) -> Result<AnyValue> {
        self.produce(cmd, "get_column", Shape::Column, value.id(), None)
    }

    fn get_column_distinct(&self, cmd: &Command, value: TypeTag) -> Result<AnyValue> {
        self.produce(cmd, "get_column_distinct", Shape::ColumnDistinct, value.id(), None)
    }

    fn get_dictionary(&self, cmd: &Command, key: TypeTag, value: TypeTag) -> Result<AnyValue> {
        self.produce(cmd, "get_dictionary", Shape::Dictionary, key.id(), Some(value.id()))
    }

    fn get_lookup(&self, cmd: &Command, key: TypeTag, value: TypeTag) -> Result<AnyValue> {
        self.produce(cmd, "get_lookup", Shape::Lookup, key.id(), Some(value.id()))
    }
}

impl fmt::Debug for StubResultsFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubResultsFilter")
            .field("scalar", &self.scalar)
            .field("long_scalar", &self.long_scalar)
            .field("rows_affected", &self.rows_affected)
            .field("answers", &self.answers.len())
            .finish()
    }
}
