//! Row-to-type materialization.
//!
//! Converts a buffered `ResultSet` into the result shapes the dispatch layer
//! returns. Every converter checks the cancellation token once per row, so a
//! cancelled call stops part-way through a large result set.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use tokio_util::sync::CancellationToken;

use crate::db::{ColumnInfo, ResultSet, Value};
use crate::error::{ExecError, Result};

/// A row of a runtime-selected type.
pub type AnyRow = Box<dyn Any + Send>;

/// Conversion from a single cell.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch<T>(value: &Value) -> ExecError {
    ExecError::materialize(format!(
        "cannot convert {} value '{}' to {}",
        value.kind(),
        value,
        std::any::type_name::<T>()
    ))
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int(i) => Ok(i),
            Value::Bool(b) => Ok(b as i64),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
            Value::String(ref s) => s.trim().parse().map_err(|_| mismatch::<i64>(&value)),
            other => Err(mismatch::<i64>(&other)),
        }
    }
}

macro_rules! narrow_int {
    ($($ty:ty),*) => {$(
        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self> {
                let wide = i64::from_value(value.clone())?;
                <$ty>::try_from(wide).map_err(|_| mismatch::<$ty>(&value))
            }
        }
    )*};
}

narrow_int!(i32, i16, u32, u64);

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Float(f) => Ok(f),
            Value::Int(i) => Ok(i as f64),
            Value::String(ref s) => s.trim().parse().map_err(|_| mismatch::<f64>(&value)),
            other => Err(mismatch::<f64>(&other)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            Value::Int(0) => Ok(false),
            Value::Int(1) => Ok(true),
            Value::String(ref s) => match s.to_ascii_lowercase().as_str() {
                "t" | "true" => Ok(true),
                "f" | "false" => Ok(false),
                _ => Err(mismatch::<bool>(&value)),
            },
            other => Err(mismatch::<bool>(&other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => Ok(value.to_display_string()),
            other => Err(mismatch::<String>(&other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b),
            Value::String(s) => Ok(s.into_bytes()),
            other => Err(mismatch::<Vec<u8>>(&other)),
        }
    }
}

/// Borrowed view of one row with its column metadata.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [ColumnInfo],
    values: &'a [Value],
}

impl<'a> RowRef<'a> {
    pub fn new(columns: &'a [ColumnInfo], values: &'a [Value]) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &'a [ColumnInfo] {
        self.columns
    }

    /// Reads the cell at `index`.
    pub fn get_at<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.values.get(index).ok_or_else(|| {
            ExecError::materialize(format!(
                "row has {} columns, no column at index {index}",
                self.values.len()
            ))
        })?;
        T::from_value(value.clone())
    }

    /// Reads the cell of the named column (case-insensitive).
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))
            .ok_or_else(|| ExecError::materialize(format!("no column named '{column}'")))?;
        self.get_at(index)
    }
}

/// Conversion from a whole row.
pub trait FromRow: Sized {
    fn from_row(row: &RowRef<'_>) -> Result<Self>;
}

impl FromRow for Vec<Value> {
    fn from_row(row: &RowRef<'_>) -> Result<Self> {
        Ok(row.values.to_vec())
    }
}

macro_rules! tuple_from_row {
    ($($idx:tt $name:ident),+) => {
        impl<$($name: FromValue),+> FromRow for ($($name,)+) {
            fn from_row(row: &RowRef<'_>) -> Result<Self> {
                Ok(($(row.get_at::<$name>($idx)?,)+))
            }
        }
    };
}

tuple_from_row!(0 A);
tuple_from_row!(0 A, 1 B);
tuple_from_row!(0 A, 1 B, 2 C);
tuple_from_row!(0 A, 1 B, 2 C, 3 D);

/// A row keyed by column name, for callers without a target type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }
}

impl FromRow for Record {
    fn from_row(row: &RowRef<'_>) -> Result<Self> {
        let fields = row
            .columns
            .iter()
            .zip(row.values)
            .map(|(col, value)| (col.name.clone(), value.clone()))
            .collect();
        Ok(Self { fields })
    }
}

/// Runtime descriptor of a row type.
///
/// Lets callers pick the materialization target at run time; rows come back
/// as `AnyRow` and can be downcast to the described type.
#[derive(Clone, Copy)]
pub struct RowType {
    name: &'static str,
    type_id: TypeId,
    convert: fn(&RowRef<'_>) -> Result<AnyRow>,
}

impl RowType {
    pub fn of<T: FromRow + Send + 'static>() -> Self {
        fn convert<T: FromRow + Send + 'static>(row: &RowRef<'_>) -> Result<AnyRow> {
            Ok(Box::new(T::from_row(row)?))
        }

        Self {
            name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            convert: convert::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn convert(&self, row: &RowRef<'_>) -> Result<AnyRow> {
        (self.convert)(row)
    }
}

impl fmt::Debug for RowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RowType").field(&self.name).finish()
    }
}

impl PartialEq for RowType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

/// Row types registered under caller-chosen names.
#[derive(Debug, Clone, Default)]
pub struct RowTypeRegistry {
    types: HashMap<String, RowType>,
}

impl RowTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `name`, replacing any earlier registration.
    pub fn register<T: FromRow + Send + 'static>(&mut self, name: impl Into<String>) -> RowType {
        let row_type = RowType::of::<T>();
        self.types.insert(name.into(), row_type);
        row_type
    }

    pub fn get(&self, name: &str) -> Option<RowType> {
        self.types.get(name).copied()
    }

    /// Like [`get`](Self::get), but an unknown name is an error.
    pub fn resolve(&self, name: &str) -> Result<RowType> {
        self.get(name)
            .ok_or_else(|| ExecError::materialize(format!("no row type registered as '{name}'")))
    }
}

fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ExecError::Cancelled)
    } else {
        Ok(())
    }
}

fn first_cell(row: Vec<Value>) -> Value {
    row.into_iter().next().unwrap_or(Value::Null)
}

fn pair<K: FromValue, V: FromValue>(row: Vec<Value>) -> Result<(K, V)> {
    if row.len() < 2 {
        return Err(ExecError::materialize(format!(
            "expected a two-column result, row has {} columns",
            row.len()
        )));
    }
    let mut cells = row.into_iter();
    let key = K::from_value(cells.next().unwrap_or_default())?;
    let value = V::from_value(cells.next().unwrap_or_default())?;
    Ok((key, value))
}

/// Every row as `T`, in read order.
pub fn convert_to_list<T: FromRow>(rs: ResultSet, cancel: &CancellationToken) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(rs.rows.len());
    for row in &rs.rows {
        check(cancel)?;
        out.push(T::from_row(&RowRef::new(&rs.columns, row))?);
    }
    Ok(out)
}

/// Every row as the runtime-selected type.
pub fn convert_to_list_of(
    rs: ResultSet,
    row_type: &RowType,
    cancel: &CancellationToken,
) -> Result<Vec<AnyRow>> {
    let mut out = Vec::with_capacity(rs.rows.len());
    for row in &rs.rows {
        check(cancel)?;
        out.push(row_type.convert(&RowRef::new(&rs.columns, row))?);
    }
    Ok(out)
}

/// The first row as `T`, `None` when the result is empty.
pub fn convert_to<T: FromRow>(rs: ResultSet, cancel: &CancellationToken) -> Result<Option<T>> {
    check(cancel)?;
    rs.rows
        .first()
        .map(|row| T::from_row(&RowRef::new(&rs.columns, row)))
        .transpose()
}

/// The first row as the runtime-selected type.
pub fn convert_to_of(
    rs: ResultSet,
    row_type: &RowType,
    cancel: &CancellationToken,
) -> Result<Option<AnyRow>> {
    check(cancel)?;
    rs.rows
        .first()
        .map(|row| row_type.convert(&RowRef::new(&rs.columns, row)))
        .transpose()
}

/// First column of the first row; an empty result reads as `Value::Null`.
pub fn scalar<T: FromValue>(rs: ResultSet, cancel: &CancellationToken) -> Result<T> {
    check(cancel)?;
    let value = rs.rows.into_iter().next().map(first_cell).unwrap_or_default();
    T::from_value(value)
}

/// Converts a scalar to a 64-bit count; NULL counts as zero.
pub fn long_scalar(value: Value) -> Result<i64> {
    match value {
        Value::Null => Ok(0),
        other => i64::from_value(other),
    }
}

/// The first column of every row.
pub fn column<T: FromValue>(rs: ResultSet, cancel: &CancellationToken) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(rs.rows.len());
    for row in rs.rows {
        check(cancel)?;
        out.push(T::from_value(first_cell(row))?);
    }
    Ok(out)
}

/// The distinct values of the first column.
pub fn column_distinct<T>(rs: ResultSet, cancel: &CancellationToken) -> Result<HashSet<T>>
where
    T: FromValue + Eq + Hash,
{
    let mut out = HashSet::new();
    for row in rs.rows {
        check(cancel)?;
        out.insert(T::from_value(first_cell(row))?);
    }
    Ok(out)
}

/// Maps column 0 to column 1; a repeated key keeps the last value read.
pub fn dictionary<K, V>(rs: ResultSet, cancel: &CancellationToken) -> Result<HashMap<K, V>>
where
    K: FromValue + Eq + Hash,
    V: FromValue,
{
    let mut out = HashMap::new();
    for row in rs.rows {
        check(cancel)?;
        let (key, value) = pair::<K, V>(row)?;
        out.insert(key, value);
    }
    Ok(out)
}

/// Groups column 1 by column 0, keeping read order within each group.
pub fn lookup<K, V>(rs: ResultSet, cancel: &CancellationToken) -> Result<HashMap<K, Vec<V>>>
where
    K: FromValue + Eq + Hash,
    V: FromValue,
{
    let mut out: HashMap<K, Vec<V>> = HashMap::new();
    for row in rs.rows {
        check(cancel)?;
        let (key, value) = pair::<K, V>(row)?;
        out.entry(key).or_default().push(value);
    }
    Ok(out)
}
