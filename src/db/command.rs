//! The command context.
//!
//! A `Command` binds SQL text, parameters, transaction and timeout to one
//! driver-side command resource for the duration of a single execution.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::dialect::DialectProvider;
use super::{DriverCommand, Transaction, Value};
use crate::error::{ExecError, Result};
use crate::results::ResultsFilter;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// A single bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Parameter name, `None` for positional parameters.
    pub name: Option<String>,
    /// Bound value.
    pub value: Value,
}

/// Ordered parameter list of a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters(Vec<Parameter>);

impl Parameters {
    /// Creates an empty parameter list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional parameter.
    pub fn push_positional(&mut self, value: impl Into<Value>) {
        self.0.push(Parameter {
            name: None,
            value: value.into(),
        });
    }

    /// Appends a named parameter, replacing an existing one with the same name.
    pub fn push_named(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        if let Some(existing) = self
            .0
            .iter_mut()
            .find(|p| p.name.as_deref() == Some(name.as_str()))
        {
            existing.value = value;
        } else {
            self.0.push(Parameter {
                name: Some(name),
                value,
            });
        }
    }

    /// Looks up a named parameter.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
            .map(|p| &p.value)
    }

    /// Removes every parameter.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Parameter> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a Parameters {
    type Item = &'a Parameter;
    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The bindable part of a command, as seen by drivers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statement {
    /// SQL text to execute.
    pub text: String,
    /// Bound parameters.
    pub parameters: Parameters,
    /// Transaction the command participates in.
    pub transaction: Option<Transaction>,
    /// Command timeout; `None` leaves it to the driver.
    pub timeout: Option<Duration>,
}

/// A command context bound to one connection.
pub struct Command {
    id: u64,
    statement: Statement,
    dialect: Arc<dyn DialectProvider>,
    results_filter: Option<Arc<dyn ResultsFilter>>,
    driver: Box<dyn DriverCommand>,
    closed: bool,
}

impl Command {
    /// Wraps a driver command resource.
    pub fn new(driver: Box<dyn DriverCommand>, dialect: Arc<dyn DialectProvider>) -> Self {
        Self {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            statement: Statement::default(),
            dialect,
            results_filter: None,
            driver,
            closed: false,
        }
    }

    /// Process-unique id, used in log events.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.statement.text
    }

    /// Replaces the command text.
    pub fn set_text(&mut self, sql: impl Into<String>) {
        self.statement.text = sql.into();
    }

    pub fn parameters(&self) -> &Parameters {
        &self.statement.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.statement.parameters
    }

    /// Binds every entry of `params` as a named parameter.
    ///
    /// A non-empty map replaces the current parameters; keys are bound in
    /// sorted order so positional drivers see a stable layout. An empty map
    /// leaves the command untouched. Returns the number of bound parameters.
    pub fn set_named_parameters(&mut self, params: &HashMap<String, Value>) -> usize {
        if params.is_empty() {
            return 0;
        }
        let mut entries: Vec<_> = params.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let parameters = &mut self.statement.parameters;
        parameters.clear();
        for (name, value) in entries {
            parameters.push_named(name.clone(), value.clone());
        }
        parameters.len()
    }

    /// Binds the fields of a serializable struct as named parameters.
    ///
    /// The value must serialize to a map; fields are bound in name order.
    pub fn set_parameters_from<P>(&mut self, params: &P) -> Result<usize>
    where
        P: Serialize + ?Sized,
    {
        let json = serde_json::to_value(params)
            .map_err(|e| ExecError::command(format!("Cannot serialize parameters: {e}")))?;
        let serde_json::Value::Object(fields) = json else {
            return Err(ExecError::command(
                "Parameters must serialize to a map of named values",
            ));
        };

        let named: HashMap<String, Value> = fields
            .into_iter()
            .map(|(name, value)| (name, Value::from_json(value)))
            .collect();
        Ok(self.set_named_parameters(&named))
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.statement.transaction.as_ref()
    }

    pub fn set_transaction(&mut self, transaction: Option<Transaction>) {
        self.statement.transaction = transaction;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.statement.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.statement.timeout = timeout;
    }

    /// The dialect of the connection this command was created from.
    pub fn dialect(&self) -> &Arc<dyn DialectProvider> {
        &self.dialect
    }

    /// The interception target captured when the command was created.
    pub fn results_filter(&self) -> Option<Arc<dyn ResultsFilter>> {
        self.results_filter.clone()
    }

    pub fn set_results_filter(&mut self, filter: Option<Arc<dyn ResultsFilter>>) {
        self.results_filter = filter;
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    /// The driver-side command resource.
    pub fn driver(&self) -> &dyn DriverCommand {
        self.driver.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Releases the driver resource. Later calls are no-ops.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.driver.close();
        }
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("statement", &self.statement)
            .field("dialect", &self.dialect.name())
            .field("intercepted", &self.results_filter.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}
