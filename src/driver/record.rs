//! A single row of a query result.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::types::{Node, Path, Relationship, Value};

/// One record: the shared column names plus this row's values, in column
/// order.
#[derive(Debug, Clone)]
pub struct Record {
    keys: Arc<[String]>,
    values: Vec<Value>,
}

impl Record {
    pub(crate) fn new(keys: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { keys, values }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    /// Value under a column name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let index = self.keys.iter().position(|k| k == key)?;
        self.values.get(index)
    }

    /// Value at a column position.
    pub fn get_by_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value under a column name, converted to a concrete type.
    pub fn get_as<T>(&self, key: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let value = self
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Client(format!("no column named {key:?} in record")))?;
        T::try_from(value)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.get_as(key)
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        self.get_as(key)
    }

    pub fn get_float(&self, key: &str) -> Result<f64> {
        self.get_as(key)
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        self.get_as(key)
    }

    pub fn get_node(&self, key: &str) -> Result<Node> {
        self.get_as(key)
    }

    pub fn get_relationship(&self, key: &str) -> Result<Relationship> {
        self.get_as(key)
    }

    pub fn get_path(&self, key: &str) -> Result<Path> {
        self.get_as(key)
    }

    /// Value under a column name, where null maps to `None`.
    pub fn get_optional<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: TryFrom<Value, Error = Error>,
    {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::try_from(value.clone()).map(Some),
        }
    }

    /// Copy into a name → value map.
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.keys
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.keys.iter().zip(&self.values).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}: {value}")?;
        }
        write!(f, "}}")
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::iter::Zip<std::vec::IntoIter<String>, std::vec::IntoIter<Value>>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.to_vec().into_iter().zip(self.values)
    }
}
