//! # Configuration Binding Store
//!
//! Every configurable value in the harness is addressed by a key of the form
//! `"{ClassName}.{param}"`, optionally qualified with a scope as
//! `"{scope}/{ClassName}.{param}"`. The store is an explicit value that is passed down
//! the call chain; nothing in the crate reads configuration from global state.
//!
//! Scoped bindings live in their own override layer and are only visible while that
//! scope is active. Lookups resolve from the innermost active scope outwards and fall
//! back to the unscoped base layer. Later binds for the same key overwrite earlier ones,
//! which is what allows fixed parameters to be bound first and tuned parameters to be
//! rebound on every tuning iteration.
//!
//! Configuration files are TOML. Nested tables flatten into dotted keys, so
//!
//! ```toml
//! [LogisticClassifier]
//! max_iter = 50
//!
//! ["logreg/hyperparameter"]
//! class_to_tune = "LogisticClassifier"
//! l2 = [1e-4, 10.0, "log-uniform"]
//! ```
//!
//! yields the base binding `LogisticClassifier.max_iter` and the binding
//! `hyperparameter.l2` inside the `logreg` scope.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use thiserror::Error;

/// A single bound value.
///
/// The untagged representation keeps the on-disk form natural in both TOML and JSON:
/// `5` stays an integer, `5.0` a float, and lists nest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    /// Numeric view of the value. Integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            Self::List(values) => Some(values),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
            Self::List(values) => write!(f, "[{}]", values.iter().join(", ")),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<ParamValue>> for ParamValue {
    fn from(values: Vec<ParamValue>) -> Self {
        Self::List(values)
    }
}

/// Errors raised while loading, querying, or saving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize bindings to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Binding '{key}' holds a TOML {found}, which cannot be bound to a parameter.")]
    UnsupportedValue { key: String, found: String },
    #[error("Binding '{key}' expected a {expected} value but found '{found}'.")]
    WrongType {
        key: String,
        expected: &'static str,
        found: String,
    },
    #[error("Required binding '{0}' is missing from the configuration.")]
    MissingBinding(String),
}

/// Conversion from a bound value into a concrete Rust type.
pub trait FromParam: Sized {
    /// Human-readable name of the expected type, used in error messages.
    const EXPECTED: &'static str;

    fn from_param(value: &ParamValue) -> Option<Self>;
}

impl FromParam for ParamValue {
    const EXPECTED: &'static str = "any";

    fn from_param(value: &ParamValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromParam for f64 {
    const EXPECTED: &'static str = "numeric";

    fn from_param(value: &ParamValue) -> Option<Self> {
        value.as_f64()
    }
}

impl FromParam for i64 {
    const EXPECTED: &'static str = "integer";

    fn from_param(value: &ParamValue) -> Option<Self> {
        value.as_i64()
    }
}

impl FromParam for usize {
    const EXPECTED: &'static str = "non-negative integer";

    fn from_param(value: &ParamValue) -> Option<Self> {
        value.as_i64().and_then(|v| usize::try_from(v).ok())
    }
}

impl FromParam for u64 {
    const EXPECTED: &'static str = "non-negative integer";

    fn from_param(value: &ParamValue) -> Option<Self> {
        value.as_i64().and_then(|v| u64::try_from(v).ok())
    }
}

impl FromParam for bool {
    const EXPECTED: &'static str = "bool";

    fn from_param(value: &ParamValue) -> Option<Self> {
        value.as_bool()
    }
}

impl FromParam for String {
    const EXPECTED: &'static str = "string";

    fn from_param(value: &ParamValue) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromParam for Vec<String> {
    const EXPECTED: &'static str = "list of strings";

    fn from_param(value: &ParamValue) -> Option<Self> {
        value
            .as_list()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }
}

/// The layered binding store.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    base: BTreeMap<String, ParamValue>,
    scoped: BTreeMap<String, BTreeMap<String, ParamValue>>,
    active: Vec<String>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document into a store, flattening nested tables into dotted keys.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(text)?;
        let mut store = Self::new();
        store.extend_from_table(None, table)?;
        Ok(store)
    }

    /// Loads a store from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    fn extend_from_table(
        &mut self,
        prefix: Option<&str>,
        table: toml::Table,
    ) -> Result<(), ConfigError> {
        for (name, value) in table {
            let key = match prefix {
                Some(prefix) => format!("{prefix}.{name}"),
                None => name,
            };
            match value {
                toml::Value::Table(nested) => self.extend_from_table(Some(&key), nested)?,
                other => {
                    let value = param_from_toml(&key, other)?;
                    self.bind(&key, value);
                }
            }
        }
        Ok(())
    }

    /// Binds `key` to `value`, overwriting any earlier binding of the same key.
    ///
    /// A key of the form `scope/name` writes into that scope's override layer; any other
    /// key writes into the base layer regardless of which scopes are active.
    pub fn bind(&mut self, key: &str, value: impl Into<ParamValue>) {
        let value = value.into();
        match split_scope(key) {
            (Some(scope), name) => {
                self.scoped
                    .entry(scope.to_string())
                    .or_default()
                    .insert(name.to_string(), value);
            }
            (None, name) => {
                self.base.insert(name.to_string(), value);
            }
        }
    }

    /// Resolves `key` through the active scopes (innermost first) and the base layer.
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        if let (Some(scope), name) = split_scope(key) {
            return self.scoped.get(scope)?.get(name);
        }
        self.active
            .iter()
            .rev()
            .find_map(|scope| self.scoped.get(scope).and_then(|layer| layer.get(key)))
            .or_else(|| self.base.get(key))
    }

    /// Whether `key` is present in the resolved configuration.
    pub fn is_bound(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get_as<T: FromParam>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => T::from_param(value)
                .map(Some)
                .ok_or_else(|| ConfigError::WrongType {
                    key: key.to_string(),
                    expected: T::EXPECTED,
                    found: value.to_string(),
                }),
        }
    }

    pub fn get_or<T: FromParam>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.get_as(key)?.unwrap_or(default))
    }

    pub fn require<T: FromParam>(&self, key: &str) -> Result<T, ConfigError> {
        self.get_as(key)?
            .ok_or_else(|| ConfigError::MissingBinding(key.to_string()))
    }

    /// Enters `scope` until the returned guard is dropped.
    pub fn scoped(&mut self, scope: &str) -> ScopeGuard<'_> {
        self.active.push(scope.to_string());
        ScopeGuard { store: self }
    }

    pub fn active_scopes(&self) -> &[String] {
        &self.active
    }

    /// All resolved bindings whose key starts with `prefix`, with scope overrides applied.
    pub fn resolved_with_prefix(&self, prefix: &str) -> BTreeMap<String, ParamValue> {
        let mut resolved: BTreeMap<String, ParamValue> = self
            .base
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for scope in &self.active {
            if let Some(layer) = self.scoped.get(scope) {
                for (key, value) in layer.iter().filter(|(key, _)| key.starts_with(prefix)) {
                    resolved.insert(key.clone(), value.clone());
                }
            }
        }
        resolved
    }

    /// Every binding in the store, scoped ones written as `scope/name`.
    pub fn bindings(&self) -> BTreeMap<String, ParamValue> {
        let mut all = self.base.clone();
        for (scope, layer) in &self.scoped {
            for (name, value) in layer {
                all.insert(format!("{scope}/{name}"), value.clone());
            }
        }
        all
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&self.bindings())?)
    }

    /// Writes every binding to a TOML file that [`ConfigStore::load`] reads back.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = self.to_toml_string()?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }
}

/// RAII handle for an active scope; the scope is left when the guard drops.
pub struct ScopeGuard<'a> {
    store: &'a mut ConfigStore,
}

impl Deref for ScopeGuard<'_> {
    type Target = ConfigStore;

    fn deref(&self) -> &Self::Target {
        self.store
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.store
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.store.active.pop();
    }
}

fn split_scope(key: &str) -> (Option<&str>, &str) {
    match key.rfind('/') {
        Some(idx) => (Some(&key[..idx]), &key[idx + 1..]),
        None => (None, key),
    }
}

fn param_from_toml(key: &str, value: toml::Value) -> Result<ParamValue, ConfigError> {
    match value {
        toml::Value::Boolean(v) => Ok(ParamValue::Bool(v)),
        toml::Value::Integer(v) => Ok(ParamValue::Int(v)),
        toml::Value::Float(v) => Ok(ParamValue::Float(v)),
        toml::Value::String(v) => Ok(ParamValue::Str(v)),
        toml::Value::Array(values) => values
            .into_iter()
            .map(|v| param_from_toml(key, v))
            .collect::<Result<Vec<_>, _>>()
            .map(ParamValue::List),
        other => Err(ConfigError::UnsupportedValue {
            key: key.to_string(),
            found: other.type_str().to_string(),
        }),
    }
}
