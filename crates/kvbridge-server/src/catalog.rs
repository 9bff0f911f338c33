//! Key catalog: which datastore keys exist, who may read or write them,
//! and what shape their values take.
//!
//! Loaded once from a JSON file:
//!
//! ```json
//! {
//!   "schema_version": "1.0.0",
//!   "namespace": "robot",
//!   "datastore_keys": {
//!     "robot_position": {
//!       "type": "Vector3d",
//!       "access": {"rt_read": true, "rt_write": true, "nonrt_read": true, "nonrt_write": false},
//!       "hot_key": true
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Failures while loading the catalog file.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// File could not be read.
    #[error("failed to read key catalog {path}: {source}")]
    Io {
        /// Catalog path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// File is not a valid catalog document.
    #[error("invalid key catalog: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a value was rejected for a key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The key is not in the catalog.
    #[error("key '{0}' not found in schema")]
    UnknownKey(String),

    /// The value does not match the declared type.
    #[error("type mismatch for key '{key}': expected {expected}")]
    TypeMismatch {
        /// Key being written.
        key: String,
        /// Declared type string.
        expected: String,
    },
}

/// Per-key permission flags. Anything omitted is denied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessFlags {
    /// Real-time read.
    pub rt_read: bool,
    /// Real-time write.
    pub rt_write: bool,
    /// Read through this bridge.
    pub nonrt_read: bool,
    /// Write through this bridge.
    pub nonrt_write: bool,
}

/// Metadata for one key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyDefinition {
    /// Declared value type, e.g. `double` or `array<double, 64>`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Permissions.
    #[serde(default)]
    pub access: AccessFlags,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Updated at high frequency.
    #[serde(default)]
    pub hot_key: bool,
    /// Value the datastore starts with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

#[derive(Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    schema_version: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    datastore_keys: BTreeMap<String, KeyDefinition>,
}

/// Read-only view over the key catalog.
#[derive(Clone, Debug, Default)]
pub struct KeyCatalog {
    schema_version: Option<String>,
    namespace: Option<String>,
    keys: BTreeMap<String, KeyDefinition>,
}

impl KeyCatalog {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_json_str(&raw)?;
        info!(
            path = %path.display(),
            keys = catalog.keys.len(),
            schema_version = catalog.schema_version(),
            namespace = catalog.namespace(),
            "key catalog loaded"
        );
        Ok(catalog)
    }

    /// Parse a catalog document.
    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let doc: CatalogDocument = serde_json::from_str(raw)?;
        Ok(Self {
            schema_version: doc.schema_version,
            namespace: doc.namespace,
            keys: doc.datastore_keys,
        })
    }

    /// Whether `key` is cataloged.
    pub fn has_key(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Metadata for `key`.
    pub fn get(&self, key: &str) -> Option<&KeyDefinition> {
        self.keys.get(key)
    }

    /// All key names, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }

    /// Number of cataloged keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the catalog has no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Readable through the bridge.
    pub fn can_read(&self, key: &str) -> bool {
        self.get(key).is_some_and(|def| def.access.nonrt_read)
    }

    /// Writable through the bridge.
    pub fn can_write(&self, key: &str) -> bool {
        self.get(key).is_some_and(|def| def.access.nonrt_write)
    }

    /// Flagged as high-frequency.
    pub fn is_hot_key(&self, key: &str) -> bool {
        self.get(key).is_some_and(|def| def.hot_key)
    }

    /// Catalog version, `"unknown"` when absent.
    pub fn schema_version(&self) -> &str {
        self.schema_version.as_deref().unwrap_or("unknown")
    }

    /// Catalog namespace, `"default"` when absent.
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("default")
    }

    /// Check `value` against the declared type of `key`.
    pub fn validate(&self, key: &str, value: &Value) -> Result<(), ValidationError> {
        let def = self
            .get(key)
            .ok_or_else(|| ValidationError::UnknownKey(key.to_string()))?;
        if ValueType::parse(&def.type_name).accepts(value) {
            Ok(())
        } else {
            Err(ValidationError::TypeMismatch {
                key: key.to_string(),
                expected: def.type_name.clone(),
            })
        }
    }
}

/// Parsed form of a declared type string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueType {
    /// `double`, `float`.
    Number,
    /// `int`, `int32`, `int64`.
    Integer,
    /// `uint`, `uint32`, `uint64`.
    Unsigned,
    /// `string`.
    String,
    /// `bool`, `boolean`.
    Bool,
    /// Three numbers.
    Vector3d,
    /// `array<T, N>` or `std::array<T, N>`.
    FixedArray(Box<ValueType>, usize),
    /// `vector<T>` or `std::vector<T>`.
    List(Box<ValueType>),
    /// Unrecognized; accepts anything.
    Any,
}

impl ValueType {
    /// Parse a type string. Unrecognized types become [`ValueType::Any`].
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw {
            "double" | "float" => return Self::Number,
            "int" | "int32" | "int64" => return Self::Integer,
            "uint" | "uint32" | "uint64" => return Self::Unsigned,
            "string" => return Self::String,
            "bool" | "boolean" => return Self::Bool,
            "Vector3d" => return Self::Vector3d,
            _ => {}
        }

        let unqualified = raw.strip_prefix("std::").unwrap_or(raw);
        if let Some(args) = generic_args(unqualified, "array") {
            return match args.rsplit_once(',') {
                Some((element, len)) => match len.trim().parse::<usize>() {
                    Ok(len) => Self::FixedArray(Box::new(Self::parse(element)), len),
                    Err(_) => Self::Any,
                },
                None => Self::Any,
            };
        }
        if let Some(element) = generic_args(unqualified, "vector") {
            return Self::List(Box::new(Self::parse(element)));
        }
        Self::Any
    }

    /// Whether `value` conforms.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Number => value.is_number(),
            Self::Integer => is_integer(value),
            Self::Unsigned => {
                is_integer(value) && value.as_f64().is_some_and(|n| n >= 0.0)
            }
            Self::String => value.is_string(),
            Self::Bool => value.is_boolean(),
            Self::Vector3d => value
                .as_array()
                .is_some_and(|items| items.len() == 3 && items.iter().all(Value::is_number)),
            Self::FixedArray(element, len) => value.as_array().is_some_and(|items| {
                items.len() == *len && items.iter().all(|item| element.accepts(item))
            }),
            Self::List(element) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|item| element.accepts(item))),
            Self::Any => true,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number => f.write_str("number"),
            Self::Integer => f.write_str("integer"),
            Self::Unsigned => f.write_str("unsigned integer"),
            Self::String => f.write_str("string"),
            Self::Bool => f.write_str("boolean"),
            Self::Vector3d => f.write_str("Vector3d"),
            Self::FixedArray(element, len) => write!(f, "array<{element}, {len}>"),
            Self::List(element) => write!(f, "vector<{element}>"),
            Self::Any => f.write_str("any"),
        }
    }
}

/// `name<args>` -> `args`.
fn generic_args<'a>(raw: &'a str, name: &str) -> Option<&'a str> {
    raw.strip_prefix(name)?
        .trim_start()
        .strip_prefix('<')?
        .strip_suffix('>')
}

fn is_integer(value: &Value) -> bool {
    if value.is_i64() || value.is_u64() {
        return true;
    }
    value
        .as_f64()
        .is_some_and(|n| n.is_finite() && n.fract() == 0.0)
}
