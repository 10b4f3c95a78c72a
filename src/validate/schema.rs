//! Schema definitions and the schema catalog.

use crate::error::{Result, StoreError};
use crate::types::is_internal_schema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

fn default_schema_version() -> String {
    "1.0".to_string()
}

/// Target of a foreign key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyTarget {
    pub schema_key: String,
    pub properties: Vec<String>,
}

/// Properties whose values must match a live entity of another schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub properties: Vec<String>,
    pub references: ForeignKeyTarget,
}

impl ForeignKey {
    pub fn new<P, R>(properties: P, schema_key: impl Into<String>, referenced: R) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            properties: properties.into_iter().map(Into::into).collect(),
            references: ForeignKeyTarget {
                schema_key: schema_key.into(),
                properties: referenced.into_iter().map(Into::into).collect(),
            },
        }
    }
}

/// Constraints of an entity schema. Property paths are JSON pointers (`/a/b`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub key: String,
    #[serde(default = "default_schema_version")]
    pub version: String,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub unique: Vec<Vec<String>>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl SchemaDefinition {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: default_schema_version(),
            primary_key: Vec::new(),
            unique: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_primary_key<I>(mut self, properties: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.primary_key = properties.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_unique<I>(mut self, properties: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.unique.push(properties.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Entity id derived from the primary key values, joined with `~`.
    ///
    /// `None` when the schema has no primary key or a value is missing.
    pub fn derive_entity_id(&self, content: &Value) -> Option<String> {
        if self.primary_key.is_empty() {
            return None;
        }
        let values = property_values(content, &self.primary_key)?;
        let parts: Vec<String> = values
            .iter()
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        Some(parts.join("~"))
    }

    /// Reject definitions that cannot be enforced.
    pub fn check(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(StoreError::InvalidMutation("schema key is empty".into()));
        }
        if is_internal_schema(&self.key) {
            return Err(StoreError::InvalidMutation(format!(
                "schema key '{}' is reserved",
                self.key
            )));
        }
        for foreign_key in &self.foreign_keys {
            if foreign_key.properties.is_empty()
                || foreign_key.properties.len() != foreign_key.references.properties.len()
            {
                return Err(StoreError::InvalidMutation(format!(
                    "foreign key {:?} of '{}' does not match {:?} of '{}'",
                    foreign_key.properties,
                    self.key,
                    foreign_key.references.properties,
                    foreign_key.references.schema_key
                )));
            }
        }
        if self.unique.iter().any(Vec::is_empty) {
            return Err(StoreError::InvalidMutation(format!(
                "schema '{}' declares an empty unique constraint",
                self.key
            )));
        }
        Ok(())
    }
}

/// Values at the given paths. `None` if any is missing or null.
pub fn property_values(content: &Value, paths: &[String]) -> Option<Vec<Value>> {
    paths
        .iter()
        .map(|path| {
            let value = if path.starts_with('/') {
                content.pointer(path)
            } else {
                content.pointer(&format!("/{}", path))
            };
            value.filter(|v| !v.is_null()).cloned()
        })
        .collect()
}

/// Registered schemas by key; the latest registration wins.
#[derive(Default)]
pub struct SchemaCatalog {
    schemas: BTreeMap<String, SchemaDefinition>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: SchemaDefinition) -> Option<SchemaDefinition> {
        self.schemas.insert(schema.key.clone(), schema)
    }

    pub fn remove(&mut self, key: &str) -> Option<SchemaDefinition> {
        self.schemas.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&SchemaDefinition> {
        self.schemas.get(key)
    }

    /// All schemas ordered by key.
    pub fn list(&self) -> Vec<SchemaDefinition> {
        self.schemas.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn clear(&mut self) {
        self.schemas.clear();
    }
}
