//! Constraint checks for mutations.

use super::schema::{property_values, SchemaCatalog, SchemaDefinition};
use crate::error::{Result, StoreError};
use crate::state::StateReader;
use crate::types::{is_internal_schema, EntityKey, Mutation, MutationKind, StateRow, VersionId};
use serde_json::Value;

/// State a mutation is validated against.
pub trait StateView {
    /// Raw row of an entity as seen from a version (tombstones included).
    fn resolve(&self, version_id: VersionId, key: &EntityKey) -> Result<Option<StateRow>>;

    /// Live rows of a schema visible from a version.
    fn live_rows(&self, version_id: VersionId, schema_key: &str) -> Result<Vec<StateRow>>;
}

impl StateView for StateReader<'_> {
    fn resolve(&self, version_id: VersionId, key: &EntityKey) -> Result<Option<StateRow>> {
        StateReader::resolve(self, version_id, key)
    }

    fn live_rows(&self, version_id: VersionId, schema_key: &str) -> Result<Vec<StateRow>> {
        StateReader::live_rows(self, version_id, schema_key)
    }
}

/// Checks mutations against registered schemas.
pub struct Validator<'a> {
    catalog: &'a SchemaCatalog,
}

impl<'a> Validator<'a> {
    pub fn new(catalog: &'a SchemaCatalog) -> Self {
        Self { catalog }
    }

    /// Validate a mutation and return the key of the entity it writes.
    pub fn validate(&self, mutation: &Mutation, view: &dyn StateView) -> Result<EntityKey> {
        if is_internal_schema(&mutation.schema_key) {
            return Err(StoreError::InvalidMutation(format!(
                "schema key '{}' is reserved",
                mutation.schema_key
            )));
        }

        let schema = self
            .catalog
            .get(&mutation.schema_key)
            .ok_or_else(|| StoreError::SchemaNotFound(mutation.schema_key.clone()))?;

        if mutation.kind == MutationKind::Delete {
            let entity_id = mutation.entity_id.clone().ok_or_else(|| {
                StoreError::InvalidMutation("delete needs an entity id".into())
            })?;
            return Ok(EntityKey::new(entity_id, &mutation.schema_key, &mutation.file_id));
        }

        let content = match &mutation.content {
            Some(Value::Null) | None => {
                return Err(StoreError::InvalidMutation(
                    "insert and upsert need content; use delete to remove an entity".into(),
                ))
            }
            Some(content) => content,
        };

        let key = EntityKey::new(
            self.entity_id(schema, mutation, content)?,
            &mutation.schema_key,
            &mutation.file_id,
        );

        if mutation.kind == MutationKind::Insert {
            let existing = view.resolve(mutation.version_id, &key)?;
            if existing.map_or(false, |row| !row.is_tombstone()) {
                return Err(StoreError::PrimaryKeyViolation {
                    schema_key: key.schema_key.clone(),
                    entity_id: key.entity_id.clone(),
                    properties: schema.primary_key.clone(),
                });
            }
        }

        self.check_unique(schema, mutation.version_id, &key, content, view)?;
        self.check_foreign_keys(schema, mutation.version_id, &key, content, view)?;

        Ok(key)
    }

    fn entity_id(
        &self,
        schema: &SchemaDefinition,
        mutation: &Mutation,
        content: &Value,
    ) -> Result<String> {
        if schema.primary_key.is_empty() {
            return mutation.entity_id.clone().ok_or_else(|| {
                StoreError::InvalidMutation(format!(
                    "schema '{}' has no primary key; an entity id is required",
                    schema.key
                ))
            });
        }

        let derived = schema.derive_entity_id(content).ok_or_else(|| {
            StoreError::InvalidMutation(format!(
                "content is missing primary key {:?} of '{}'",
                schema.primary_key, schema.key
            ))
        })?;

        match &mutation.entity_id {
            Some(given) if *given != derived => Err(StoreError::InvalidMutation(format!(
                "entity id '{}' does not match primary key value '{}'",
                given, derived
            ))),
            _ => Ok(derived),
        }
    }

    fn check_unique(
        &self,
        schema: &SchemaDefinition,
        version_id: VersionId,
        key: &EntityKey,
        content: &Value,
        view: &dyn StateView,
    ) -> Result<()> {
        if schema.unique.is_empty() {
            return Ok(());
        }

        let mut rows: Option<Vec<StateRow>> = None;

        for properties in &schema.unique {
            let Some(values) = property_values(content, properties) else {
                continue;
            };

            if rows.is_none() {
                rows = Some(view.live_rows(version_id, &schema.key)?);
            }
            let clash = rows.iter().flatten().find(|row| {
                row.key() != *key
                    && row
                        .snapshot_content
                        .as_ref()
                        .and_then(|other| property_values(other, properties))
                        .map_or(false, |other| other == values)
            });

            if let Some(existing) = clash {
                return Err(StoreError::UniqueViolation {
                    schema_key: key.schema_key.clone(),
                    entity_id: key.entity_id.clone(),
                    properties: properties.clone(),
                    existing_entity_id: existing.entity_id.clone(),
                });
            }
        }

        Ok(())
    }

    fn check_foreign_keys(
        &self,
        schema: &SchemaDefinition,
        version_id: VersionId,
        key: &EntityKey,
        content: &Value,
        view: &dyn StateView,
    ) -> Result<()> {
        for foreign_key in &schema.foreign_keys {
            let Some(values) = property_values(content, &foreign_key.properties) else {
                continue;
            };
            let target = &foreign_key.references;

            // An entity may reference itself.
            let self_reference = target.schema_key == schema.key
                && property_values(content, &target.properties).as_ref() == Some(&values);
            if self_reference {
                continue;
            }

            let found = view
                .live_rows(version_id, &target.schema_key)?
                .iter()
                .filter(|row| row.key() != *key)
                .any(|row| {
                    row.snapshot_content
                        .as_ref()
                        .and_then(|other| property_values(other, &target.properties))
                        .map_or(false, |other| other == values)
                });

            if !found {
                return Err(StoreError::ForeignKeyViolation {
                    schema_key: key.schema_key.clone(),
                    entity_id: key.entity_id.clone(),
                    properties: foreign_key.properties.clone(),
                    referenced_schema_key: target.schema_key.clone(),
                });
            }
        }

        Ok(())
    }
}
