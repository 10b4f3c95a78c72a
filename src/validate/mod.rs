//! Mutation validation.
//!
//! Mutations are checked against the state visible from their version
//! before anything is written: primary key, unique and foreign key
//! constraints declared by the entity's schema.

mod schema;
mod validator;

pub use schema::{property_values, ForeignKey, ForeignKeyTarget, SchemaCatalog, SchemaDefinition};
pub use validator::{StateView, Validator};
