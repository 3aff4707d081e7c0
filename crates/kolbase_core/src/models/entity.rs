//! Entity rows and the per-kind schemas that validate them.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single field value stored on an entity.
///
/// Serializes as a plain JSON value. `List` carries set semantics: merges
/// union list fields instead of overwriting them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    /// Whether this value counts as "unpopulated" for merge and scoring.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(value) => value.is_empty(),
            Self::List(values) => values.is_empty(),
            _ => false,
        }
    }

    /// Text content, when this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// List content, when this is a list value.
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(values) => Some(values.as_slice()),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// A stored entity: one canonical document plus its derived index memberships.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub primary_key: String,
    pub kind: String,
    /// Key-type to normalized value, e.g. `handle -> "alice"`.
    pub natural_keys: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Monotonic, bumped on every write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Field value by name, if present.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Text content of a field, if present and textual.
    pub fn text_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(FieldValue::as_text)
    }

    /// Normalized natural key of the given type, if recorded.
    pub fn natural_key(&self, key_type: &str) -> Option<&str> {
        self.natural_keys.get(key_type).map(String::as_str)
    }
}

/// Declaration of an entity kind: key layout, indexed fields, merge policy.
///
/// Registered on the store at startup; writes are validated against it before
/// touching storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindSchema {
    /// Kind name, e.g. `user`.
    pub kind: String,
    /// Document key prefix, e.g. `user:`.
    pub key_prefix: String,
    /// Natural-key type for this kind, e.g. `handle`.
    pub natural_key_type: String,
    /// Fields maintained as secondary indexes.
    pub indexed_fields: Vec<String>,
    /// Identity-bearing fields: never auto-merged on conflict.
    pub identity_fields: Vec<String>,
    /// List-valued fields: unioned on merge.
    pub list_fields: Vec<String>,
}

impl KindSchema {
    /// Schema for KOL/user profiles.
    pub fn user() -> Self {
        Self {
            kind: "user".to_string(),
            key_prefix: "user:".to_string(),
            natural_key_type: "handle".to_string(),
            indexed_fields: vec![
                "role".to_string(),
                "approval_status".to_string(),
                "project".to_string(),
                "wallet".to_string(),
                "discord_id".to_string(),
            ],
            identity_fields: vec![
                "discord_id".to_string(),
                "twitter_id".to_string(),
                "wallet".to_string(),
            ],
            list_fields: vec!["tags".to_string(), "campaign_ids".to_string()],
        }
    }

    /// Schema for chat message records.
    pub fn message() -> Self {
        Self {
            kind: "message".to_string(),
            key_prefix: "message:".to_string(),
            natural_key_type: "message_id".to_string(),
            indexed_fields: vec![
                "channel".to_string(),
                "author".to_string(),
                "project".to_string(),
            ],
            identity_fields: Vec::new(),
            list_fields: Vec::new(),
        }
    }

    /// Whether `field` is maintained as a secondary index.
    pub fn is_indexed(&self, field: &str) -> bool {
        self.indexed_fields.iter().any(|f| f == field)
    }

    /// Whether `field` is identity-bearing (conflict-protected on merge).
    pub fn is_identity(&self, field: &str) -> bool {
        self.identity_fields.iter().any(|f| f == field)
    }

    /// Whether `field` carries list/set semantics.
    pub fn is_list(&self, field: &str) -> bool {
        self.list_fields.iter().any(|f| f == field)
    }

    /// Validate a field map against this schema.
    ///
    /// # Returns
    /// `Ok(())` when every field has an acceptable shape.
    ///
    /// # Errors
    /// Returns [`StoreError::SchemaViolation`] for empty field names, list
    /// values on scalar fields, or scalar values on list fields.
    pub fn validate(&self, fields: &BTreeMap<String, FieldValue>) -> Result<(), StoreError> {
        for (name, value) in fields {
            if name.trim().is_empty() {
                return Err(StoreError::SchemaViolation(format!(
                    "{}: empty field name",
                    self.kind
                )));
            }
            let is_list_value = matches!(value, FieldValue::List(_));
            if self.is_list(name) && !is_list_value && !value.is_empty() {
                return Err(StoreError::SchemaViolation(format!(
                    "{}.{}: expected a list value",
                    self.kind, name
                )));
            }
            if !self.is_list(name) && is_list_value {
                return Err(StoreError::SchemaViolation(format!(
                    "{}.{}: unexpected list value on scalar field",
                    self.kind, name
                )));
            }
            if self.is_indexed(name) {
                if let FieldValue::Text(text) = value {
                    if text.contains(':') {
                        return Err(StoreError::SchemaViolation(format!(
                            "{}.{}: indexed values must not contain ':'",
                            self.kind, name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// The value an entity contributes to the index on `field`, if any.
    ///
    /// The natural-key index draws from the entity's recorded natural keys,
    /// everything else from the field map.
    pub fn indexed_value<'a>(&self, entity: &'a Entity, field: &str) -> Option<&'a str> {
        if field == self.natural_key_type {
            return entity.natural_key(field);
        }
        entity.field(field).and_then(|value| {
            let text = value.as_text()?;
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        })
    }
}
