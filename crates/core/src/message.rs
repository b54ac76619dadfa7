use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::SchemaError;
use crate::field::{FieldType, Value, ValueKind};

/// A typed field dictionary. Every message names the schema it claims to
/// conform to; conformance is only enforced at commit and bus-ingress via
/// [`MessageSchema::verify`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    schema: String,
    fields: BTreeMap<String, Value>,
}

impl Message {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Typed field read; `None` when missing or of a different type.
    pub fn get<T: FieldType>(&self, name: &str) -> Option<T> {
        self.fields.get(name).and_then(T::from_value)
    }

    /// Typed field write. Values are copied in; the previous value, if any,
    /// is discarded.
    pub fn set<T: FieldType>(&mut self, name: impl Into<String>, value: T) {
        self.fields.insert(name.into(), value.into_value());
    }

    pub fn set_value(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Overlay `other`'s fields onto this message, replacing collisions.
    pub fn merge(&mut self, other: &Message) {
        for (name, value) in other.fields() {
            self.fields.insert(name.clone(), value.clone());
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.schema)?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, "}}")
    }
}

/// A field declaration inside a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub kind: ValueKind,
    /// Starting value for new messages; the kind's zero value when absent.
    pub default: Option<Value>,
}

/// A named message schema. A message satisfies a schema iff every declared
/// field is present with the declared type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSchema {
    pub name: String,
    pub fields: Vec<SchemaField>,
}

impl MessageSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// A schema is self-valid when it has a name, no duplicate fields and
    /// every default matches its declared kind.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.name.is_empty() {
            return Err(SchemaError::UnnamedSchema);
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(SchemaError::UnnamedField {
                    schema: self.name.clone(),
                });
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(SchemaError::DuplicateField {
                    schema: self.name.clone(),
                    field: field.name.clone(),
                });
            }
            if let Some(default) = &field.default {
                if !default.matches(&field.kind) {
                    return Err(SchemaError::DefaultTypeMismatch {
                        schema: self.name.clone(),
                        field: field.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Verify a message against this schema.
    pub fn verify(&self, msg: &Message) -> Result<(), SchemaError> {
        for field in &self.fields {
            match msg.field(&field.name) {
                None => {
                    return Err(SchemaError::MissingField {
                        schema: self.name.clone(),
                        field: field.name.clone(),
                    })
                }
                Some(value) if !value.matches(&field.kind) => {
                    return Err(SchemaError::FieldTypeMismatch {
                        schema: self.name.clone(),
                        field: field.name.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Create a message with every declared field set to its default (or
    /// zero) value.
    pub fn instantiate(&self) -> Message {
        let mut msg = Message::new(self.name.clone());
        for field in &self.fields {
            let value = field
                .default
                .clone()
                .unwrap_or_else(|| field.kind.zero());
            msg.set_value(field.name.clone(), value);
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MessageSchemaBuilder;

    fn schema() -> MessageSchema {
        MessageSchemaBuilder::new("Cargo")
            .field::<String>("label")
            .field_with_value("weight", 5.0f32)
            .field::<bool>("fragile")
            .build()
    }

    #[test]
    fn instantiate_applies_defaults_and_zeroes() {
        let msg = schema().instantiate();
        assert_eq!(msg.get::<f32>("weight"), Some(5.0));
        assert_eq!(msg.get::<String>("label"), Some(String::new()));
        assert_eq!(msg.get::<bool>("fragile"), Some(false));
    }

    #[test]
    fn verify_rejects_missing_and_mistyped_fields() {
        let schema = schema();
        let mut msg = schema.instantiate();
        assert!(schema.verify(&msg).is_ok());

        msg.set("weight", true);
        assert!(matches!(
            schema.verify(&msg),
            Err(SchemaError::FieldTypeMismatch { .. })
        ));

        let empty = Message::new("Cargo");
        assert!(matches!(
            schema.verify(&empty),
            Err(SchemaError::MissingField { .. })
        ));
    }

    #[test]
    fn validate_rejects_duplicates() {
        let mut schema = schema();
        schema.fields.push(SchemaField {
            name: "label".into(),
            kind: ValueKind::String,
            default: None,
        });
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::DuplicateField { .. })
        ));
    }

    #[test]
    fn message_merge_overlays_fields() {
        let mut base = Message::new("Cargo");
        base.set("weight", 1.0f32);
        let mut patch = Message::new("Cargo");
        patch.set("weight", 2.0f32);
        patch.set("label", "box".to_string());
        base.merge(&patch);
        assert_eq!(base.get::<f32>("weight"), Some(2.0));
        assert_eq!(base.get::<String>("label"), Some("box".to_string()));
    }

    #[test]
    fn json_round_trip() {
        let msg = schema().instantiate();
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }
}
