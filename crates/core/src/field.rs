use serde::{Deserialize, Serialize};
use std::fmt;

use crate::message::Message;

/// 2D vector scalar, used by percepts carrying positional data.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// The type of a message field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    V2,
    String,
    /// Homogeneous list of scalars.
    List(Box<ValueKind>),
    /// Nested message conforming to the named schema.
    Message(String),
}

/// A typed field value. Values are copied on write; messages never share
/// field storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    V2(Vec2),
    String(String),
    List(Vec<Value>),
    Message(Box<Message>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::I8(_) => ValueKind::I8,
            Value::I16(_) => ValueKind::I16,
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::U8(_) => ValueKind::U8,
            Value::U16(_) => ValueKind::U16,
            Value::U32(_) => ValueKind::U32,
            Value::U64(_) => ValueKind::U64,
            Value::F32(_) => ValueKind::F32,
            Value::F64(_) => ValueKind::F64,
            Value::V2(_) => ValueKind::V2,
            Value::String(_) => ValueKind::String,
            Value::List(items) => {
                let inner = items
                    .first()
                    .map(Value::kind)
                    .unwrap_or(ValueKind::Bool);
                ValueKind::List(Box::new(inner))
            }
            Value::Message(msg) => ValueKind::Message(msg.schema().to_string()),
        }
    }

    /// Whether this value satisfies the declared kind. Empty lists satisfy
    /// any list kind; nested messages match on schema name.
    pub fn matches(&self, kind: &ValueKind) -> bool {
        match (self, kind) {
            (Value::List(items), ValueKind::List(inner)) => {
                items.iter().all(|item| item.matches(inner))
            }
            (Value::Message(msg), ValueKind::Message(schema)) => msg.schema() == schema,
            _ => self.kind() == *kind,
        }
    }
}

impl ValueKind {
    /// The zero-initialised value for this kind.
    pub fn zero(&self) -> Value {
        match self {
            ValueKind::Bool => Value::Bool(false),
            ValueKind::I8 => Value::I8(0),
            ValueKind::I16 => Value::I16(0),
            ValueKind::I32 => Value::I32(0),
            ValueKind::I64 => Value::I64(0),
            ValueKind::U8 => Value::U8(0),
            ValueKind::U16 => Value::U16(0),
            ValueKind::U32 => Value::U32(0),
            ValueKind::U64 => Value::U64(0),
            ValueKind::F32 => Value::F32(0.0),
            ValueKind::F64 => Value::F64(0.0),
            ValueKind::V2 => Value::V2(Vec2::default()),
            ValueKind::String => Value::String(String::new()),
            ValueKind::List(_) => Value::List(Vec::new()),
            ValueKind::Message(schema) => Value::Message(Box::new(Message::new(schema.clone()))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::V2(v) => write!(f, "({}, {})", v.x, v.y),
            Value::String(v) => write!(f, "{v:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Message(msg) => write!(f, "{msg}"),
        }
    }
}

/// Conversion between Rust types and field values, used by the typed
/// accessors on [`Message`] and `BeliefContext`.
pub trait FieldType: Sized {
    fn into_value(self) -> Value;
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! scalar_field_type {
    ($ty:ty, $variant:ident) => {
        impl FieldType for $ty {
            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

scalar_field_type!(bool, Bool);
scalar_field_type!(i8, I8);
scalar_field_type!(i16, I16);
scalar_field_type!(i32, I32);
scalar_field_type!(i64, I64);
scalar_field_type!(u8, U8);
scalar_field_type!(u16, U16);
scalar_field_type!(u32, U32);
scalar_field_type!(u64, U64);
scalar_field_type!(f32, F32);
scalar_field_type!(f64, F64);
scalar_field_type!(Vec2, V2);
scalar_field_type!(String, String);

impl FieldType for Message {
    fn into_value(self) -> Value {
        Value::Message(Box::new(self))
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Message(msg) => Some((**msg).clone()),
            _ => None,
        }
    }
}

impl<T: FieldType> FieldType for Vec<T> {
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(FieldType::into_value).collect())
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::List(items) => items.iter().map(T::from_value).collect(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values_match_their_kind() {
        for kind in [
            ValueKind::Bool,
            ValueKind::U32,
            ValueKind::F32,
            ValueKind::V2,
            ValueKind::String,
            ValueKind::List(Box::new(ValueKind::I64)),
        ] {
            assert!(kind.zero().matches(&kind), "{kind:?}");
        }
    }

    #[test]
    fn typed_round_trip() {
        let v = 42u32.into_value();
        assert_eq!(u32::from_value(&v), Some(42));
        assert_eq!(bool::from_value(&v), None);

        let list = vec![1i64, 2, 3].into_value();
        assert_eq!(Vec::<i64>::from_value(&list), Some(vec![1, 2, 3]));
    }

    #[test]
    fn empty_list_matches_any_list_kind() {
        let v = Value::List(Vec::new());
        assert!(v.matches(&ValueKind::List(Box::new(ValueKind::String))));
        assert!(v.matches(&ValueKind::List(Box::new(ValueKind::U8))));
    }
}
