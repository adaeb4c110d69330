//! Typed representation of systemd property values
//!
//! D-Bus hands back variants of arbitrary shape; they are normalized into a
//! closed set of variants so event consumers never touch the wire types.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use zbus::zvariant::{OwnedValue, Value};

/// Property name to value, ordered by name.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Array(Vec<PropertyValue>),
    Struct(Vec<PropertyValue>),
    Dict(Vec<(PropertyValue, PropertyValue)>),
    Unsupported(String),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) | Self::ObjectPath(value) | Self::Signature(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::Byte(value) => Some(u64::from(value)),
            Self::UInt16(value) => Some(u64::from(value)),
            Self::UInt32(value) => Some(u64::from(value)),
            Self::UInt64(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&Value<'_>> for PropertyValue {
    fn from(value: &Value<'_>) -> Self {
        match value {
            Value::Bool(value) => Self::Bool(*value),
            Value::U8(value) => Self::Byte(*value),
            Value::I16(value) => Self::Int16(*value),
            Value::U16(value) => Self::UInt16(*value),
            Value::I32(value) => Self::Int32(*value),
            Value::U32(value) => Self::UInt32(*value),
            Value::I64(value) => Self::Int64(*value),
            Value::U64(value) => Self::UInt64(*value),
            Value::F64(value) => Self::Double(*value),
            Value::Str(value) => Self::Str(value.as_str().to_string()),
            Value::ObjectPath(path) => Self::ObjectPath(path.as_str().to_string()),
            Value::Signature(signature) => Self::Signature(signature.to_string()),
            // variants nested inside variants carry no extra meaning here
            Value::Value(inner) => Self::from(inner.as_ref()),
            Value::Array(array) => Self::Array(array.iter().map(Self::from).collect()),
            Value::Structure(structure) => {
                Self::Struct(structure.fields().iter().map(Self::from).collect())
            }
            Value::Dict(dict) => Self::Dict(
                dict.iter()
                    .map(|(key, value)| (Self::from(key), Self::from(value)))
                    .collect(),
            ),
            other => Self::Unsupported(format!("{other:?}")),
        }
    }
}

impl From<&OwnedValue> for PropertyValue {
    fn from(value: &OwnedValue) -> Self {
        let value: &Value<'_> = value;
        Self::from(value)
    }
}

pub fn property_map_from_dbus(raw: HashMap<String, OwnedValue>) -> PropertyMap {
    raw.into_iter()
        .map(|(name, value)| {
            let value = PropertyValue::from(&value);
            (name, value)
        })
        .collect()
}
