//! Property values and remote instances.

use crate::{ConnectionId, MappingError, ObjectKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ============================================================================
// PROPERTY VALUE
// ============================================================================

/// A single property value as delivered by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Null,
    Bool(bool),
    SInt(i64),
    UInt(u64),
    Real(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Interval(Duration),
    /// Object path of another remote object.
    Reference(String),
    /// Embedded instance, carried opaquely.
    Embedded(serde_json::Value),
    Array(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Whether replacing `cached` with `self` is a real change.
    ///
    /// Arrays compare by length and then element by element, so an equal
    /// replacement array is not a change. Reals compare numerically, so
    /// `0.0` and `-0.0` are equal, and any NaN equals any other NaN.
    pub fn differs_from(&self, cached: &PropertyValue) -> bool {
        match (self, cached) {
            (PropertyValue::Array(new), PropertyValue::Array(old)) => {
                new.len() != old.len() || new.iter().zip(old).any(|(n, o)| n.differs_from(o))
            }
            (PropertyValue::Real(new), PropertyValue::Real(old)) => {
                !(new == old || (new.is_nan() && old.is_nan()))
            }
            _ => self != cached,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) | PropertyValue::Reference(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::UInt(v) => Some(*v),
            PropertyValue::SInt(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::SInt(v) => Some(*v),
            PropertyValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PropertyValue]> {
        match self {
            PropertyValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => f.write_str("null"),
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::SInt(v) => write!(f, "{}", v),
            PropertyValue::UInt(v) => write!(f, "{}", v),
            PropertyValue::Real(v) => write!(f, "{}", v),
            PropertyValue::String(s) | PropertyValue::Reference(s) => f.write_str(s),
            PropertyValue::DateTime(t) => write!(f, "{}", t.to_rfc3339()),
            PropertyValue::Interval(d) => write!(f, "{:?}", d),
            PropertyValue::Embedded(v) => write!(f, "{}", v),
            PropertyValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::SInt(v)
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::UInt(v)
    }
}

impl From<u16> for PropertyValue {
    fn from(v: u16) -> Self {
        PropertyValue::UInt(u64::from(v))
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Real(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(v: DateTime<Utc>) -> Self {
        PropertyValue::DateTime(v)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(v: Vec<T>) -> Self {
        PropertyValue::Array(v.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// REMOTE INSTANCE
// ============================================================================

/// One object as fetched from the remote service.
///
/// Property names are matched case-insensitively. `key_names` lists which
/// properties form the object's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInstance {
    class_name: String,
    key_names: Vec<String>,
    properties: Vec<(String, PropertyValue)>,
}

impl RemoteInstance {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            key_names: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// Add a key property and its value.
    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        let name = name.into();
        if !self.key_names.iter().any(|k| k.eq_ignore_ascii_case(&name)) {
            self.key_names.push(name.clone());
        }
        self.set(name, value.into());
        self
    }

    /// Add a non-key property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.set(name.into(), value.into());
        self
    }

    fn set(&mut self, name: String, value: PropertyValue) {
        match self
            .properties
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self.properties.push((name, value)),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn key_names(&self) -> &[String] {
        &self.key_names
    }

    pub fn is_key(&self, name: &str) -> bool {
        self.key_names.iter().any(|k| k.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.properties.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Build the identity of this instance on `connection`.
    ///
    /// Fails when the instance has no class, declares no key properties, or
    /// lacks a value for one of them.
    pub fn to_object_key(
        &self,
        connection: &ConnectionId,
        namespace: &str,
    ) -> Result<ObjectKey, MappingError> {
        let unmapped = |reason: String| MappingError::UnmappedInstance {
            class_name: self.class_name.clone(),
            reason,
        };

        if self.class_name.trim().is_empty() {
            return Err(unmapped("instance has no class name".to_string()));
        }
        if self.key_names.is_empty() {
            return Err(unmapped("instance declares no key properties".to_string()));
        }

        let mut builder = ObjectKey::builder(connection.clone(), namespace, self.class_name.clone());
        for name in &self.key_names {
            match self.get(name) {
                Some(value) if !value.is_null() => {
                    builder = builder.key_property(name.clone(), value);
                }
                _ => return Err(unmapped(format!("key property '{}' has no value", name))),
            }
        }
        builder.build().map_err(|e| unmapped(e.to_string()))
    }
}
