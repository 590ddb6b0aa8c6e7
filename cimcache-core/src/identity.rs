//! Identity types for remote managed objects.
//!
//! An [`ObjectKey`] names one object on one connection. Two keys built from
//! different call sites compare equal whenever their normalized paths match,
//! which is what lets the proxy repository hand out a single canonical proxy
//! per remote object.

use crate::{UsageError, UsageResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// CONNECTION IDENTITY
// ============================================================================

/// Identity of a connection to a remote management service.
///
/// Host names are case-insensitive, so the name is stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(host: impl AsRef<str>) -> Self {
        Self(host.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(host: &str) -> Self {
        Self::new(host)
    }
}

// ============================================================================
// TASK IDENTITY
// ============================================================================

/// Identifier for an outstanding asynchronous remote operation.
///
/// UUIDv7 so ids sort by creation time in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn now_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// OBJECT KEY
// ============================================================================

/// Composite identity of a remote managed object.
///
/// Immutable and cheap to clone. Equality and hashing go through the
/// normalized (lowercased, key-sorted) path, never through the display form.
#[derive(Clone)]
pub struct ObjectKey {
    inner: Arc<KeyInner>,
}

struct KeyInner {
    connection: ConnectionId,
    namespace: String,
    class_name: String,
    /// Sorted by lowercased property name.
    key_properties: Vec<(String, String)>,
    /// Display form, original casing.
    path: String,
    /// Comparison form.
    normalized: String,
}

impl ObjectKey {
    /// Start building a key for `class_name` in `namespace` on `connection`.
    pub fn builder(
        connection: ConnectionId,
        namespace: impl Into<String>,
        class_name: impl Into<String>,
    ) -> ObjectKeyBuilder {
        ObjectKeyBuilder {
            connection,
            namespace: namespace.into(),
            class_name: class_name.into(),
            key_properties: Vec::new(),
        }
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.inner.connection
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn class_name(&self) -> &str {
        &self.inner.class_name
    }

    pub fn key_properties(&self) -> &[(String, String)] {
        &self.inner.key_properties
    }

    /// Value of a key property, matched case-insensitively.
    pub fn key_property(&self, name: &str) -> Option<&str> {
        self.inner
            .key_properties
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Full object path in display form: `\\host\namespace:Class.Key="v"`.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Normalized path used for equality and hashing.
    pub fn normalized_path(&self) -> &str {
        &self.inner.normalized
    }

    pub fn is_class_named(&self, class_name: &str) -> bool {
        self.inner.class_name.eq_ignore_ascii_case(class_name)
    }
}

impl PartialEq for ObjectKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.normalized == other.inner.normalized
    }
}

impl Eq for ObjectKey {}

impl Hash for ObjectKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.normalized.hash(state);
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.path)
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectKey").field(&self.inner.path).finish()
    }
}

/// Builder for [`ObjectKey`].
#[derive(Debug, Clone)]
pub struct ObjectKeyBuilder {
    connection: ConnectionId,
    namespace: String,
    class_name: String,
    key_properties: Vec<(String, String)>,
}

impl ObjectKeyBuilder {
    /// Add a key property. A later value for the same name (ignoring case)
    /// replaces the earlier one.
    pub fn key_property(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        let name = name.into();
        let value = value.to_string();
        match self
            .key_properties
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self.key_properties.push((name, value)),
        }
        self
    }

    pub fn build(mut self) -> UsageResult<ObjectKey> {
        let namespace = self.namespace.trim().trim_matches('\\').replace('/', "\\");
        let class_name = self.class_name.trim().to_string();

        if self.connection.as_str().is_empty() {
            return Err(UsageError::InvalidKey {
                reason: "connection host is empty".to_string(),
            });
        }
        if namespace.is_empty() {
            return Err(UsageError::InvalidKey {
                reason: "namespace is empty".to_string(),
            });
        }
        if class_name.is_empty() {
            return Err(UsageError::InvalidKey {
                reason: "class name is empty".to_string(),
            });
        }
        if let Some((name, _)) = self.key_properties.iter().find(|(n, _)| n.trim().is_empty()) {
            return Err(UsageError::InvalidKey {
                reason: format!("key property name '{}' is empty", name),
            });
        }

        self.key_properties
            .sort_by(|(a, _), (b, _)| a.to_lowercase().cmp(&b.to_lowercase()));

        let path = render_path(&self.connection, &namespace, &class_name, &self.key_properties);
        let normalized = path.to_lowercase();

        Ok(ObjectKey {
            inner: Arc::new(KeyInner {
                connection: self.connection,
                namespace,
                class_name,
                key_properties: self.key_properties,
                path,
                normalized,
            }),
        })
    }
}

fn render_path(
    connection: &ConnectionId,
    namespace: &str,
    class_name: &str,
    key_properties: &[(String, String)],
) -> String {
    let mut path = format!("\\\\{}\\{}:{}", connection, namespace, class_name);
    for (i, (name, value)) in key_properties.iter().enumerate() {
        path.push(if i == 0 { '.' } else { ',' });
        path.push_str(name);
        path.push_str("=\"");
        path.push_str(&value.replace('\\', "\\\\").replace('"', "\\\""));
        path.push('"');
    }
    path
}

// ============================================================================
// TESTS
// ============================================================================
