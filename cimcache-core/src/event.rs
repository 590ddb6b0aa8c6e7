//! Change-event criteria and payloads.

use crate::{ConnectionId, ObjectKey, RemoteInstance};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Kind of instance lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceEventType {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for InstanceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceEventType::Created => "created",
            InstanceEventType::Modified => "modified",
            InstanceEventType::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Subscription criteria: target class, event type and extra filter
/// conditions on one connection and namespace.
///
/// Keys that select the same events compare equal, so every subscriber with
/// the same criteria shares one underlying monitor. Class and namespace
/// compare case-insensitively; conditions are trimmed and order does not
/// matter.
#[derive(Debug, Clone)]
pub struct EventKey {
    connection: ConnectionId,
    namespace: String,
    class_name: String,
    event_type: InstanceEventType,
    conditions: Vec<String>,
    normalized: String,
}

impl EventKey {
    pub fn new(
        connection: ConnectionId,
        namespace: impl Into<String>,
        class_name: impl Into<String>,
        event_type: InstanceEventType,
        conditions: &[String],
    ) -> Self {
        let namespace = namespace.into();
        let class_name = class_name.into();
        let mut conditions: Vec<String> = conditions
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        conditions.sort();
        conditions.dedup();

        let normalized = format!(
            "{}|{}|{}|{}|{}",
            connection,
            namespace.to_ascii_lowercase(),
            class_name.to_ascii_lowercase(),
            event_type,
            conditions.join(" AND ")
        );

        Self {
            connection,
            namespace,
            class_name,
            event_type,
            conditions,
            normalized,
        }
    }

    /// Criteria covering events on the class of `key`.
    pub fn for_object(key: &ObjectKey, event_type: InstanceEventType, conditions: &[String]) -> Self {
        Self::new(
            key.connection().clone(),
            key.namespace(),
            key.class_name(),
            event_type,
            conditions,
        )
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn event_type(&self) -> InstanceEventType {
        self.event_type
    }

    pub fn conditions(&self) -> &[String] {
        &self.conditions
    }
}

impl PartialEq for EventKey {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for EventKey {}

impl Hash for EventKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} on {}", self.class_name, self.event_type, self.connection)
    }
}

/// An event delivered by a monitor to its listeners.
#[derive(Debug, Clone)]
pub struct InstanceEvent {
    pub event_type: InstanceEventType,
    /// Object the event is about.
    pub target: ObjectKey,
    /// Post-change state, when the event carries one.
    pub instance: Option<RemoteInstance>,
}
