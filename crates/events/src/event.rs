//! Object change events.

use std::fmt;

use ctrl_core::{Object, ReconcileKey};
use serde::{Deserialize, Serialize};

/// Kind of change observed for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Added,
    Updated,
    Deleted,
}

impl EventType {
    /// Stable lowercase name, used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized change notification delivered to event handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    /// The object after the change, or its final state for deletions.
    pub object: Object,
    /// The last state observed before the change, when known.
    pub previous_object: Option<Object>,
}

impl Event {
    /// An object appeared.
    #[must_use]
    pub const fn added(object: Object) -> Self {
        Self {
            event_type: EventType::Added,
            object,
            previous_object: None,
        }
    }

    /// An object changed from `previous` to `object`.
    #[must_use]
    pub const fn updated(previous: Object, object: Object) -> Self {
        Self {
            event_type: EventType::Updated,
            object,
            previous_object: Some(previous),
        }
    }

    /// An object was removed. `last_known` is the last mirrored state.
    #[must_use]
    pub const fn deleted(object: Object, last_known: Option<Object>) -> Self {
        Self {
            event_type: EventType::Deleted,
            object,
            previous_object: last_known,
        }
    }

    /// Key of the event's object.
    #[must_use]
    pub fn key(&self) -> ReconcileKey {
        self.object.key()
    }

    /// Kind of the event's object.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.object.kind
    }
}

/// Kind of an upstream watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A raw notification from the upstream watch feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub object: Object,
}

impl WatchEvent {
    /// Create a watch notification.
    #[must_use]
    pub const fn new(event_type: WatchEventType, object: Object) -> Self {
        Self { event_type, object }
    }
}
