//! Managed objects and their identifiers.
//!
//! A [`ManagedObject`] is one node of the persisted object graph (a post, a
//! site, a media attachment). The context layer is generic over entity
//! kinds: entities are named by string and carry a JSON property map, so the
//! schema of individual entities stays out of this crate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identifier of a managed object.
///
/// Objects are born with a [`ObjectId::Temporary`] id valid only inside the
/// context that created them. The save coordinator assigns a
/// [`ObjectId::Durable`] id before the first save; durable ids are stable
/// across saves and across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ObjectId {
    /// Pre-save identifier, never written to the store.
    Temporary(Uuid),
    /// Stable identifier, the primary key in the store.
    Durable(String),
}

impl ObjectId {
    /// Allocate a fresh temporary id.
    #[must_use]
    pub fn temporary() -> Self {
        Self::Temporary(Uuid::new_v4())
    }

    /// Allocate a fresh durable id.
    #[must_use]
    pub fn durable() -> Self {
        Self::Durable(format!("obj_{}", &Uuid::new_v4().to_string()[..12]))
    }

    /// Whether this id is stable across saves.
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        matches!(self, Self::Durable(_))
    }

    /// The durable key string, if assigned.
    #[must_use]
    pub fn as_durable(&self) -> Option<&str> {
        match self {
            Self::Durable(key) => Some(key),
            Self::Temporary(_) => None,
        }
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Temporary(uuid) => write!(f, "tmp_{uuid}"),
            Self::Durable(key) => f.write_str(key),
        }
    }
}

/// One node of the object graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedObject {
    /// Identifier; temporary until the first save.
    pub id: ObjectId,

    /// Entity kind (e.g. "post", "site", "media").
    pub entity: String,

    /// Property map. Values are JSON so entity schemas stay out of the
    /// context layer.
    pub properties: Map<String, Value>,

    /// Creation timestamp (Unix milliseconds).
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds).
    pub updated_at: i64,
}

impl ManagedObject {
    /// Create a new object with a temporary id.
    #[must_use]
    pub fn new(entity: &str, properties: Map<String, Value>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: ObjectId::temporary(),
            entity: entity.to_string(),
            properties,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overlay `incoming` onto this object's properties.
    ///
    /// Property-level last-writer-wins: every incoming key replaces the
    /// current value; keys absent from `incoming` keep theirs.
    pub fn merge_properties(&mut self, incoming: &Map<String, Value>) {
        for (key, value) in incoming {
            self.properties.insert(key.clone(), value.clone());
        }
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}
