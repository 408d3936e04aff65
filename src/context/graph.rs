//! The in-memory object graph behind a context.
//!
//! Tracks registered objects plus the pending insert/update/delete sets
//! accumulated since the last save, in the manner of a per-save mutation
//! context: the save coordinator snapshots the pending sets, writes them,
//! and clears them only after the write commits, so a failed save retains
//! everything for retry.

use crate::model::{ChangeSet, ManagedObject, ObjectId};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Pending changes snapshotted for one save.
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingChanges {
    pub inserted: Vec<ManagedObject>,
    pub updated: Vec<ManagedObject>,
    pub deleted: Vec<ObjectId>,
}

impl PendingChanges {
    pub(crate) fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// A transactional view over the object graph.
///
/// Mutations are staged here until a save persists them. Access always goes
/// through the owning context's queue.
#[derive(Debug, Default)]
pub struct Graph {
    objects: HashMap<ObjectId, ManagedObject>,
    inserted: HashSet<ObjectId>,
    updated: HashSet<ObjectId>,
    deleted: HashSet<ObjectId>,
}

impl Graph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a new object; returns its temporary id.
    pub fn insert(&mut self, entity: &str, properties: Map<String, Value>) -> ObjectId {
        let object = ManagedObject::new(entity, properties);
        let id = object.id.clone();
        self.objects.insert(id.clone(), object);
        self.inserted.insert(id.clone());
        id
    }

    /// Overlay properties onto a registered object, incoming values winning.
    ///
    /// Returns `false` when no object with `id` is registered.
    pub fn update(&mut self, id: &ObjectId, incoming: &Map<String, Value>) -> bool {
        let Some(object) = self.objects.get_mut(id) else {
            return false;
        };
        object.merge_properties(incoming);
        if !self.inserted.contains(id) {
            self.updated.insert(id.clone());
        }
        true
    }

    /// Stage a deletion.
    ///
    /// An object inserted since the last save simply vanishes; persisted
    /// objects are marked for removal from the store. Returns `false` when
    /// no object with `id` is registered.
    pub fn delete(&mut self, id: &ObjectId) -> bool {
        if self.objects.remove(id).is_none() {
            return false;
        }
        if self.inserted.remove(id) {
            return true;
        }
        self.updated.remove(id);
        self.deleted.insert(id.clone());
        true
    }

    /// Look up a registered object.
    #[must_use]
    pub fn get(&self, id: &ObjectId) -> Option<&ManagedObject> {
        self.objects.get(id)
    }

    /// Whether an object with `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Whether any changes are pending since the last save.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.inserted.is_empty() || !self.updated.is_empty() || !self.deleted.is_empty()
    }

    /// Number of registered objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Discard the entire in-memory graph, pending changes included.
    ///
    /// Persisted data is untouched.
    pub fn reset(&mut self) {
        self.objects.clear();
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
    }

    /// Materialize a fetched object without marking anything pending.
    pub(crate) fn register(&mut self, object: ManagedObject) {
        self.objects.insert(object.id.clone(), object);
    }

    /// Ids of pending inserts still carrying temporary identifiers.
    pub(crate) fn unassigned_inserts(&self) -> Vec<ObjectId> {
        self.inserted
            .iter()
            .filter(|id| !id.is_durable())
            .cloned()
            .collect()
    }

    /// Move an object to a new id, carrying its pending classification.
    pub(crate) fn rekey(&mut self, old: &ObjectId, new: ObjectId) -> bool {
        let Some(mut object) = self.objects.remove(old) else {
            return false;
        };
        object.id = new.clone();
        if self.inserted.remove(old) {
            self.inserted.insert(new.clone());
        }
        if self.updated.remove(old) {
            self.updated.insert(new.clone());
        }
        self.objects.insert(new, object);
        true
    }

    /// Clone the pending sets for a save.
    pub(crate) fn snapshot_pending(&self) -> PendingChanges {
        let collect = |ids: &HashSet<ObjectId>| -> Vec<ManagedObject> {
            ids.iter()
                .filter_map(|id| self.objects.get(id).cloned())
                .collect()
        };
        PendingChanges {
            inserted: collect(&self.inserted),
            updated: collect(&self.updated),
            deleted: self.deleted.iter().cloned().collect(),
        }
    }

    /// Clear the pending sets after a committed save.
    pub(crate) fn clear_pending(&mut self) {
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
    }

    /// Fold a child context's committed changes into this graph.
    ///
    /// Property-level last-writer-wins: the incoming change overwrites the
    /// value held here. Merged objects become pending so the next save of
    /// this graph persists them.
    pub(crate) fn merge_committed(&mut self, changes: &ChangeSet) {
        for object in &changes.inserted {
            let known = self.objects.contains_key(&object.id);
            self.merge_object(object);
            if !known {
                self.inserted.insert(object.id.clone());
            }
        }
        for object in &changes.updated {
            self.merge_object(object);
            if !self.inserted.contains(&object.id) {
                self.updated.insert(object.id.clone());
            }
        }
        for id in &changes.deleted {
            self.objects.remove(id);
            self.inserted.remove(id);
            self.updated.remove(id);
            self.deleted.insert(id.clone());
        }
    }

    fn merge_object(&mut self, incoming: &ManagedObject) {
        match self.objects.get_mut(&incoming.id) {
            Some(existing) => existing.merge_properties(&incoming.properties),
            None => self.register(incoming.clone()),
        }
    }
}
