//! Committed change-sets.
//!
//! Every successful save publishes one [`ChangeSet`] describing what was
//! committed. Subscribers merge by object id instead of re-reading the
//! whole store, and callers use the id remapping to keep durable references
//! to objects they inserted with temporary ids.

use crate::model::object::{ManagedObject, ObjectId};
use serde::{Deserialize, Serialize};

/// The committed output of one save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Label of the queue the save ran on ("main" or a derived label).
    pub source: String,

    /// Snapshots of objects inserted by this save, post id-assignment.
    pub inserted: Vec<ManagedObject>,

    /// Snapshots of objects updated by this save.
    pub updated: Vec<ManagedObject>,

    /// Durable ids of objects deleted by this save.
    pub deleted: Vec<ObjectId>,

    /// Temporary-to-durable remapping performed before the save.
    pub assigned: Vec<(ObjectId, ObjectId)>,
}

impl ChangeSet {
    /// A change-set with no committed changes.
    #[must_use]
    pub fn empty(source: &str) -> Self {
        Self {
            source: source.to_string(),
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            assigned: Vec::new(),
        }
    }

    /// Whether the save committed anything at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Durable id assigned to `temporary` by this save, if any.
    #[must_use]
    pub fn durable_id_for(&self, temporary: &ObjectId) -> Option<&ObjectId> {
        self.assigned
            .iter()
            .find(|(from, _)| from == temporary)
            .map(|(_, to)| to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_changeset() {
        let cs = ChangeSet::empty("main");
        assert!(cs.is_empty());
        assert_eq!(cs.source, "main");
    }

    #[test]
    fn test_durable_id_lookup() {
        let tmp = ObjectId::temporary();
        let durable = ObjectId::durable();
        let mut cs = ChangeSet::empty("derived-1");
        cs.assigned.push((tmp.clone(), durable.clone()));

        assert_eq!(cs.durable_id_for(&tmp), Some(&durable));
        assert_eq!(cs.durable_id_for(&ObjectId::temporary()), None);
    }
}
