//! Save coordination.
//!
//! Saves run on the owning context's queue. The sequence for every save:
//! assign durable identifiers to pending inserts (failures logged, save
//! proceeds), snapshot the pending sets, commit, then clear the pending
//! sets and publish the committed [`ChangeSet`]. A failed commit clears
//! nothing, so the context can simply be saved again.
//!
//! Main saves commit to the store in one IMMEDIATE transaction. Derived
//! saves commit to the parent main context (property-level incoming-wins
//! merge, serialized on the main queue) and then enqueue a follow-up main
//! save so the merged changes reach disk; that follow-up's outcome is not
//! chained to the caller's completion.
//!
//! Completion callbacks are always dispatched onto the main queue. Do not
//! block the main queue waiting for a derived save; the derived path takes
//! a synchronous turn on the main queue for its merge.

use crate::context::context::Context;
use crate::context::graph::Graph;
use crate::context::manager::ContextManager;
use crate::error::Result;
use crate::model::{ChangeSet, ObjectId};
use tracing::{debug, error, warn};

/// What a committed save did.
#[derive(Debug, Clone, Default)]
pub struct SaveReceipt {
    /// Temporary-to-durable remapping performed before the commit.
    pub assigned: Vec<(ObjectId, ObjectId)>,
    /// Number of objects inserted.
    pub inserted: usize,
    /// Number of objects updated.
    pub updated: usize,
    /// Number of objects deleted.
    pub deleted: usize,
}

impl SaveReceipt {
    /// Durable id assigned to `temporary` by this save, if any.
    #[must_use]
    pub fn durable_id_for(&self, temporary: &ObjectId) -> Option<&ObjectId> {
        self.assigned
            .iter()
            .find(|(from, _)| from == temporary)
            .map(|(_, to)| to)
    }
}

pub(crate) type Completion = Box<dyn FnOnce(Result<SaveReceipt>) + Send + 'static>;

/// Assign a durable identifier to one object.
///
/// Returns `true` trivially when the object already holds a durable id
/// (nothing is mutated), `false` silently when no object with `id` is
/// registered. Never panics.
pub fn obtain_permanent_id(graph: &mut Graph, id: &ObjectId) -> bool {
    match graph.get(id) {
        None => {
            debug!(id = %id, "no such object, cannot assign durable id");
            false
        }
        Some(object) if object.id.is_durable() => true,
        Some(_) => graph.rekey(id, ObjectId::durable()),
    }
}

/// Assign durable ids to every pending insert.
///
/// Failures are logged and skipped; the save proceeds with whatever could
/// be assigned.
pub(crate) fn assign_permanent_ids(graph: &mut Graph) -> Vec<(ObjectId, ObjectId)> {
    let mut assigned = Vec::new();
    for old in graph.unassigned_inserts() {
        let new = ObjectId::durable();
        if graph.rekey(&old, new.clone()) {
            assigned.push((old, new));
        } else {
            warn!(id = %old, "durable id assignment failed, object skipped this save");
        }
    }
    assigned
}

/// Entry point used by [`ContextManager::save`] and friends.
pub(crate) fn save_context(manager: &ContextManager, ctx: &Context, completion: Option<Completion>) {
    let manager = manager.clone();
    let ctx_for_job = ctx.clone();
    let derived = ctx.is_derived();
    ctx.queue().dispatch(move || {
        let result = if derived {
            run_derived_save(&manager, &ctx_for_job)
        } else {
            run_main_save(&manager, &ctx_for_job)
        };
        deliver(&manager, completion, result);
    });
}

/// Persist the main context's pending changes to the store.
fn run_main_save(manager: &ContextManager, ctx: &Context) -> Result<SaveReceipt> {
    let (assigned, pending) = ctx.with_graph(|graph| {
        let assigned = assign_permanent_ids(graph);
        (assigned, graph.snapshot_pending())
    });

    if pending.is_empty() {
        return Ok(SaveReceipt::default());
    }

    let receipt = SaveReceipt {
        assigned: assigned.clone(),
        inserted: pending.inserted.len(),
        updated: pending.updated.len(),
        deleted: pending.deleted.len(),
    };

    let store = manager.store()?;
    let mut upserts = pending.inserted.clone();
    upserts.extend(pending.updated.iter().cloned());

    if let Err(e) = store.save_objects(ctx.label(), &upserts, &pending.deleted) {
        error!(context = ctx.label(), error = %e, "save failed, pending changes retained");
        return Err(e);
    }

    ctx.with_graph(Graph::clear_pending);
    manager.publish(&ChangeSet {
        source: ctx.label().to_string(),
        inserted: pending.inserted,
        updated: pending.updated,
        deleted: pending.deleted,
        assigned,
    });

    Ok(receipt)
}

/// Commit a derived context's pending changes to its parent, then enqueue
/// the follow-up main save.
fn run_derived_save(manager: &ContextManager, ctx: &Context) -> Result<SaveReceipt> {
    let (assigned, pending) = ctx.with_graph(|graph| {
        let assigned = assign_permanent_ids(graph);
        (assigned, graph.snapshot_pending())
    });

    if pending.is_empty() {
        return Ok(SaveReceipt::default());
    }

    let receipt = SaveReceipt {
        assigned: assigned.clone(),
        inserted: pending.inserted.len(),
        updated: pending.updated.len(),
        deleted: pending.deleted.len(),
    };
    let changes = ChangeSet {
        source: ctx.label().to_string(),
        inserted: pending.inserted,
        updated: pending.updated,
        deleted: pending.deleted,
        assigned,
    };

    // Derived contexts always have a parent; fall back to the manager's
    // main context rather than trusting the invariant blindly.
    let parent = ctx
        .parent()
        .cloned()
        .unwrap_or_else(|| manager.main_context());

    let merged = changes.clone();
    parent.perform_sync(move |graph| graph.merge_committed(&merged))?;

    ctx.with_graph(Graph::clear_pending);
    manager.publish(&changes);

    // Propagate to disk. Derived contexts are not observed for merging, so
    // visibility relies on this explicit follow-up save of the parent.
    save_context(manager, &parent, None);

    Ok(receipt)
}

/// Dispatch the completion onto the main queue.
fn deliver(manager: &ContextManager, completion: Option<Completion>, result: Result<SaveReceipt>) {
    match completion {
        Some(completion) => {
            manager
                .main_context()
                .queue()
                .dispatch(move || completion(result));
        }
        None => {
            if let Err(e) = result {
                error!(error = %e, "unobserved save failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_obtain_permanent_id_unknown_object_is_false() {
        let mut graph = Graph::new();
        assert!(!obtain_permanent_id(&mut graph, &ObjectId::temporary()));
    }

    #[test]
    fn test_obtain_permanent_id_is_trivial_for_durable() {
        let mut graph = Graph::new();
        let id = graph.insert("post", serde_json::Map::new());
        let durable = ObjectId::durable();
        graph.rekey(&id, durable.clone());

        let before = graph.get(&durable).unwrap().clone();
        assert!(obtain_permanent_id(&mut graph, &durable));
        let after = graph.get(&durable).unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[test]
    fn test_obtain_permanent_id_assigns_and_rekeys() {
        let mut graph = Graph::new();
        let temp = graph.insert(
            "post",
            std::iter::once(("title".to_string(), json!("x"))).collect(),
        );

        assert!(obtain_permanent_id(&mut graph, &temp));
        assert!(graph.get(&temp).is_none());
        assert_eq!(graph.snapshot_pending().inserted.len(), 1);
        assert!(graph.snapshot_pending().inserted[0].id.is_durable());
    }

    #[test]
    fn test_assign_permanent_ids_covers_all_inserts() {
        let mut graph = Graph::new();
        let a = graph.insert("post", serde_json::Map::new());
        let b = graph.insert("site", serde_json::Map::new());

        let assigned = assign_permanent_ids(&mut graph);
        assert_eq!(assigned.len(), 2);
        let olds: Vec<_> = assigned.iter().map(|(old, _)| old.clone()).collect();
        assert!(olds.contains(&a));
        assert!(olds.contains(&b));
        assert!(assigned.iter().all(|(_, new)| new.is_durable()));
    }
}
