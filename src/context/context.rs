//! Context handles.
//!
//! A [`Context`] is a queue-affine view over the object graph. The main
//! context lives as long as its manager; derived contexts are created per
//! unit of background work and discarded after their save completes.

use crate::context::graph::Graph;
use crate::context::queue::Queue;
use crate::error::Result;
use crate::model::{ManagedObject, ObjectId};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};

/// A transactional, queue-affine view over the persisted object graph.
///
/// Cloning a `Context` clones the handle, not the graph.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    parent: Option<Context>,
    queue: Queue,
    graph: Mutex<Graph>,
}

impl Context {
    /// The main context. One per manager.
    pub(crate) fn main() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                parent: None,
                queue: Queue::spawn("main"),
                graph: Mutex::new(Graph::new()),
            }),
        }
    }

    /// A derived context parented to `parent`.
    pub(crate) fn derived(parent: &Context, seq: u64) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                parent: Some(parent.clone()),
                queue: Queue::spawn(&format!("derived-{seq}")),
                graph: Mutex::new(Graph::new()),
            }),
        }
    }

    /// Label of this context's queue ("main" or "derived-N").
    #[must_use]
    pub fn label(&self) -> &str {
        self.inner.queue.label()
    }

    /// The parent context, present exactly for derived contexts.
    #[must_use]
    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    #[must_use]
    pub fn is_main(&self) -> bool {
        self.inner.parent.is_none()
    }

    #[must_use]
    pub fn is_derived(&self) -> bool {
        self.inner.parent.is_some()
    }

    /// Whether two handles refer to the same context.
    #[must_use]
    pub fn same_context(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `f` against the graph on this context's queue, asynchronously.
    pub fn perform(&self, f: impl FnOnce(&mut Graph) + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.dispatch(move || {
            let mut graph = inner.graph.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut graph);
        });
    }

    /// Run `f` against the graph on this context's queue and wait.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManagerGone`](crate::Error::ManagerGone) if the
    /// queue has terminated.
    pub fn perform_sync<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Graph) -> R + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.run_sync(move || {
            let mut graph = inner.graph.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut graph)
        })
    }

    /// Insert a new object; returns its temporary id.
    ///
    /// # Errors
    ///
    /// Fails only if the context's queue has terminated.
    pub fn insert(&self, entity: &str, properties: Map<String, Value>) -> Result<ObjectId> {
        let entity = entity.to_string();
        self.perform_sync(move |graph| graph.insert(&entity, properties))
    }

    /// Overlay properties onto a registered object.
    ///
    /// # Errors
    ///
    /// Fails only if the context's queue has terminated.
    pub fn update(&self, id: &ObjectId, properties: Map<String, Value>) -> Result<bool> {
        let id = id.clone();
        self.perform_sync(move |graph| graph.update(&id, &properties))
    }

    /// Stage a deletion.
    ///
    /// # Errors
    ///
    /// Fails only if the context's queue has terminated.
    pub fn delete(&self, id: &ObjectId) -> Result<bool> {
        let id = id.clone();
        self.perform_sync(move |graph| graph.delete(&id))
    }

    /// Look up an object registered in this context.
    ///
    /// # Errors
    ///
    /// Fails only if the context's queue has terminated.
    pub fn get(&self, id: &ObjectId) -> Result<Option<ManagedObject>> {
        let id = id.clone();
        self.perform_sync(move |graph| graph.get(&id).cloned())
    }

    /// Whether changes are pending since the last save.
    ///
    /// # Errors
    ///
    /// Fails only if the context's queue has terminated.
    pub fn has_changes(&self) -> Result<bool> {
        self.perform_sync(|graph| graph.has_changes())
    }

    /// Discard the in-memory graph, pending changes included.
    ///
    /// # Errors
    ///
    /// Fails only if the context's queue has terminated.
    pub fn reset(&self) -> Result<()> {
        self.perform_sync(Graph::reset)
    }

    pub(crate) fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    /// Direct graph access for save jobs already running on this context's
    /// queue.
    pub(crate) fn with_graph<R>(&self, f: impl FnOnce(&mut Graph) -> R) -> R {
        let mut graph = self
            .inner
            .graph
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_derived_context_parent() {
        let main = Context::main();
        let derived = Context::derived(&main, 1);

        assert!(derived.is_derived());
        assert!(derived.parent().unwrap().same_context(&main));
        assert_eq!(derived.label(), "derived-1");
    }

    #[test]
    fn test_mutations_round_trip() {
        let ctx = Context::main();
        let id = ctx
            .insert(
                "post",
                std::iter::once(("title".to_string(), json!("Hi"))).collect(),
            )
            .unwrap();

        let object = ctx.get(&id).unwrap().unwrap();
        assert_eq!(object.properties["title"], json!("Hi"));
        assert!(ctx.has_changes().unwrap());

        ctx.reset().unwrap();
        assert!(!ctx.has_changes().unwrap());
        assert!(ctx.get(&id).unwrap().is_none());
    }
}
