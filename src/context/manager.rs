//! The context manager.
//!
//! One manager owns one store and one main context. Managers are cheap
//! handles over shared state: clone them and pass them explicitly to
//! consumers. [`ContextManager::shared`] exists for the process-wide
//! convenience case and carries a test-only override seam.

use crate::context::context::Context;
use crate::context::save::{self, Completion, SaveReceipt};
use crate::error::{Error, Result};
use crate::model::{ChangeSet, ManagedObject, ObjectId};
use crate::storage::{StoreConfig, StoreCoordinator};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

/// Coordinator of the multi-context object graph.
///
/// Cloning produces another handle to the same manager.
#[derive(Debug, Clone)]
pub struct ContextManager {
    inner: Arc<ManagerInner>,
}

#[derive(Debug)]
struct ManagerInner {
    config: StoreConfig,
    main: OnceLock<Context>,
    store: Mutex<Option<Arc<StoreCoordinator>>>,
    subscribers: Mutex<Vec<Sender<ChangeSet>>>,
    derived_seq: AtomicU64,
}

static SHARED: OnceLock<RwLock<ContextManager>> = OnceLock::new();

impl ContextManager {
    /// Build a manager over `config`. The store opens lazily on first use.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                main: OnceLock::new(),
                store: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                derived_seq: AtomicU64::new(1),
            }),
        }
    }

    /// The process-wide shared manager, created exactly once, thread-safely,
    /// on first call, from `StoreConfig::default()`.
    #[must_use]
    pub fn shared() -> Self {
        Self::shared_cell()
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the shared manager (test-only seam).
    ///
    /// Forces creation of the real shared manager first, then substitutes.
    /// Callers must serialize this against other users of [`Self::shared`].
    pub fn override_shared(manager: Self) {
        let cell = Self::shared_cell();
        *cell.write().unwrap_or_else(PoisonError::into_inner) = manager;
    }

    fn shared_cell() -> &'static RwLock<Self> {
        SHARED.get_or_init(|| RwLock::new(Self::new(StoreConfig::default())))
    }

    /// Whether two handles refer to the same manager.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The main context, created lazily on first access.
    #[must_use]
    pub fn main_context(&self) -> Context {
        self.inner.main.get_or_init(Context::main).clone()
    }

    /// A fresh derived context whose parent is the main context.
    #[must_use]
    pub fn new_derived_context(&self) -> Context {
        let seq = self.inner.derived_seq.fetch_add(1, Ordering::Relaxed);
        Context::derived(&self.main_context(), seq)
    }

    /// The store coordinator, opened at most once per manager.
    ///
    /// # Errors
    ///
    /// Propagates store-open failures; see
    /// [`StoreCoordinator::open`](crate::storage::StoreCoordinator::open).
    pub(crate) fn store(&self) -> Result<Arc<StoreCoordinator>> {
        let mut guard = self
            .inner
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(store) = guard.as_ref() {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(StoreCoordinator::open(&self.inner.config)?);
        *guard = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Save a context's pending changes, fire-and-forget.
    ///
    /// Failures are logged; use [`Self::save_with`] or
    /// [`Self::save_and_wait`] to observe the outcome.
    pub fn save(&self, ctx: &Context) {
        save::save_context(self, ctx, None);
    }

    /// Save with a completion callback, dispatched onto the main queue.
    pub fn save_with(
        &self,
        ctx: &Context,
        completion: impl FnOnce(Result<SaveReceipt>) + Send + 'static,
    ) {
        save::save_context(self, ctx, Some(Box::new(completion) as Completion));
    }

    /// Save and block until the outcome is known.
    ///
    /// For a derived context, the follow-up main save has also completed by
    /// the time this returns: the merge, the follow-up save, and the
    /// completion run in order on the main queue. Do not call from a job
    /// already running on the main queue.
    ///
    /// # Errors
    ///
    /// Returns the save failure; pending changes are retained for retry.
    pub fn save_and_wait(&self, ctx: &Context) -> Result<SaveReceipt> {
        let (tx, rx) = mpsc::channel();
        self.save_with(ctx, move |result| {
            let _ = tx.send(result);
        });
        rx.recv().map_err(|_| Error::ManagerGone)?
    }

    /// Look up an object through the main context, falling back to the
    /// store for durable ids not materialized in the graph. Fetched objects
    /// are registered in the main graph.
    ///
    /// # Errors
    ///
    /// Propagates store-open and query failures.
    pub fn object(&self, id: &ObjectId) -> Result<Option<ManagedObject>> {
        let main = self.main_context();
        let lookup = id.clone();
        if let Some(found) = main.perform_sync(move |graph| graph.get(&lookup).cloned())? {
            return Ok(Some(found));
        }
        if !id.is_durable() {
            return Ok(None);
        }

        let fetched = self.store()?.fetch(id)?;
        if let Some(object) = &fetched {
            let register = object.clone();
            main.perform_sync(move |graph| graph.register(register))?;
        }
        Ok(fetched)
    }

    /// Subscribe to committed change-sets.
    ///
    /// Every committed save publishes one [`ChangeSet`]: derived saves when
    /// they commit to the parent, main saves when they commit to the store.
    /// Disconnected receivers are pruned on the next publish.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<ChangeSet> {
        let (tx, rx) = mpsc::channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Fan a committed change-set out to subscribers.
    pub(crate) fn publish(&self, changes: &ChangeSet) {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(changes.clone()).is_ok());
    }
}
