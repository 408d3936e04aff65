//! quillstore - persistence-context coordination for the Quill writing app
//!
//! One SQLite store, one long-lived main context bound to its own queue,
//! and short-lived derived contexts for background work. Saves assign
//! durable identifiers, commit transactionally, propagate derived changes
//! to the main context, and publish committed change-sets to subscribers.
//!
//! # Architecture
//!
//! - [`context`] - Context manager, main/derived contexts, save coordination
//! - [`model`] - Managed objects, identifiers, change-sets
//! - [`storage`] - Store location, schema versions, migration, the store
//!   coordinator
//! - [`error`] - Error types and handling
//!
//! # Example
//!
//! ```no_run
//! use quillstore::{ContextManager, StoreConfig};
//!
//! # fn main() -> quillstore::Result<()> {
//! let manager = ContextManager::new(StoreConfig::new());
//!
//! let ctx = manager.new_derived_context();
//! let draft = ctx.insert(
//!     "post",
//!     std::iter::once(("title".into(), "Hello".into())).collect(),
//! )?;
//!
//! let receipt = manager.save_and_wait(&ctx)?;
//! let id = receipt.durable_id_for(&draft).expect("inserted this save");
//! assert!(manager.object(id)?.is_some());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod context;
pub mod error;
pub mod model;
pub mod storage;

pub use context::{obtain_permanent_id, Context, ContextManager, Graph, SaveReceipt};
pub use error::{Error, Result};
pub use model::{ChangeSet, ManagedObject, ObjectId};
pub use storage::{MigrationOutcome, StoreConfig, StoreCoordinator};
