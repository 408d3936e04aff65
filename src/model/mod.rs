//! Data types for the persisted object graph.
//!
//! - [`object`] - Managed objects and their identifiers
//! - [`changeset`] - Committed change-sets published after saves

pub mod changeset;
pub mod object;

pub use changeset::ChangeSet;
pub use object::{ManagedObject, ObjectId};
