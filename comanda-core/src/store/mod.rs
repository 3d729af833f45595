//! Optimistic collection stores.
//!
//! A [`CollectionStore`] mirrors one server-owned collection. Snapshots
//! pushed by the server replace the mirror wholesale; mutations may edit it
//! ahead of confirmation and are never rolled back, since the next snapshot
//! is the source of truth.

mod collection;
mod kind;
mod record;

pub use collection::{
    CollectionStore, Delivery, Mutation, Optimistic, Outcome, PendingOperation, SyncPhase,
};
pub use kind::{CollectionKind, RoleVariant};
pub use record::{value_as_string, Record, RecordId};
