//! Comanda Core Library
//!
//! Client-side realtime sync engine for restaurant operations: a
//! websocket channel session, acknowledged requests, optimistic mirrors of
//! server-owned collections, and the pieces the ordering screens build on.

pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod guard;
pub mod options;
pub mod printer;
pub mod store;
pub mod sync;
pub mod task;
pub mod views;

pub use config::{ReconnectPolicy, SyncTuning};
pub use connectivity::{check_server, Connectivity, Probe, ServerProbe};
pub use credentials::{
    CredentialStore, Credentials, FileStore, KeyValueStore, MemoryStore, StorageError,
};
pub use guard::{ActionGuard, GuardLock, Permit, RowGuard};
pub use options::{OptionsDocument, OptionsEditor};
pub use printer::{
    NetworkPrinter, PermissionGate, PrintEvent, PrintQueue, PrinterDriver, PrinterError, Receipt,
};
pub use store::{
    CollectionKind, CollectionStore, Mutation, Outcome, PendingOperation, Record, RecordId,
    SyncPhase,
};
pub use sync::{ChannelSession, Reply, RequestContext, Requester, SyncError, Transport};
pub use task::ScopedTask;
pub use views::{FilterSet, OrderStatus};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
