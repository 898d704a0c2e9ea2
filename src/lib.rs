//! Tracksync - change-tracking synchronization core
//!
//! Provisions tracking metadata on two databases, selects changed rows into
//! batch files, applies them on the other side and keeps per-scope
//! watermarks so every session only moves what changed since the last one.

pub mod agent;
pub mod batch;
pub mod changes;
pub mod config;
pub mod error;
pub mod migration;
pub mod orchestrator;
pub mod provider;
pub mod provision;
pub mod schema;
pub mod scope;
pub mod types;
pub mod upgrade;

pub use agent::{RemoteEndpoint, SyncAgent, SyncResult};
pub use batch::{BatchInfo, BatchPartInfo};
pub use changes::{DatabaseChangesApplied, DatabaseChangesSelected, RowState, SyncRow};
pub use config::SyncOptions;
pub use error::{Result, SyncError};
pub use migration::MigrationPlan;
pub use orchestrator::{
    ClientChanges, Interceptors, LocalOrchestrator, RemoteOrchestrator, ServerSyncChanges,
    ServerSyncRequest, SyncEvent,
};
pub use provider::Provider;
pub use provision::{Provision, SyncProvision};
pub use schema::{SyncColumn, SyncRelation, SyncSet, SyncSetup, SyncTable, TableRef};
pub use scope::{ClientScopeInfo, OutdatedAction, ServerHistoryScopeInfo, ServerScopeInfo};
pub use types::*;
pub use upgrade::{SyncVersion, CURRENT_VERSION};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
