//! Scope records: per endpoint synchronization state
//!
//! One record per scope name is kept in the scope table of each side. The
//! client record carries the watermarks of its last sync, the server record
//! carries the metadata retention bound and the history table has one row
//! per client that ever synchronized.

mod store;

pub use store::{ClientScopeStore, ServerScopeStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{SyncSet, SyncSetup};
use crate::upgrade::CURRENT_VERSION;

/// Scope name used when none is given
pub const DEFAULT_SCOPE_NAME: &str = "DefaultScope";

/// Client side scope record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientScopeInfo {
    pub id: Uuid,
    pub name: String,
    pub schema: Option<SyncSet>,
    pub setup: Option<SyncSetup>,
    pub version: String,
    /// True until the first successful apply
    pub is_new_scope: bool,
    pub last_sync: Option<DateTime<Utc>>,
    /// Local clock when the last uploaded changes were selected
    pub last_sync_timestamp: Option<i64>,
    /// Server clock when the last downloaded changes were selected
    pub last_server_sync_timestamp: Option<i64>,
    /// Duration of the last sync, in milliseconds
    pub last_sync_duration: i64,
}

impl ClientScopeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            schema: None,
            setup: None,
            version: CURRENT_VERSION.to_string(),
            is_new_scope: true,
            last_sync: None,
            last_sync_timestamp: None,
            last_server_sync_timestamp: None,
            last_sync_duration: 0,
        }
    }

    pub fn is_provisioned(&self) -> bool {
        self.schema.as_ref().is_some_and(SyncSet::has_tables)
    }
}

/// Server side scope record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerScopeInfo {
    pub name: String,
    pub schema: Option<SyncSet>,
    pub setup: Option<SyncSetup>,
    pub version: String,
    /// Tombstone metadata up to this timestamp has been purged
    pub last_cleanup_timestamp: i64,
    pub is_new_scope: bool,
}

impl ServerScopeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            setup: None,
            version: CURRENT_VERSION.to_string(),
            last_cleanup_timestamp: 0,
            is_new_scope: true,
        }
    }

    pub fn is_provisioned(&self) -> bool {
        self.schema.as_ref().is_some_and(SyncSet::has_tables)
    }
}

/// Server side record of one client's last sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHistoryScopeInfo {
    /// Client scope id
    pub id: Uuid,
    pub name: String,
    pub last_sync_timestamp: Option<i64>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_sync_duration: i64,
    /// Scope version the client reported
    #[serde(default)]
    pub version: Option<String>,
}

impl ServerHistoryScopeInfo {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            last_sync_timestamp: None,
            last_sync: None,
            last_sync_duration: 0,
            version: None,
        }
    }
}

/// What to do when a client scope is outdated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutdatedAction {
    /// Abort with an out of date error
    #[default]
    Rollback,
    /// Reset local tables and download everything, local changes are lost
    Reinitialize,
    /// Upload local changes, then reset and download everything
    ReinitializeWithUpload,
}

/// Whether the server purged metadata the client still needs
///
/// A new client is never outdated.
pub fn is_outdated(client: &ClientScopeInfo, server: &ServerScopeInfo) -> bool {
    if client.is_new_scope {
        return false;
    }
    match client.last_server_sync_timestamp {
        Some(last) => server.last_cleanup_timestamp > 0 && last < server.last_cleanup_timestamp,
        None => false,
    }
}
