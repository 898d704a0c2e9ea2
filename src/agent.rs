//! Session driver
//!
//! [`SyncAgent`] runs one synchronization session between a
//! [`LocalOrchestrator`] and a server reached through [`RemoteEndpoint`].
//! The endpoint is implemented in process by [`RemoteOrchestrator`]; a
//! networked transport implements the same trait.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::orchestrator::{LocalOrchestrator, RemoteOrchestrator, ServerSyncChanges, ServerSyncRequest};
use crate::scope::{OutdatedAction, ServerScopeInfo};

/// The server as seen by a client
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Provision, migrate or upgrade the server and return its scope
    async fn ensure_schema(&self) -> Result<ServerScopeInfo>;

    async fn apply_then_get_changes(&self, request: ServerSyncRequest) -> Result<ServerSyncChanges>;
}

#[async_trait]
impl RemoteEndpoint for RemoteOrchestrator {
    async fn ensure_schema(&self) -> Result<ServerScopeInfo> {
        RemoteOrchestrator::ensure_schema(self).await
    }

    async fn apply_then_get_changes(&self, request: ServerSyncRequest) -> Result<ServerSyncChanges> {
        RemoteOrchestrator::apply_then_get_changes(self, request).await
    }
}

/// Outcome of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Changes selected on the client
    pub total_changes_uploaded: u64,
    /// Changes selected on the server
    pub total_changes_downloaded: u64,
    pub total_changes_applied_on_server: u64,
    pub total_changes_applied_on_client: u64,
    pub total_resolved_conflicts: u64,
    /// Set when the client was outdated and reinitialized
    pub outdated_action: Option<OutdatedAction>,
}

/// Drives synchronization sessions for one client
pub struct SyncAgent {
    local: LocalOrchestrator,
    remote: Arc<dyn RemoteEndpoint>,
}

impl SyncAgent {
    pub fn new(local: LocalOrchestrator, remote: Arc<dyn RemoteEndpoint>) -> Self {
        Self { local, remote }
    }

    pub fn local(&self) -> &LocalOrchestrator {
        &self.local
    }

    /// Run one session: upload local changes, download the server's
    ///
    /// The session is ended whether it succeeded or not.
    pub async fn synchronize(&self) -> Result<SyncResult> {
        self.local.begin_session()?;
        let result = self.run_session().await;
        let ended = self.local.end_session();
        let result = result?;
        ended?;
        Ok(result)
    }

    async fn run_session(&self) -> Result<SyncResult> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let server_scope = self.remote.ensure_schema().await?;
        let client_scope = self.local.get_client_scope().await?;
        let client_scope = self.local.ensure_schema(&client_scope, &server_scope).await?;

        let outdated_action = self.local.check_outdated(&client_scope, &server_scope)?;
        let reinitialize = outdated_action.is_some();

        // A plain reinitialization drops local changes instead of uploading them
        let uploaded = match outdated_action {
            Some(OutdatedAction::Reinitialize) => None,
            _ => Some(self.local.get_changes(&client_scope).await?),
        };

        let mut request = ServerSyncRequest::new(client_scope.clone())
            .with_parameters(self.local.base().parameters().clone())
            .reinitialize(reinitialize);
        if let Some(changes) = &uploaded {
            request = request.with_batch(changes.batch_info.clone());
        }
        let server_changes = self.remote.apply_then_get_changes(request).await?;

        if let Some(changes) = &uploaded {
            if self.local.base().options().clean_folder {
                if let Err(e) = changes.batch_info.remove_directory().await {
                    tracing::warn!("Removing the uploaded batch failed: {}", e);
                }
            }
        }

        let (mut client_scope, applied) = self
            .local
            .apply_changes(&client_scope, &server_changes, uploaded.as_ref(), reinitialize)
            .await?;
        client_scope.last_sync_duration = i64::try_from(clock.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.local.save_client_scope(&client_scope).await?;

        let result = SyncResult {
            started_at,
            completed_at: Utc::now(),
            total_changes_uploaded: uploaded
                .as_ref()
                .map_or(0, |c| c.changes_selected.total_changes_selected()),
            total_changes_downloaded: server_changes.changes_selected.total_changes_selected(),
            total_changes_applied_on_server: server_changes.changes_applied.total_applied(),
            total_changes_applied_on_client: applied.total_applied(),
            total_resolved_conflicts: server_changes.changes_applied.total_resolved_conflicts()
                + applied.total_resolved_conflicts(),
            outdated_action,
        };
        tracing::info!(
            "Synchronized scope {}: {} uploaded, {} downloaded, {} conflicts in {} ms",
            client_scope.name,
            result.total_changes_uploaded,
            result.total_changes_downloaded,
            result.total_resolved_conflicts,
            client_scope.last_sync_duration
        );
        Ok(result)
    }
}
