//! Typed access to the scope tables of each side

use std::sync::Arc;

use uuid::Uuid;

use super::{ClientScopeInfo, ServerHistoryScopeInfo, ServerScopeInfo};
use crate::error::Result;
use crate::provider::{DbConnection, ScopeBuilder};
use crate::types::ScopeType;

async fn ensure_scope_table(
    builder: &dyn ScopeBuilder,
    conn: &dyn DbConnection,
    scope_type: ScopeType,
) -> Result<bool> {
    if builder.exists_scope_table(conn, scope_type).await? {
        return Ok(false);
    }
    builder.create_scope_table(conn, scope_type).await?;
    tracing::debug!("Created {} scope table", scope_type);
    Ok(true)
}

/// Client scope records
#[derive(Clone)]
pub struct ClientScopeStore {
    builder: Arc<dyn ScopeBuilder>,
}

impl ClientScopeStore {
    pub fn new(builder: Arc<dyn ScopeBuilder>) -> Self {
        Self { builder }
    }

    pub fn builder(&self) -> &Arc<dyn ScopeBuilder> {
        &self.builder
    }

    /// Create the scope table if missing, returning whether it was created
    pub async fn ensure_table(&self, conn: &dyn DbConnection) -> Result<bool> {
        ensure_scope_table(self.builder.as_ref(), conn, ScopeType::Client).await
    }

    pub async fn get(&self, conn: &dyn DbConnection, name: &str) -> Result<Option<ClientScopeInfo>> {
        if !self.builder.exists_scope_table(conn, ScopeType::Client).await? {
            return Ok(None);
        }
        self.builder.load_client_scope(conn, name).await
    }

    /// Load the record, creating and saving a new one on first access
    pub async fn get_or_create(&self, conn: &dyn DbConnection, name: &str) -> Result<ClientScopeInfo> {
        self.ensure_table(conn).await?;
        if let Some(scope) = self.builder.load_client_scope(conn, name).await? {
            return Ok(scope);
        }
        let scope = ClientScopeInfo::new(name);
        self.builder.save_client_scope(conn, &scope).await?;
        tracing::info!("Created client scope {} ({})", scope.name, scope.id);
        Ok(scope)
    }

    pub async fn save(&self, conn: &dyn DbConnection, scope: &ClientScopeInfo) -> Result<()> {
        self.ensure_table(conn).await?;
        self.builder.save_client_scope(conn, scope).await
    }

    pub async fn delete(&self, conn: &dyn DbConnection, name: &str) -> Result<()> {
        if self.builder.exists_scope_table(conn, ScopeType::Client).await? {
            self.builder.delete_client_scope(conn, name).await?;
        }
        Ok(())
    }
}

/// Server scope and server history records
#[derive(Clone)]
pub struct ServerScopeStore {
    builder: Arc<dyn ScopeBuilder>,
}

impl ServerScopeStore {
    pub fn new(builder: Arc<dyn ScopeBuilder>) -> Self {
        Self { builder }
    }

    pub fn builder(&self) -> &Arc<dyn ScopeBuilder> {
        &self.builder
    }

    /// Create the server and history scope tables if missing
    pub async fn ensure_tables(&self, conn: &dyn DbConnection) -> Result<()> {
        ensure_scope_table(self.builder.as_ref(), conn, ScopeType::Server).await?;
        ensure_scope_table(self.builder.as_ref(), conn, ScopeType::ServerHistory).await?;
        Ok(())
    }

    pub async fn get(&self, conn: &dyn DbConnection, name: &str) -> Result<Option<ServerScopeInfo>> {
        if !self.builder.exists_scope_table(conn, ScopeType::Server).await? {
            return Ok(None);
        }
        self.builder.load_server_scope(conn, name).await
    }

    pub async fn get_or_create(&self, conn: &dyn DbConnection, name: &str) -> Result<ServerScopeInfo> {
        self.ensure_tables(conn).await?;
        if let Some(scope) = self.builder.load_server_scope(conn, name).await? {
            return Ok(scope);
        }
        let scope = ServerScopeInfo::new(name);
        self.builder.save_server_scope(conn, &scope).await?;
        tracing::info!("Created server scope {}", scope.name);
        Ok(scope)
    }

    pub async fn save(&self, conn: &dyn DbConnection, scope: &ServerScopeInfo) -> Result<()> {
        self.ensure_tables(conn).await?;
        self.builder.save_server_scope(conn, scope).await
    }

    pub async fn delete(&self, conn: &dyn DbConnection, name: &str) -> Result<()> {
        if self.builder.exists_scope_table(conn, ScopeType::Server).await? {
            self.builder.delete_server_scope(conn, name).await?;
        }
        Ok(())
    }

    pub async fn history(&self, conn: &dyn DbConnection, name: &str) -> Result<Vec<ServerHistoryScopeInfo>> {
        if !self.builder.exists_scope_table(conn, ScopeType::ServerHistory).await? {
            return Ok(Vec::new());
        }
        self.builder.load_server_history(conn, name).await
    }

    pub async fn history_scope(
        &self,
        conn: &dyn DbConnection,
        id: Uuid,
        name: &str,
    ) -> Result<Option<ServerHistoryScopeInfo>> {
        Ok(self
            .history(conn, name)
            .await?
            .into_iter()
            .find(|h| h.id == id))
    }

    pub async fn save_history(&self, conn: &dyn DbConnection, scope: &ServerHistoryScopeInfo) -> Result<()> {
        self.ensure_tables(conn).await?;
        self.builder.save_server_history(conn, scope).await
    }

    pub async fn delete_history(&self, conn: &dyn DbConnection, name: &str) -> Result<()> {
        if self.builder.exists_scope_table(conn, ScopeType::ServerHistory).await? {
            self.builder.delete_server_history(conn, name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::InMemoryProvider;
    use crate::provider::Provider;

    #[tokio::test]
    async fn test_client_scope_created_once() {
        let provider = InMemoryProvider::new();
        let conn = provider.create_connection();
        conn.open().await.unwrap();
        let store = ClientScopeStore::new(provider.scope_builder("scope_info"));

        assert!(store.get(conn.as_ref(), "sales").await.unwrap().is_none());

        let first = store.get_or_create(conn.as_ref(), "sales").await.unwrap();
        let second = store.get_or_create(conn.as_ref(), "sales").await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.is_new_scope);

        store.delete(conn.as_ref(), "sales").await.unwrap();
        assert!(store.get(conn.as_ref(), "sales").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_history_rows() {
        let provider = InMemoryProvider::new();
        let conn = provider.create_connection();
        conn.open().await.unwrap();
        let store = ServerScopeStore::new(provider.scope_builder("scope_info"));
        store.get_or_create(conn.as_ref(), "sales").await.unwrap();

        let mut a = ServerHistoryScopeInfo::new(Uuid::new_v4(), "sales");
        a.last_sync_timestamp = Some(4);
        let b = ServerHistoryScopeInfo::new(Uuid::new_v4(), "sales");
        store.save_history(conn.as_ref(), &a).await.unwrap();
        store.save_history(conn.as_ref(), &b).await.unwrap();

        assert_eq!(store.history(conn.as_ref(), "sales").await.unwrap().len(), 2);
        let found = store.history_scope(conn.as_ref(), a.id, "sales").await.unwrap();
        assert_eq!(found.and_then(|h| h.last_sync_timestamp), Some(4));
        assert!(store.history(conn.as_ref(), "other").await.unwrap().is_empty());
    }
}
