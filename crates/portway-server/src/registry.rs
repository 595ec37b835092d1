//! Client registry
//!
//! In-memory map of every known client, active or disconnected, optionally
//! backed by a persistent provider. Writes go to the provider first; the
//! cache only mutates after the store accepted the row, so a persistence
//! failure never leaves the two views disagreeing. Lock regions are
//! synchronous and free of I/O.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use portway_server_db::{ClientRecord, ClientStore};

use crate::clients::{client_matches, compile_filters, Client, FilterOption, User};
use crate::error::{Error, Result};

/// Persistent backing for the registry.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn get_all(&self) -> Result<Vec<Client>>;
    async fn save(&self, client: &Client) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn delete_obsolete(&self) -> Result<()>;
}

/// sea-orm backed provider. The row is `(id, client_auth_id,
/// disconnected_at, details)`; `details` is the full client JSON.
pub struct DbClientProvider {
    store: ClientStore,
    keep_lost: Option<Duration>,
}

impl DbClientProvider {
    pub fn new(store: ClientStore, keep_lost: Option<Duration>) -> Self {
        Self { store, keep_lost }
    }

    fn cutoff(&self) -> Option<chrono::DateTime<Utc>> {
        self.keep_lost.map(|keep| Utc::now() - keep)
    }
}

#[async_trait]
impl ClientProvider for DbClientProvider {
    async fn get_all(&self) -> Result<Vec<Client>> {
        let rows = self.store.get_all_recent(self.cutoff()).await?;
        let mut clients = Vec::with_capacity(rows.len());
        for row in rows {
            let mut client: Client = serde_json::from_value(row.details)
                .map_err(|e| Error::Internal(format!("corrupt client row {}: {e}", row.id)))?;
            client.id = row.id;
            client.client_auth_id = row.client_auth_id;
            client.disconnected_at = row.disconnected_at;
            clients.push(client);
        }
        Ok(clients)
    }

    async fn save(&self, client: &Client) -> Result<()> {
        let details = serde_json::to_value(client)
            .map_err(|e| Error::Internal(format!("failed to encode client: {e}")))?;
        let record = ClientRecord {
            id: client.id.clone(),
            client_auth_id: client.client_auth_id.clone(),
            disconnected_at: client.disconnected_at,
            details,
        };
        self.store.save(&record).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.store.delete(id).await?;
        Ok(())
    }

    async fn delete_obsolete(&self) -> Result<()> {
        if let Some(cutoff) = self.cutoff() {
            let removed = self.store.delete_obsolete(cutoff).await?;
            if removed > 0 {
                debug!(removed, "purged obsolete client rows");
            }
        }
        Ok(())
    }
}

/// Thread-safe registry of clients keyed by id.
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Client>>,
    keep_lost: Option<Duration>,
    provider: Option<Arc<dyn ClientProvider>>,
}

impl ClientRegistry {
    pub fn new(keep_lost: Option<Duration>, provider: Option<Arc<dyn ClientProvider>>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            keep_lost,
            provider,
        }
    }

    /// Cold start: populate the cache with everything the provider kept.
    /// Clients that were connected when the server went down are marked
    /// disconnected now.
    pub async fn load(&self) -> Result<usize> {
        let Some(provider) = &self.provider else {
            return Ok(0);
        };

        let mut initial = provider.get_all().await?;
        for client in &mut initial {
            if client.disconnected_at.is_none() {
                client.disconnected_at = Some(Utc::now());
                provider.save(client).await?;
            }
        }

        let count = initial.len();
        let mut clients = self.clients.write().unwrap();
        for client in initial {
            clients.insert(client.id.clone(), client);
        }
        info!(count, "client registry loaded");
        Ok(count)
    }

    pub fn keep_lost(&self) -> Option<Duration> {
        self.keep_lost
    }

    /// Upsert by id: persist first, then mutate the cache.
    pub async fn save(&self, client: &Client) -> Result<()> {
        if let Some(provider) = &self.provider {
            provider.save(client).await?;
        }
        let mut clients = self.clients.write().unwrap();
        clients.insert(client.id.clone(), client.clone());
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if let Some(provider) = &self.provider {
            provider.delete(id).await?;
        }
        let mut clients = self.clients.write().unwrap();
        clients.remove(id);
        Ok(())
    }

    /// `None` for unknown or obsolete ids.
    pub fn get_by_id(&self, id: &str) -> Option<Client> {
        let clients = self.clients.read().unwrap();
        clients
            .get(id)
            .filter(|c| !c.obsolete(self.keep_lost))
            .cloned()
    }

    /// `None` unless the client is currently connected.
    pub fn get_active_by_id(&self, id: &str) -> Option<Client> {
        let clients = self.clients.read().unwrap();
        clients
            .get(id)
            .filter(|c| c.disconnected_at.is_none())
            .cloned()
    }

    /// Snapshot of all non-obsolete clients.
    pub fn get_all(&self) -> Vec<Client> {
        let clients = self.clients.read().unwrap();
        clients
            .values()
            .filter(|c| !c.obsolete(self.keep_lost))
            .cloned()
            .collect()
    }

    pub fn get_all_active(&self) -> Vec<Client> {
        let clients = self.clients.read().unwrap();
        clients
            .values()
            .filter(|c| c.disconnected_at.is_none())
            .cloned()
            .collect()
    }

    pub fn get_all_by_auth_id(&self, client_auth_id: &str) -> Vec<Client> {
        self.get_all()
            .into_iter()
            .filter(|c| c.client_auth_id == client_auth_id)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.get_all().len()
    }

    pub fn count_active(&self) -> usize {
        self.get_all_active().len()
    }

    pub fn count_disconnected(&self) -> usize {
        self.get_all()
            .iter()
            .filter(|c| c.disconnected_at.is_some())
            .count()
    }

    /// Evict obsolete clients from store and cache; returns the evicted
    /// records so the caller can clean up whatever else references them.
    pub async fn delete_obsolete(&self) -> Result<Vec<Client>> {
        if let Some(provider) = &self.provider {
            provider.delete_obsolete().await?;
        }

        let mut clients = self.clients.write().unwrap();
        let obsolete_ids: Vec<String> = clients
            .values()
            .filter(|c| c.obsolete(self.keep_lost))
            .map(|c| c.id.clone())
            .collect();

        let mut deleted = Vec::with_capacity(obsolete_ids.len());
        for id in obsolete_ids {
            if let Some(client) = clients.remove(&id) {
                deleted.push(client);
            }
        }
        Ok(deleted)
    }

    /// Non-obsolete clients the user may see, narrowed by field filters.
    /// Filters compile once for the whole pass.
    pub fn get_user_clients(
        &self,
        user: &dyn User,
        filters: &[FilterOption],
    ) -> Result<Vec<Client>> {
        let compiled = compile_filters(filters)?;
        let is_admin = user.is_admin();
        let groups = user.groups();

        let clients = self.clients.read().unwrap();
        let mut result = Vec::new();
        for client in clients.values() {
            if client.obsolete(self.keep_lost) {
                continue;
            }
            if !is_admin && !client.has_access(&groups) {
                continue;
            }
            if client_matches(client, &compiled)? {
                result.push(client.clone());
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct AdminUser;
    impl User for AdminUser {
        fn is_admin(&self) -> bool {
            true
        }
        fn groups(&self) -> Vec<String> {
            Vec::new()
        }
    }

    struct GroupUser(Vec<String>);
    impl User for GroupUser {
        fn is_admin(&self) -> bool {
            false
        }
        fn groups(&self) -> Vec<String> {
            self.0.clone()
        }
    }

    fn client(id: &str) -> Client {
        Client {
            id: id.to_string(),
            name: format!("name-{id}"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn save_and_get() {
        let registry = ClientRegistry::new(None, None);
        registry.save(&client("a")).await.unwrap();

        assert_eq!(registry.get_by_id("a").unwrap().id, "a");
        assert!(registry.get_by_id("missing").is_none());
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.count_active(), 1);
    }

    #[tokio::test]
    async fn active_vs_disconnected() {
        let registry = ClientRegistry::new(Some(Duration::hours(1)), None);

        let mut c = client("a");
        registry.save(&c).await.unwrap();
        assert!(registry.get_active_by_id("a").is_some());

        c.disconnected_at = Some(Utc::now());
        registry.save(&c).await.unwrap();
        assert!(registry.get_active_by_id("a").is_none());
        // Still visible while not obsolete.
        assert!(registry.get_by_id("a").is_some());
        assert_eq!(registry.count_disconnected(), 1);
    }

    #[tokio::test]
    async fn obsolete_clients_hidden_and_evicted() {
        let registry = ClientRegistry::new(Some(Duration::minutes(10)), None);

        let mut stale = client("stale");
        stale.disconnected_at = Some(Utc::now() - Duration::hours(1));
        registry.save(&stale).await.unwrap();
        registry.save(&client("fresh")).await.unwrap();

        assert!(registry.get_by_id("stale").is_none());
        assert_eq!(registry.get_all().len(), 1);

        let evicted = registry.delete_obsolete().await.unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, "stale");

        // Idempotent.
        let evicted = registry.delete_obsolete().await.unwrap();
        assert!(evicted.is_empty());
    }

    #[tokio::test]
    async fn user_filtering_respects_groups() {
        let registry = ClientRegistry::new(None, None);

        let mut visible = client("visible");
        visible.allowed_user_groups = vec!["ops".to_string()];
        registry.save(&visible).await.unwrap();
        registry.save(&client("hidden")).await.unwrap();

        let admin_view = registry.get_user_clients(&AdminUser, &[]).unwrap();
        assert_eq!(admin_view.len(), 2);

        let ops_view = registry
            .get_user_clients(&GroupUser(vec!["ops".to_string()]), &[])
            .unwrap();
        assert_eq!(ops_view.len(), 1);
        assert_eq!(ops_view[0].id, "visible");
    }

    #[tokio::test]
    async fn user_filtering_applies_field_filters() {
        let registry = ClientRegistry::new(None, None);
        registry.save(&client("a")).await.unwrap();
        registry.save(&client("b")).await.unwrap();

        let filters = vec![FilterOption {
            column: "name".to_string(),
            values: vec!["name-a".to_string()],
        }];
        let result = registry.get_user_clients(&AdminUser, &filters).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "a");
    }

    /// Provider whose save fails on demand: the cache must not change.
    struct FailingProvider {
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl ClientProvider for FailingProvider {
        async fn get_all(&self) -> Result<Vec<Client>> {
            Ok(Vec::new())
        }
        async fn save(&self, _client: &Client) -> Result<()> {
            if *self.fail.lock().unwrap() {
                Err(Error::Internal("disk on fire".to_string()))
            } else {
                Ok(())
            }
        }
        async fn delete(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_obsolete(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_persist_leaves_cache_untouched() {
        let provider = Arc::new(FailingProvider {
            fail: Mutex::new(false),
        });
        let registry = ClientRegistry::new(None, Some(provider.clone()));

        registry.save(&client("a")).await.unwrap();

        *provider.fail.lock().unwrap() = true;
        let err = registry.save(&client("b")).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        assert!(registry.get_by_id("a").is_some());
        assert!(registry.get_by_id("b").is_none());
    }
}
