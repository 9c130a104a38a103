//! Session Registry (C3): the process-wide `(sessionID, serverName) -> ProviderClient` map.
//!
//! Mirrors the donor crate's `lazy_static` singleton idiom but swaps the coarse
//! `Arc<RwLock<HashMap<..>>>` for a [`dashmap::DashMap`], since this registry is exactly the
//! "`sync.Map`-equivalent" §5 calls for. Single-flight creation is enforced with a second map of
//! per-key creation mutexes keyed by the composite `sessionID|serverName` string, so concurrent
//! callers asking for the same session/server pair block on one connection attempt instead of
//! racing several.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rmcp::model::Implementation;
use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::error::ProviderClientError;
use crate::provider_client::{BackoffPolicy, ProviderClient};

fn composite_key(session_id: &str, server_name: &str) -> String {
    format!("{}|{}", session_id, server_name)
}

/// Global registry of live Provider Clients, one per `(sessionID, serverName)` pair.
pub struct SessionRegistry {
    clients: DashMap<String, Arc<ProviderClient>>,
    creation_locks: DashMap<String, Arc<Mutex<()>>>,
    client_impl: Implementation,
}

impl SessionRegistry {
    pub fn new(client_impl: Implementation) -> Self {
        Self {
            clients: DashMap::new(),
            creation_locks: DashMap::new(),
            client_impl,
        }
    }

    fn creation_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.creation_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Return the existing client for `(session_id, server_name)`, or create and register a new
    /// one. Concurrent callers for the same pair observe single-flight creation: exactly one
    /// connects, the rest receive the same `Arc<ProviderClient>` (P6).
    pub async fn get_or_create(
        &self,
        session_id: &str,
        server_name: &str,
        server: &ServerConfig,
    ) -> Result<Arc<ProviderClient>, ProviderClientError> {
        let key = composite_key(session_id, server_name);

        if let Some(existing) = self.clients.get(&key) {
            return Ok(existing.clone());
        }

        let lock = self.creation_lock(&key);
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock: another task may have just finished connecting.
        if let Some(existing) = self.clients.get(&key) {
            return Ok(existing.clone());
        }

        let client = ProviderClient::connect_with_retry(
            server_name,
            server,
            &self.client_impl,
            BackoffPolicy::default(),
            Duration::from_secs(5 * 60),
        )
        .await?;

        let client = Arc::new(client);
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    /// Close and remove a single `(session, server)` client.
    pub async fn close_session_server(&self, session_id: &str, server_name: &str) {
        let key = composite_key(session_id, server_name);
        if let Some((_, client)) = self.clients.remove(&key) {
            if let Ok(client) = Arc::try_unwrap(client) {
                if let Err(e) = client.close().await {
                    log::warn!("session_registry: error closing {}: {}", key, e);
                }
            }
        }
        self.creation_locks.remove(&key);
    }

    /// Close every client owned by `session_id`.
    pub async fn close_session(&self, session_id: &str) {
        let prefix = format!("{}|", session_id);
        let keys: Vec<String> = self
            .clients
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, client)) = self.clients.remove(&key) {
                if let Ok(client) = Arc::try_unwrap(client) {
                    if let Err(e) = client.close().await {
                        log::warn!("session_registry: error closing {}: {}", key, e);
                    }
                }
            }
            self.creation_locks.remove(&key);
        }
    }

    /// Tear down every client in the registry, across all sessions.
    pub async fn close_all_sessions(&self) {
        let keys: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, client)) = self.clients.remove(&key) {
                if let Ok(client) = Arc::try_unwrap(client) {
                    if let Err(e) = client.close().await {
                        log::warn!("session_registry: error closing {}: {}", key, e);
                    }
                }
            }
        }
        self.creation_locks.clear();
    }

    /// Return every client currently held by `session_id`, keyed by server name.
    ///
    /// Used to verify P5 (`Close` does not evict entries it did not itself remove) and by the
    /// Agent Manager's `GetCapabilities`.
    pub fn session_connections(&self, session_id: &str) -> HashMap<String, Arc<ProviderClient>> {
        let prefix = format!("{}|", session_id);
        self.clients
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| {
                let server_name = e.key()[prefix.len()..].to_string();
                (server_name, e.value().clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_impl() -> Implementation {
        Implementation {
            name: "agentdock-tests".to_string(),
            version: "0.0.0".to_string(),
        }
    }

    #[test]
    fn composite_key_joins_session_and_server() {
        assert_eq!(composite_key("s1", "gmail"), "s1|gmail");
    }

    #[tokio::test]
    async fn session_connections_empty_for_unknown_session() {
        let registry = SessionRegistry::new(test_impl());
        assert!(registry.session_connections("no-such-session").is_empty());
    }
}
