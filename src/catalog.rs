//! Tool Catalog Cache (C4): disk+memory cache of discovered MCP tool schemas.
//!
//! Entries are keyed by `unified_<serverName>_<sha256-config-hash>` (P1, P2) and carry a
//! primary/duplicate ownership tag for tool names that collide across servers (P3). The memory
//! side is a [`dashmap::DashMap`] per §5's "lock-free concurrent map" requirement; the disk side
//! writes via temp-file-then-rename for atomicity, mirroring the donor crate's cache-refresh
//! field layout in its (now superseded) `McpClientProtocol`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CatalogError;
use crate::provider_client::McpToolDescriptor;

/// One tool's ownership status when the same tool name is discovered from more than one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ownership {
    /// This entry is the one the effective toolset dispatches to.
    Primary,
    /// A same-named tool from another server; excluded from the effective toolset.
    Duplicate,
}

/// A single cached tool schema plus its ownership tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub ownership: Ownership,
}

/// One cache entry: everything discovered for a `(serverName, configHash)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub server_name: String,
    pub config_hash: String,
    pub tools: Vec<CachedTool>,
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    /// The deterministic key this entry is stored and looked up under (P1).
    pub fn unified_key(&self) -> String {
        unified_key(&self.server_name, &self.config_hash)
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.cached_at);
        age.to_std().map(|a| a > ttl).unwrap_or(false)
    }
}

/// Compute the deterministic `unified_<server>_<hash>` cache key.
///
/// `config_hash` must already be a stable hash (see [`hash_config`]) so that two configurations
/// differing only in map iteration order still produce byte-identical keys (P1).
pub fn unified_key(server_name: &str, config_hash: &str) -> String {
    format!("unified_{}_{}", server_name, config_hash)
}

/// Hash a server configuration (serialized to canonical JSON with sorted keys) to a stable
/// hex-encoded SHA-256 digest, independent of the original map's iteration order.
pub fn hash_config(config: &serde_json::Value) -> String {
    let canonical = canonicalize(config);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{:?}:{}", k, canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

/// Disk + memory cache of discovered tool catalogs.
pub struct Catalog {
    memory: DashMap<String, CacheEntry>,
    cache_dir: PathBuf,
    ttl: Duration,
    codegen_enabled: AtomicBool,
}

impl Catalog {
    pub fn new(cache_dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            memory: DashMap::new(),
            cache_dir: cache_dir.into(),
            ttl,
            codegen_enabled: AtomicBool::new(false),
        }
    }

    pub fn set_codegen_enabled(&self, enabled: bool) {
        self.codegen_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn codegen_enabled(&self) -> bool {
        self.codegen_enabled.load(Ordering::SeqCst)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", key))
    }

    /// Fetch a cache entry, trying memory first, then disk. Expired entries are evicted from
    /// memory (a [`crate::event::RuntimeEvent::CacheExpired`] is the caller's responsibility to
    /// emit) and treated as a miss.
    pub async fn get(&self, server_name: &str, config_hash: &str) -> Option<CacheEntry> {
        let key = unified_key(server_name, config_hash);

        if let Some(entry) = self.memory.get(&key) {
            if entry.is_expired(self.ttl) {
                drop(entry);
                self.memory.remove(&key);
            } else {
                return Some(entry.clone());
            }
        }

        match self.load_from_disk(&key).await {
            Ok(Some(entry)) if !entry.is_expired(self.ttl) => {
                self.memory.insert(key, entry.clone());
                Some(entry)
            }
            _ => None,
        }
    }

    async fn load_from_disk(&self, key: &str) -> Result<Option<CacheEntry>, CatalogError> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CatalogError::Io(e.to_string()))?;
        let entry: CacheEntry =
            serde_json::from_str(&text).map_err(|e| CatalogError::Serde(e.to_string()))?;
        Ok(Some(entry))
    }

    /// Store a freshly discovered tool list and resolve ownership for every tool name at
    /// write time (not at agent-build time), so independent agents see a consistent view (§9
    /// "Tool ownership on multi-server toolname collisions"). The tiebreaker is the
    /// lexicographic order of `(serverName, configHash)` — deterministic regardless of which
    /// server happened to discover first — rather than insertion order. Writes atomically via
    /// temp-file-then-rename (§5).
    pub async fn put(
        &self,
        server_name: &str,
        config_hash: &str,
        discovered: Vec<McpToolDescriptor>,
    ) -> Result<CacheEntry, CatalogError> {
        let key = unified_key(server_name, config_hash);

        let tools: Vec<CachedTool> = discovered
            .into_iter()
            .map(|t| CachedTool {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
                // Placeholder; reconciled against every other cached entry immediately below.
                ownership: Ownership::Primary,
            })
            .collect();

        let entry = CacheEntry {
            server_name: server_name.to_string(),
            config_hash: config_hash.to_string(),
            tools,
            cached_at: Utc::now(),
        };

        self.write_to_disk(&key, &entry).await?;
        self.memory.insert(key.clone(), entry.clone());

        let tool_names: Vec<String> = entry.tools.iter().map(|t| t.name.clone()).collect();
        for name in &tool_names {
            self.reconcile_ownership(name).await?;
        }

        // Re-read back from memory: reconciliation may have just rewritten this entry's own
        // ownership tags in place.
        let final_entry = self
            .memory
            .get(&key)
            .map(|e| e.clone())
            .expect("entry was just inserted above");
        Ok(final_entry)
    }

    /// Recompute which `(serverName, configHash)` owns `tool_name` across every entry currently
    /// in memory, and persist any entry whose ownership tag for `tool_name` changed as a result.
    async fn reconcile_ownership(&self, tool_name: &str) -> Result<(), CatalogError> {
        let mut holders: Vec<String> = self
            .memory
            .iter()
            .filter(|e| e.tools.iter().any(|t| t.name == tool_name))
            .map(|e| e.key().clone())
            .collect();
        holders.sort();
        let Some(primary_key) = holders.first().cloned() else {
            return Ok(());
        };

        for key in holders {
            let is_primary = key == primary_key;
            let mut changed = false;
            if let Some(mut entry) = self.memory.get_mut(&key) {
                for tool in entry.tools.iter_mut() {
                    if tool.name == tool_name {
                        let wanted = if is_primary { Ownership::Primary } else { Ownership::Duplicate };
                        if tool.ownership != wanted {
                            tool.ownership = wanted;
                            changed = true;
                        }
                    }
                }
            }
            if changed {
                let entry = self.memory.get(&key).map(|e| e.clone());
                if let Some(entry) = entry {
                    self.write_to_disk(&key, &entry).await?;
                }
            }
        }
        Ok(())
    }

    async fn write_to_disk(&self, key: &str, entry: &CacheEntry) -> Result<(), CatalogError> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| CatalogError::Io(e.to_string()))?;
        let final_path = self.entry_path(key);
        let tmp_path = self.cache_dir.join(format!("{}.json.tmp", key));

        let json = serde_json::to_string_pretty(entry)
            .map_err(|e| CatalogError::Serde(e.to_string()))?;
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| CatalogError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| CatalogError::Io(e.to_string()))?;
        Ok(())
    }

    /// Remove an entry from memory and disk. In-memory state is released before the disk removal
    /// is attempted (§5).
    pub async fn invalidate(&self, server_name: &str, config_hash: &str) {
        let key = unified_key(server_name, config_hash);
        self.memory.remove(&key);
        let path = self.entry_path(&key);
        let _ = tokio::fs::remove_file(&path).await;
    }

    /// Remove every cache entry (across all config hashes) for `server_name`, along with any
    /// generated artifacts under its package directory.
    pub async fn invalidate_by_server(&self, server_name: &str) {
        let keys: Vec<String> = self
            .memory
            .iter()
            .filter(|e| e.server_name == server_name)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            self.memory.remove(&key);
            let path = self.entry_path(&key);
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    /// Sweep expired entries from both memory and disk.
    pub async fn cleanup(&self) {
        let expired: Vec<String> = self
            .memory
            .iter()
            .filter(|e| e.is_expired(self.ttl))
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            self.memory.remove(&key);
            let path = self.entry_path(&key);
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    /// Re-read a single entry from disk into memory, discarding whatever was cached for it.
    pub async fn reload_from_disk(&self, server_name: &str, config_hash: &str) -> Result<Option<CacheEntry>, CatalogError> {
        let key = unified_key(server_name, config_hash);
        match self.load_from_disk(&key).await? {
            Some(entry) => {
                self.memory.insert(key, entry.clone());
                Ok(Some(entry))
            }
            None => {
                self.memory.remove(&key);
                Ok(None)
            }
        }
    }

    /// Independent copies of every entry currently cached in memory.
    pub fn get_all_entries(&self) -> Vec<CacheEntry> {
        self.memory.iter().map(|e| e.clone()).collect()
    }

    /// Directory backing this catalog's disk layer, exposed for tests and artifact generation.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_key_is_deterministic_regardless_of_field_order() {
        let a = serde_json::json!({"command": "npx", "args": ["-y", "x"]});
        let b = serde_json::json!({"args": ["-y", "x"], "command": "npx"});
        assert_eq!(hash_config(&a), hash_config(&b));
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path(), Duration::from_secs(3600));
        catalog
            .put(
                "gmail",
                "abc123",
                vec![McpToolDescriptor {
                    name: "search_emails".to_string(),
                    description: "Search emails".to_string(),
                    input_schema: serde_json::json!({"type": "object"}),
                }],
            )
            .await
            .unwrap();

        let entry = catalog.get("gmail", "abc123").await.unwrap();
        assert_eq!(entry.tools.len(), 1);
        assert_eq!(entry.tools[0].ownership, Ownership::Primary);
    }

    #[tokio::test]
    async fn second_server_with_same_tool_name_is_marked_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path(), Duration::from_secs(3600));
        catalog
            .put(
                "gmail-v1",
                "h1",
                vec![McpToolDescriptor {
                    name: "search_emails".to_string(),
                    description: "v1".to_string(),
                    input_schema: serde_json::json!({}),
                }],
            )
            .await
            .unwrap();
        let second = catalog
            .put(
                "gmail-v2",
                "h2",
                vec![McpToolDescriptor {
                    name: "search_emails".to_string(),
                    description: "v2".to_string(),
                    input_schema: serde_json::json!({}),
                }],
            )
            .await
            .unwrap();
        assert_eq!(second.tools[0].ownership, Ownership::Duplicate);
    }

    #[tokio::test]
    async fn cache_hit_after_restart_reads_from_disk_without_memory() {
        let dir = tempfile::tempdir().unwrap();
        {
            let catalog = Catalog::new(dir.path(), Duration::from_secs(3600));
            catalog
                .put(
                    "serverA",
                    "H",
                    vec![McpToolDescriptor {
                        name: "tool1".to_string(),
                        description: "d".to_string(),
                        input_schema: serde_json::json!({}),
                    }],
                )
                .await
                .unwrap();
        }
        // Fresh Catalog instance, simulating a process restart: memory is empty, disk is not.
        let restarted = Catalog::new(dir.path(), Duration::from_secs(3600));
        let entry = restarted.get("serverA", "H").await.unwrap();
        assert_eq!(entry.tools.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_by_server_removes_every_config_hash_for_that_server() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path(), Duration::from_secs(3600));
        catalog.put("gmail", "h1", vec![]).await.unwrap();
        catalog.put("gmail", "h2", vec![]).await.unwrap();
        catalog.put("weather", "h3", vec![]).await.unwrap();

        catalog.invalidate_by_server("gmail").await;

        assert!(catalog.get("gmail", "h1").await.is_none());
        assert!(catalog.get("gmail", "h2").await.is_none());
        assert!(catalog.get("weather", "h3").await.is_some());
    }

    #[tokio::test]
    async fn cleanup_sweeps_expired_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path(), Duration::from_millis(0));
        catalog.put("gmail", "h1", vec![]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        catalog.cleanup().await;
        assert!(catalog.get_all_entries().is_empty());
    }
}
