//! Tool list fingerprints per sandbox and tool server
//!
//! Discovery asks [`ToolRegistry::check_updates`] whether a server's tool list
//! changed since it was last stored. The registry only compares: callers
//! [`store`](ToolRegistry::store) the new digest once they have acted on it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

/// One tool as advertised by a tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Value,
}

/// Stored digest of a sandbox server's tool list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolsetFingerprint {
    pub digest: String,
    pub stored_at: DateTime<Utc>,
}

/// Cache effectiveness counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Digest of a tool list, independent of tool order
///
/// Covers name, description and input schema of every tool. Object keys are
/// serialized in sorted order, so schema key order does not matter either.
pub fn compute_hash(tools: &[ToolDefinition]) -> String {
    let mut sorted: Vec<&ToolDefinition> = tools.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let normalized: Vec<Value> = sorted
        .into_iter()
        .map(|tool| {
            serde_json::json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.input_schema,
            })
        })
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(Value::Array(normalized).to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Last known tool list digest per `(sandbox_id, server_name)`
#[derive(Debug, Default)]
pub struct ToolRegistry {
    fingerprints: DashMap<(String, String), ToolsetFingerprint>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(sandbox_id: &str, server_name: &str) -> (String, String) {
        (sandbox_id.to_string(), server_name.to_string())
    }

    /// Record the digest the caller has acted on
    pub fn store(&self, sandbox_id: &str, server_name: &str, digest: String) {
        tracing::debug!(sandbox_id, server = %server_name, digest = %digest, "Stored tool fingerprint");
        self.fingerprints.insert(
            Self::key(sandbox_id, server_name),
            ToolsetFingerprint {
                digest,
                stored_at: Utc::now(),
            },
        );
    }

    /// Hash and store a tool list in one step; returns the digest
    pub fn store_tools(&self, sandbox_id: &str, server_name: &str, tools: &[ToolDefinition]) -> String {
        let digest = compute_hash(tools);
        self.store(sandbox_id, server_name, digest.clone());
        digest
    }

    /// Whether discovery is needed for this tool list
    ///
    /// `true` when nothing is stored or the digest differs, `false` when it
    /// matches. Never writes.
    pub fn check_updates(&self, sandbox_id: &str, server_name: &str, current_tools: &[ToolDefinition]) -> bool {
        let digest = compute_hash(current_tools);
        let changed = self
            .fingerprints
            .get(&Self::key(sandbox_id, server_name))
            .map_or(true, |stored| stored.digest != digest);

        if changed {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        changed
    }

    pub fn fingerprint(&self, sandbox_id: &str, server_name: &str) -> Option<ToolsetFingerprint> {
        self.fingerprints
            .get(&Self::key(sandbox_id, server_name))
            .map(|entry| entry.value().clone())
    }

    /// Forget one server's digest; returns whether one was stored
    pub fn invalidate(&self, sandbox_id: &str, server_name: &str) -> bool {
        self.fingerprints
            .remove(&Self::key(sandbox_id, server_name))
            .is_some()
    }

    /// Forget every digest of a sandbox; returns how many were removed
    pub fn invalidate_sandbox(&self, sandbox_id: &str) -> usize {
        let before = self.fingerprints.len();
        self.fingerprints.retain(|(sandbox, _), _| sandbox != sandbox_id);
        let removed = before.saturating_sub(self.fingerprints.len());
        if removed > 0 {
            tracing::debug!(sandbox_id, removed, "Invalidated sandbox tool fingerprints");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            entries: self.fingerprints.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
