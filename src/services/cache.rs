//! Semantic cache for generated payloads.
//!
//! Entries are keyed by a content-addressed signature of the generation
//! request; values are canonical validated JSON plus the model and prompt
//! version that produced them.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub model_id: String,
    pub prompt_version: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(15 * 60), max_entries: 2000 }
    }
}

/// TTL cache with bounded entries and oldest-first eviction.
///
/// Reads go through a shared lock; writes and expiry evictions take the
/// exclusive lock briefly. No I/O happens under either.
pub struct SemanticCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: chrono::Duration,
    max_entries: usize,
}

impl SemanticCache {
    pub fn new(config: CacheConfig) -> Self {
        let ttl = if config.ttl.is_zero() {
            chrono::Duration::minutes(15)
        } else {
            chrono::Duration::from_std(config.ttl).unwrap_or_else(|_| chrono::Duration::minutes(15))
        };
        let max_entries = if config.max_entries == 0 { 2000 } else { config.max_entries };
        Self { entries: RwLock::new(HashMap::new()), ttl, max_entries }
    }

    /// Builds the cache signature: each part trimmed and lowercased, joined
    /// with `||`, SHA-256, hex-encoded. Deterministic across processes.
    pub fn build_signature(parts: &[&str]) -> String {
        let normalized: Vec<String> =
            parts.iter().map(|part| part.trim().to_lowercase()).collect();
        let joined = normalized.join("||");
        hex::encode(Sha256::digest(joined.as_bytes()))
    }

    /// Returns a clone of the entry, treating expired entries as misses and
    /// evicting them opportunistically.
    pub fn get(&self, signature: &str) -> Option<CacheEntry> {
        let entry = {
            let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.get(signature).cloned()
        };

        let entry = entry?;
        if Utc::now() > entry.expires_at {
            let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.remove(signature);
            return None;
        }
        Some(entry)
    }

    /// Stores an entry, stamping `created_at`/`expires_at` and cloning the
    /// value bytes. At capacity the entry with the oldest `created_at` is
    /// evicted first.
    pub fn set(&self, signature: &str, mut entry: CacheEntry) {
        let now = Utc::now();
        entry.created_at = now;
        entry.expires_at = now + self.ttl;

        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.len() >= self.max_entries && !entries.contains_key(signature) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, candidate)| candidate.created_at)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                entries.remove(&key);
            }
        }
        entries.insert(signature.to_string(), entry);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}
