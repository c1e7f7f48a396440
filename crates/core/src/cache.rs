//! # Cache Controller
//!
//! Tracks which shared context blocks have been written to the backend's
//! prompt cache. Identity is the SHA-256 of the block text, so two
//! byte-identical blocks always map to the same entry regardless of which
//! subtask sent them first.
//!
//! Expiry is lazy: an entry past its TTL is treated as cold on the next
//! lookup and replaced on the next warm-up. Nothing sweeps the table.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Smallest block the backend will cache
pub const MIN_CACHE_TOKENS: usize = 1024;

/// Backend cache lifetime
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Rough token estimate (~4 characters per token)
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Hex SHA-256 of a block
pub fn content_hash(block: &str) -> String {
    let digest = Sha256::digest(block.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A remotely warmed cache block
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub content_hash: String,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug)]
pub struct CacheController {
    min_tokens: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for CacheController {
    fn default() -> Self {
        Self::new(MIN_CACHE_TOKENS, DEFAULT_CACHE_TTL)
    }
}

impl CacheController {
    pub fn new(min_tokens: usize, ttl: Duration) -> Self {
        Self {
            min_tokens,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Blocks under the backend minimum are never annotated
    pub fn is_cache_eligible(&self, block: &str) -> bool {
        estimate_tokens(block) >= self.min_tokens
    }

    pub fn mark_warmed(&self, block_hash: &str, ttl: Duration) {
        let entry = CacheEntry {
            content_hash: block_hash.to_string(),
            created_at: Instant::now(),
            ttl,
        };
        // A poisoned lock only means another worker panicked mid-insert;
        // the map itself is still usable.
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(block_hash.to_string(), entry);
    }

    pub fn is_warm(&self, block_hash: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(block_hash)
            .is_some_and(|entry| !entry.is_expired(Instant::now()))
    }

    /// Number of tracked entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
