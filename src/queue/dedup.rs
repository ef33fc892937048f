//! Time-windowed deduplication of enqueued operations.
//!
//! Operations are fingerprinted by module, action and a structural hash of
//! the payload. Object keys are sorted before hashing so two payloads with
//! the same content but different key order collide.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::operation::{Operation, Payload};

/// Fingerprint an operation for deduplication.
#[must_use]
pub fn operation_hash(module: &str, action: &str, payload: &Payload) -> String {
    let mut hasher = Sha256::new();
    hasher.update(module.as_bytes());
    hasher.update([0u8]);
    hasher.update(action.as_bytes());
    hasher.update([0u8]);
    for (key, value) in sorted_entries(payload) {
        hash_value(&mut hasher, &Value::String(key.clone()));
        hash_value(&mut hasher, value);
    }
    format!("{:x}", hasher.finalize())
}

fn sorted_entries(map: &Payload) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        },
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        },
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(hasher, item);
            }
            hasher.update(b"]");
        },
        Value::Object(map) => {
            hasher.update(b"{");
            for (key, item) in sorted_entries(map) {
                hash_value(hasher, &Value::String(key.clone()));
                hash_value(hasher, item);
            }
            hasher.update(b"}");
        },
    }
}

/// One registered hash, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    /// Operation fingerprint.
    pub hash: String,
    /// When the hash was registered.
    pub registered_at: DateTime<Utc>,
    /// Operation that registered the hash, if known.
    pub owner: Option<String>,
}

#[derive(Debug, Clone)]
struct Registration {
    seen: DateTime<Utc>,
    owner: Option<String>,
}

/// Registry of recently seen operation hashes.
#[derive(Debug)]
pub struct DeduplicationIndex {
    window: Duration,
    entries: HashMap<String, Registration>,
}

impl DeduplicationIndex {
    /// Create an empty index with the given window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.window).map_or(DateTime::<Utc>::MIN_UTC, |w| now - w)
    }

    /// Register `hash` for `owner` unless it was seen within the window.
    ///
    /// Returns `true` if the hash is a duplicate (and was not re-registered).
    pub fn check_and_register(&mut self, hash: &str, owner: Option<&str>, now: DateTime<Utc>) -> bool {
        let cutoff = self.cutoff(now);
        if let Some(existing) = self.entries.get(hash) {
            if existing.seen > cutoff {
                return true;
            }
        }
        self.entries.insert(
            hash.to_string(),
            Registration {
                seen: now,
                owner: owner.map(String::from),
            },
        );
        false
    }

    /// Hash `op` and register it under its id.
    pub fn check_operation(&mut self, op: &Operation, now: DateTime<Utc>) -> (String, bool) {
        let hash = operation_hash(&op.module, &op.action, &op.payload);
        let duplicate = self.check_and_register(&hash, Some(&op.id), now);
        (hash, duplicate)
    }

    /// Drop a registration, e.g. after the operation was rejected.
    pub fn forget(&mut self, hash: &str) {
        self.entries.remove(hash);
    }

    /// Drop `op`'s registration if `op` made it. Returns whether it did.
    pub fn forget_operation(&mut self, op: &Operation) -> bool {
        let hash = operation_hash(&op.module, &op.action, &op.payload);
        let owned = self
            .entries
            .get(&hash)
            .is_some_and(|existing| existing.owner.as_deref() == Some(op.id.as_str()));
        if owned {
            self.entries.remove(&hash);
        }
        owned
    }

    /// Remove entries older than the window. Returns how many were removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = self.cutoff(now);
        let before = self.entries.len();
        self.entries.retain(|_, existing| existing.seen > cutoff);
        before - self.entries.len()
    }

    /// All live entries, for persistence.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DedupEntry> {
        self.entries
            .iter()
            .map(|(hash, existing)| DedupEntry {
                hash: hash.clone(),
                registered_at: existing.seen,
                owner: existing.owner.clone(),
            })
            .collect()
    }

    /// Merge persisted entries, keeping the newest registration per hash.
    pub fn restore(&mut self, entries: impl IntoIterator<Item = DedupEntry>) {
        for entry in entries {
            let incoming = Registration {
                seen: entry.registered_at,
                owner: entry.owner,
            };
            match self.entries.get_mut(&entry.hash) {
                Some(existing) if existing.seen >= incoming.seen => {},
                Some(existing) => *existing = incoming,
                None => {
                    self.entries.insert(entry.hash, incoming);
                },
            }
        }
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of tracked hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no hashes are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
