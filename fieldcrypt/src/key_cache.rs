//! Session-scoped cache of resolved data keys.
//!
//! Entries are keyed by key id, with a secondary index on alternate names.
//! Nothing expires on its own: entries leave the cache only through
//! [`KeyCache::invalidate`] or [`KeyCache::invalidate_all`]. Re-inserting an
//! id replaces the previous entry (last write wins).

use chrono::{DateTime, Utc};
use secrecy::SecretVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::kdf::{derive_field_keys, FieldKeys};
use crate::key_id::{KeyId, KeyReference};

/// A resolved data key, ready for field encryption.
///
/// Holds only derived sub-keys; the raw material is dropped after derivation.
pub struct DataKey {
    id: KeyId,
    keys: FieldKeys,
    alt_names: Vec<String>,
    resolved_at: DateTime<Utc>,
}

impl DataKey {
    /// Derives a data key from raw (unwrapped) key material.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the material is unusable.
    pub fn from_material(
        id: KeyId,
        material: &SecretVec<u8>,
        alt_names: Vec<String>,
    ) -> Result<Self, String> {
        derive_field_keys(material).map(|keys| Self::new(id, keys, alt_names))
    }

    pub(crate) fn new(id: KeyId, keys: FieldKeys, alt_names: Vec<String>) -> Self {
        Self { id, keys, alt_names, resolved_at: Utc::now() }
    }

    /// Returns the key id.
    #[must_use]
    pub const fn id(&self) -> &KeyId {
        &self.id
    }

    /// Returns the derived sub-keys.
    #[must_use]
    pub const fn field_keys(&self) -> &FieldKeys {
        &self.keys
    }

    /// Returns the alternate names of the key.
    #[must_use]
    pub fn alt_names(&self) -> &[String] {
        &self.alt_names
    }

    /// Returns when the key was resolved.
    #[must_use]
    pub fn resolved_at(&self) -> DateTime<Utc> {
        self.resolved_at
    }

    /// Returns true if this key satisfies `reference`.
    #[must_use]
    pub fn satisfies(&self, reference: &KeyReference) -> bool {
        match reference {
            KeyReference::Id(id) => self.id == *id,
            KeyReference::AltName(name) => self.alt_names.iter().any(|n| n == name),
        }
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("id", &self.id)
            .field("alt_names", &self.alt_names)
            .field("resolved_at", &self.resolved_at)
            .finish_non_exhaustive()
    }
}

/// Finds resolved keys by id.
pub trait KeyLookup {
    /// Returns the key with the given id, if known.
    fn find(&self, id: &KeyId) -> Option<Arc<DataKey>>;
}

impl KeyLookup for HashMap<KeyId, Arc<DataKey>> {
    fn find(&self, id: &KeyId) -> Option<Arc<DataKey>> {
        self.get(id).cloned()
    }
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<KeyId, Arc<DataKey>>,
    by_alt_name: HashMap<String, KeyId>,
}

impl Entries {
    /// Drops `key`'s alt-name entries. Call after removing it from `by_id`.
    /// A name that another cached key still lists moves to that key.
    fn unindex(&mut self, key: &DataKey) {
        for name in &key.alt_names {
            if self.by_alt_name.get(name) != Some(&key.id) {
                continue;
            }
            let heir = self
                .by_id
                .values()
                .filter(|other| other.alt_names.contains(name))
                .map(|other| &other.id)
                .min()
                .cloned();
            match heir {
                Some(heir) => {
                    self.by_alt_name.insert(name.clone(), heir);
                }
                None => {
                    self.by_alt_name.remove(name);
                }
            }
        }
    }
}

/// Thread-safe resolved-key store shared by all requests of a context.
#[derive(Default)]
pub struct KeyCache {
    entries: RwLock<Entries>,
}

impl KeyCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a key by id.
    #[must_use]
    pub fn lookup(&self, id: &KeyId) -> Option<Arc<DataKey>> {
        self.read().by_id.get(id).cloned()
    }

    /// Looks up a key by one of its alternate names.
    #[must_use]
    pub fn lookup_alt_name(&self, name: &str) -> Option<Arc<DataKey>> {
        let entries = self.read();
        entries.by_alt_name.get(name).and_then(|id| entries.by_id.get(id)).cloned()
    }

    /// Resolves a reference by id or alternate name.
    #[must_use]
    pub fn resolve(&self, reference: &KeyReference) -> Option<Arc<DataKey>> {
        match reference {
            KeyReference::Id(id) => self.lookup(id),
            KeyReference::AltName(name) => self.lookup_alt_name(name),
        }
    }

    /// Inserts a key, replacing any entry with the same id.
    pub fn insert(&self, key: DataKey) -> Arc<DataKey> {
        let key = Arc::new(key);
        let mut entries = self.write();

        if let Some(previous) = entries.by_id.remove(&key.id) {
            entries.unindex(&previous);
        }
        for name in &key.alt_names {
            entries.by_alt_name.insert(name.clone(), key.id.clone());
        }
        entries.by_id.insert(key.id.clone(), Arc::clone(&key));
        drop(entries);

        debug!(key_id = %key.id, alt_names = key.alt_names.len(), "Key cached");
        key
    }

    /// Removes one key. Returns true if it was cached.
    pub fn invalidate(&self, id: &KeyId) -> bool {
        let mut entries = self.write();
        let removed = entries.by_id.remove(id);
        if let Some(key) = &removed {
            entries.unindex(key);
        }
        removed.is_some()
    }

    /// Removes every key.
    pub fn invalidate_all(&self) {
        let mut entries = self.write();
        let count = entries.by_id.len();
        entries.by_id.clear();
        entries.by_alt_name.clear();
        drop(entries);

        debug!(count, "Key cache invalidated");
    }

    /// Returns the number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    /// Returns true if no keys are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().by_id.is_empty()
    }

    /// Returns the cached key ids in sorted order.
    #[must_use]
    pub fn key_ids(&self) -> Vec<KeyId> {
        let mut ids: Vec<KeyId> = self.read().by_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    // A panic while holding the lock cannot leave the maps half-updated in a
    // way lookups would misread, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyLookup for KeyCache {
    fn find(&self, id: &KeyId) -> Option<Arc<DataKey>> {
        self.lookup(id)
    }
}

impl fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCache").field("keys", &self.key_ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_key(id: &str, fill: u8, alt_names: &[&str]) -> DataKey {
        DataKey::from_material(
            KeyId::parse(id).unwrap(),
            &SecretVec::new(vec![fill; 32]),
            alt_names.iter().map(|s| (*s).to_string()).collect(),
        )
        .unwrap()
    }

    fn id(s: &str) -> KeyId {
        KeyId::parse(s).unwrap()
    }

    #[test]
    fn test_insert_and_lookup() {
        let cache = KeyCache::new();
        assert!(cache.is_empty());

        cache.insert(data_key("K1", 1, &["payroll"]));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&id("K1")).unwrap().id(), &id("K1"));
        assert_eq!(cache.lookup_alt_name("payroll").unwrap().id(), &id("K1"));
        assert!(cache.lookup(&id("K2")).is_none());
        assert!(cache.lookup_alt_name("hr").is_none());
    }

    #[test]
    fn test_reinsert_is_last_write_wins() {
        let cache = KeyCache::new();
        let first = cache.insert(data_key("K1", 1, &["old"]));
        let second = cache.insert(data_key("K1", 2, &["new"]));

        assert_eq!(cache.len(), 1);
        let current = cache.lookup(&id("K1")).unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert!(!Arc::ptr_eq(&current, &first));
        assert!(cache.lookup_alt_name("old").is_none());
        assert!(cache.lookup_alt_name("new").is_some());
    }

    #[test]
    fn test_alt_name_moves_to_latest_owner() {
        let cache = KeyCache::new();
        cache.insert(data_key("K1", 1, &["shared"]));
        cache.insert(data_key("K2", 2, &["shared"]));

        assert_eq!(cache.lookup_alt_name("shared").unwrap().id(), &id("K2"));

        // Invalidating the old owner must not drop the new owner's index entry.
        assert!(cache.invalidate(&id("K1")));
        assert_eq!(cache.lookup_alt_name("shared").unwrap().id(), &id("K2"));
    }

    #[test]
    fn test_alt_name_falls_back_to_remaining_owner() {
        let cache = KeyCache::new();
        cache.insert(data_key("K1", 1, &["shared"]));
        cache.insert(data_key("K2", 2, &["shared"]));
        cache.insert(data_key("K2", 2, &[]));

        assert_eq!(cache.lookup_alt_name("shared").unwrap().id(), &id("K1"));

        cache.insert(data_key("K2", 2, &["shared"]));
        assert!(cache.invalidate(&id("K2")));
        assert_eq!(cache.lookup_alt_name("shared").unwrap().id(), &id("K1"));

        assert!(cache.invalidate(&id("K1")));
        assert!(cache.lookup_alt_name("shared").is_none());
    }

    #[test]
    fn test_invalidate() {
        let cache = KeyCache::new();
        cache.insert(data_key("K1", 1, &["payroll"]));

        assert!(cache.invalidate(&id("K1")));
        assert!(!cache.invalidate(&id("K1")));
        assert!(cache.lookup(&id("K1")).is_none());
        assert!(cache.lookup_alt_name("payroll").is_none());
    }

    #[test]
    fn test_invalidate_all_keeps_outstanding_handles() {
        let cache = KeyCache::new();
        let held = cache.insert(data_key("K1", 1, &[]));
        cache.insert(data_key("K2", 2, &[]));

        cache.invalidate_all();

        assert!(cache.is_empty());
        assert_eq!(held.id(), &id("K1"));
    }

    #[test]
    fn test_resolve_reference() {
        let cache = KeyCache::new();
        cache.insert(data_key("K1", 1, &["payroll"]));

        assert!(cache.resolve(&KeyReference::Id(id("K1"))).is_some());
        assert!(cache.resolve(&KeyReference::AltName("payroll".into())).is_some());
        assert!(cache.resolve(&KeyReference::AltName("hr".into())).is_none());
    }

    #[test]
    fn test_key_ids_sorted() {
        let cache = KeyCache::new();
        cache.insert(data_key("K2", 2, &[]));
        cache.insert(data_key("K1", 1, &[]));

        assert_eq!(cache.key_ids(), vec![id("K1"), id("K2")]);
    }

    #[test]
    fn test_debug_does_not_leak_material() {
        let key = data_key("K1", 0xAB, &[]);
        let rendered = format!("{key:?}");

        assert!(rendered.contains("K1"));
        assert!(!rendered.contains("keys"));
        assert!(rendered.ends_with(".. }"));
    }

    #[test]
    fn test_concurrent_inserts_and_lookups() {
        let cache = KeyCache::new();

        std::thread::scope(|scope| {
            for t in 0..8u8 {
                let cache = &cache;
                scope.spawn(move || {
                    for i in 0..50u8 {
                        let name = format!("K{}", i % 10);
                        cache.insert(data_key(&name, t, &[]));
                        assert!(cache.lookup(&id(&name)).is_some());
                    }
                });
            }
        });

        assert_eq!(cache.len(), 10);
    }
}
