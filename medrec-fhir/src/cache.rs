//! Process-wide store of resolved medication descriptors.
//!
//! Unbounded: the universe of medication definitions seen by one process is
//! small and grows slowly. Call [`ResolutionCache::clear`] on patient switch.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use medrec_core::{MedRecError, MedicationDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Normalized `Type/id` or urn of an external definition.
    Reference(String),
    /// Contained definition, scoped to the record carrying it.
    Embedded { order_id: String, local_ref: String },
}

impl CacheKey {
    pub fn reference(key: impl Into<String>) -> Self {
        CacheKey::Reference(key.into())
    }

    pub fn embedded(order_id: impl Into<String>, local_ref: impl Into<String>) -> Self {
        CacheKey::Embedded {
            order_id: order_id.into(),
            local_ref: local_ref.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Reference(key) => f.write_str(key),
            CacheKey::Embedded {
                order_id,
                local_ref,
            } => write!(f, "embedded:{order_id}:#{local_ref}"),
        }
    }
}

/// `None` values are tombstones: the target is known to be unresolvable.
pub type CachedDescriptor = Option<Arc<MedicationDescriptor>>;

#[derive(Debug, Default)]
pub struct ResolutionCache {
    entries: RwLock<HashMap<CacheKey, CachedDescriptor>>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(entry)` when the key has been seen, including tombstones.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CachedDescriptor>, MedRecError> {
        let entries = self.entries.read().map_err(|_| MedRecError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    pub fn has(&self, key: &CacheKey) -> Result<bool, MedRecError> {
        let entries = self.entries.read().map_err(|_| MedRecError::LockPoisoned)?;
        Ok(entries.contains_key(key))
    }

    /// Stores a descriptor or tombstone and returns what the key now holds.
    ///
    /// A live descriptor is never replaced, so every caller observes the same
    /// instance for one identity.
    pub fn set(
        &self,
        key: CacheKey,
        value: CachedDescriptor,
    ) -> Result<CachedDescriptor, MedRecError> {
        let mut entries = self.entries.write().map_err(|_| MedRecError::LockPoisoned)?;
        let slot = entries.entry(key).or_insert(None);
        if slot.is_none() {
            *slot = value;
        }
        Ok(slot.clone())
    }

    pub fn clear(&self) -> Result<(), MedRecError> {
        let mut entries = self.entries.write().map_err(|_| MedRecError::LockPoisoned)?;
        let dropped = entries.len();
        entries.clear();
        tracing::debug!(dropped, "resolution cache cleared");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
