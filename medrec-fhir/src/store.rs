//! Collaborator contract for reading and writing FHIR resources.
//!
//! The engine never speaks a wire protocol itself; a [`ResourceStore`]
//! implementation does. [`InMemoryStore`] serves a loaded Bundle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use medrec_core::MedRecError;
use serde_json::{json, Value};

use crate::json::{reference_id, str_field};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("{resource_type}/{id} not found")]
    NotFound { resource_type: String, id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for MedRecError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { resource_type, id } => MedRecError::NotFound { resource_type, id },
            StoreError::Unavailable(message) => MedRecError::FetchFailed(message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub resources: Vec<Value>,
    /// Resources pulled in by `_include`, not counted in `total`.
    pub included: Vec<Value>,
    pub total: usize,
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn read(&self, resource_type: &str, id: &str) -> Result<Value, StoreError>;

    async fn search(
        &self,
        resource_type: &str,
        params: &[(&str, &str)],
    ) -> Result<SearchPage, StoreError>;

    async fn create(&self, resource_type: &str, record: Value) -> Result<Value, StoreError>;

    async fn update(&self, resource_type: &str, id: &str, record: Value)
        -> Result<Value, StoreError>;

    /// Already-loaded lookup; never performs I/O.
    fn get_from_context(&self, resource_type: &str, id: &str) -> Option<Value>;
}

/// Bundle-backed store. Entries are addressable by `Type/id` and by `fullUrl`.
#[derive(Default)]
pub struct InMemoryStore {
    resources: RwLock<HashMap<String, Value>>,
    aliases: RwLock<HashMap<String, String>>,
    context: RwLock<HashMap<String, Value>>,
    failing: RwLock<HashSet<String>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    next_id: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bundle(bundle: &Value) -> Result<Self, MedRecError> {
        if str_field(bundle, "resourceType") != Some("Bundle") {
            return Err(MedRecError::Parse(format!(
                "expected resourceType Bundle, received {}",
                str_field(bundle, "resourceType").unwrap_or("<missing>")
            )));
        }

        let store = Self::new();
        let entries = bundle
            .get("entry")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for entry in entries {
            let Some(resource) = entry.get("resource") else {
                continue;
            };
            let key = store.insert(resource.clone())?;
            if let Some(full_url) = str_field(entry, "fullUrl") {
                write(&store.aliases)?.insert(full_url.to_string(), key);
            }
        }

        Ok(store)
    }

    /// Stores a resource and returns its `Type/id` key.
    pub fn insert(&self, resource: Value) -> Result<String, MedRecError> {
        let key = resource_key(&resource)
            .ok_or_else(|| MedRecError::ValidationFailed("resource has no type or id".into()))?;
        write(&self.resources)?.insert(key.clone(), resource);
        Ok(key)
    }

    /// Makes a resource visible to `get_from_context` without storing it.
    pub fn preload_context(&self, resource: Value) -> Result<(), MedRecError> {
        let key = resource_key(&resource)
            .ok_or_else(|| MedRecError::ValidationFailed("resource has no type or id".into()))?;
        write(&self.context)?.insert(key, resource);
        Ok(())
    }

    /// Subsequent reads of `Type/id` fail as unavailable.
    pub fn fail_reads_for(&self, resource_type: &str, id: &str) -> Result<(), MedRecError> {
        write(&self.failing)?.insert(format!("{resource_type}/{id}"));
        Ok(())
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn resources_of(&self, resource_type: &str) -> Vec<Value> {
        let prefix = format!("{resource_type}/");
        self.resources
            .read()
            .map(|resources| {
                let mut matching: Vec<(&String, &Value)> = resources
                    .iter()
                    .filter(|(key, _)| key.starts_with(&prefix))
                    .collect();
                matching.sort_by(|a, b| a.0.cmp(b.0));
                matching.into_iter().map(|(_, value)| value.clone()).collect()
            })
            .unwrap_or_default()
    }

    fn canonical_key(&self, resource_type: &str, id: &str) -> Result<String, StoreError> {
        if id.starts_with("urn:") {
            let aliases = self.aliases.read().map_err(poisoned)?;
            return Ok(aliases
                .get(id)
                .cloned()
                .unwrap_or_else(|| id.to_string()));
        }
        Ok(format!("{resource_type}/{id}"))
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn read(&self, resource_type: &str, id: &str) -> Result<Value, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let key = self.canonical_key(resource_type, id)?;

        if self.failing.read().map_err(poisoned)?.contains(&key) {
            return Err(StoreError::Unavailable(format!("read of {key} failed")));
        }

        self.resources
            .read()
            .map_err(poisoned)?
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            })
    }

    async fn search(
        &self,
        resource_type: &str,
        params: &[(&str, &str)],
    ) -> Result<SearchPage, StoreError> {
        let resources: Vec<Value> = self
            .resources_of(resource_type)
            .into_iter()
            .filter(|resource| params.iter().all(|(name, value)| matches_param(resource, name, value)))
            .collect();

        let mut included = Vec::new();
        if params.iter().any(|(name, _)| *name == "_include") {
            let stored = self.resources.read().map_err(poisoned)?;
            let mut seen = HashSet::new();
            for target in resources.iter().filter_map(medication_target) {
                if !seen.insert(target.clone()) {
                    continue;
                }
                if let Some(medication) = stored.get(&target) {
                    included.push(medication.clone());
                }
            }
        }

        Ok(SearchPage {
            total: resources.len(),
            resources,
            included,
        })
    }

    async fn create(&self, resource_type: &str, mut record: Value) -> Result<Value, StoreError> {
        if str_field(&record, "id").is_none() {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            record["id"] = json!(format!("{}-{n}", resource_type.to_lowercase()));
        }
        record["resourceType"] = json!(resource_type);
        record["meta"] = json!({"versionId": "1"});

        let key = resource_key(&record)
            .ok_or_else(|| StoreError::Unavailable("created record has no key".into()))?;
        self.resources
            .write()
            .map_err(poisoned)?
            .insert(key, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        mut record: Value,
    ) -> Result<Value, StoreError> {
        let key = format!("{resource_type}/{id}");
        let mut resources = self.resources.write().map_err(poisoned)?;
        let Some(existing) = resources.get(&key) else {
            return Err(StoreError::NotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            });
        };

        let version = existing
            .get("meta")
            .and_then(|meta| str_field(meta, "versionId"))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(1);
        record["id"] = json!(id);
        record["resourceType"] = json!(resource_type);
        record["meta"]["versionId"] = json!((version + 1).to_string());

        resources.insert(key, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    fn get_from_context(&self, resource_type: &str, id: &str) -> Option<Value> {
        let key = self.canonical_key(resource_type, id).ok()?;
        self.context.read().ok()?.get(&key).cloned()
    }
}

fn resource_key(resource: &Value) -> Option<String> {
    let resource_type = str_field(resource, "resourceType")?;
    let id = str_field(resource, "id")?;
    Some(format!("{resource_type}/{id}"))
}

/// `Medication/id` named by a record's medication reference, if any.
fn medication_target(resource: &Value) -> Option<String> {
    let reference = resource
        .get("medicationReference")
        .or_else(|| resource.get("medication").and_then(|m| m.get("reference")))
        .and_then(|reference| str_field(reference, "reference"))?;
    reference
        .starts_with("Medication/")
        .then(|| reference.to_string())
}

fn matches_param(resource: &Value, name: &str, value: &str) -> bool {
    match name {
        "patient" | "subject" => ["subject", "patient"]
            .iter()
            .filter_map(|field| resource.get(*field))
            .filter_map(|reference| str_field(reference, "reference"))
            .any(|reference| reference_id(reference) == reference_id(value)),
        "status" => str_field(resource, "status")
            .is_some_and(|status| value.split(',').any(|wanted| wanted.trim() == status)),
        "_id" => str_field(resource, "id") == Some(value),
        _ => true,
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Unavailable("store lock poisoned".into())
}

fn write<T>(lock: &RwLock<T>) -> Result<std::sync::RwLockWriteGuard<'_, T>, MedRecError> {
    lock.write().map_err(|_| MedRecError::LockPoisoned)
}
