//! Resolves medication records to shared [`MedicationDescriptor`]s.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use medrec_core::{
    name_key, MedRecError, MedicationDescriptor, MedicationOrder, MedicationPointer,
    UNKNOWN_MEDICATION,
};

use crate::cache::{CacheKey, ResolutionCache};
use crate::record::parse_medication_definition;
use crate::store::ResourceStore;

/// A per-record failure inside a batch. The rest of the batch is unaffected.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionIssue {
    pub order_id: String,
    pub error: MedRecError,
}

/// Outcome of one `resolve` call.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    descriptors: HashMap<String, Option<Arc<MedicationDescriptor>>>,
    pub issues: Vec<ResolutionIssue>,
    /// Remote reads performed by this call.
    pub fetched: usize,
}

impl Resolution {
    pub fn get(&self, order_id: &str) -> Option<&Arc<MedicationDescriptor>> {
        self.descriptors.get(order_id).and_then(Option::as_ref)
    }

    /// True when the order was part of the batch, resolved or not.
    pub fn contains(&self, order_id: &str) -> bool {
        self.descriptors.contains_key(order_id)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn resolved_count(&self) -> usize {
        self.descriptors.values().filter(|d| d.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<Arc<MedicationDescriptor>>)> {
        self.descriptors.iter()
    }

    /// Display text for a record, never empty.
    ///
    /// Order: resolved name, enriched text, reference display, legacy concept
    /// text, legacy coding display, then [`UNKNOWN_MEDICATION`].
    pub fn display_name(&self, order: &MedicationOrder) -> String {
        let legacy = order.legacy_concept.as_ref();
        [
            self.get(&order.id).map(|descriptor| descriptor.name.as_str()),
            order.enriched_text.as_deref(),
            order.pointer.as_ref().and_then(MedicationPointer::display_hint),
            legacy.and_then(|concept| concept.text.as_deref()),
            legacy.and_then(|concept| concept.display.as_deref()),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|text| !text.is_empty())
        .unwrap_or(UNKNOWN_MEDICATION)
        .to_string()
    }

    /// Grouping key: the descriptor identity, else the display name.
    pub fn identity_key(&self, order: &MedicationOrder) -> String {
        match self.get(&order.id) {
            Some(descriptor) => descriptor.identity_key(),
            None => name_key(&self.display_name(order)),
        }
    }
}

pub struct MedicationResolver {
    store: Arc<dyn ResourceStore>,
    cache: Arc<ResolutionCache>,
}

struct ExternalTarget {
    key: CacheKey,
    resource_type: String,
    id: String,
}

impl MedicationResolver {
    pub fn new(store: Arc<dyn ResourceStore>, cache: Arc<ResolutionCache>) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    /// Resolves every record in the batch. Inputs are not modified.
    ///
    /// Remote reads run one after another so that this call sees its own cache
    /// writes. Failed reads leave a tombstone and are not retried by later calls.
    /// Only a poisoned cache lock fails the whole call.
    pub async fn resolve(&self, orders: &[MedicationOrder]) -> Result<Resolution, MedRecError> {
        let mut resolution = Resolution::default();
        let mut order_keys: Vec<(&MedicationOrder, CacheKey)> = Vec::new();
        let mut targets: Vec<ExternalTarget> = Vec::new();
        let mut seen: HashSet<CacheKey> = HashSet::new();
        let mut failures: HashMap<CacheKey, MedRecError> = HashMap::new();

        for order in orders {
            match &order.pointer {
                None => {
                    resolution.descriptors.insert(order.id.clone(), None);
                    resolution.issues.push(ResolutionIssue {
                        order_id: order.id.clone(),
                        error: MedRecError::ValidationFailed(
                            "record carries no usable medication pointer".into(),
                        ),
                    });
                }
                Some(MedicationPointer::InlineConcept { concept, .. }) => {
                    let descriptor = MedicationDescriptor {
                        name: concept.label().unwrap_or(UNKNOWN_MEDICATION).to_string(),
                        code: Some(concept.clone()),
                        form: None,
                        ingredients: Vec::new(),
                        source_id: order.id.clone(),
                    };
                    resolution
                        .descriptors
                        .insert(order.id.clone(), Some(Arc::new(descriptor)));
                }
                Some(MedicationPointer::Embedded { local_id, .. }) => {
                    let key = CacheKey::embedded(order.id.as_str(), local_id.as_str());
                    if !self.cache.has(&key)? {
                        let definition = order.contained_definition(local_id).cloned();
                        if definition.is_none() {
                            failures.insert(
                                key.clone(),
                                MedRecError::not_found("Medication", format!("#{local_id}")),
                            );
                        }
                        self.cache.set(key.clone(), definition.map(Arc::new))?;
                    }
                    order_keys.push((order, key));
                }
                Some(
                    pointer @ (MedicationPointer::UrnReference { .. }
                    | MedicationPointer::TypedReference { .. }),
                ) => {
                    let Some(external) = pointer.external_key() else {
                        continue;
                    };
                    let key = CacheKey::reference(external.as_str());
                    if seen.insert(key.clone()) {
                        let (resource_type, id) = match pointer {
                            MedicationPointer::TypedReference {
                                resource_type, id, ..
                            } => (resource_type.clone(), id.clone()),
                            _ => ("Medication".to_string(), external.clone()),
                        };
                        targets.push(ExternalTarget {
                            key: key.clone(),
                            resource_type,
                            id,
                        });
                    }
                    order_keys.push((order, key));
                }
            }
        }

        let mut queue = Vec::new();
        for target in targets {
            if self.cache.has(&target.key)? {
                tracing::debug!(key = %target.key, "medication cache hit");
                continue;
            }
            match self.store.get_from_context(&target.resource_type, &target.id) {
                Some(resource) => {
                    let descriptor =
                        parse_medication_definition(&resource, &target.key.to_string());
                    if descriptor.is_none() {
                        failures.insert(
                            target.key.clone(),
                            MedRecError::ValidationFailed(format!(
                                "{} names no medication",
                                target.key
                            )),
                        );
                    }
                    self.cache.set(target.key, descriptor.map(Arc::new))?;
                }
                None => queue.push(target),
            }
        }

        for target in queue {
            resolution.fetched += 1;
            let outcome = match self.store.read(&target.resource_type, &target.id).await {
                Ok(resource) => parse_medication_definition(&resource, &target.key.to_string())
                    .ok_or_else(|| {
                        MedRecError::ValidationFailed(format!("{} names no medication", target.key))
                    }),
                Err(err) => Err(MedRecError::from(err)),
            };
            match outcome {
                Ok(descriptor) => {
                    self.cache.set(target.key, Some(Arc::new(descriptor)))?;
                }
                Err(err) => {
                    tracing::warn!(key = %target.key, error = %err, "medication fetch failed, caching tombstone");
                    self.cache.set(target.key.clone(), None)?;
                    failures.insert(target.key, err);
                }
            }
        }

        for (order, key) in order_keys {
            let cached = self.cache.get(&key)?.flatten();
            if cached.is_none() {
                let error = failures.get(&key).cloned().unwrap_or_else(|| {
                    MedRecError::FetchFailed(format!("{key} previously failed to resolve"))
                });
                resolution.issues.push(ResolutionIssue {
                    order_id: order.id.clone(),
                    error,
                });
            }
            resolution.descriptors.insert(order.id.clone(), cached);
        }

        tracing::info!(
            records = orders.len(),
            resolved = resolution.resolved_count(),
            fetched = resolution.fetched,
            issues = resolution.issues.len(),
            "medication resolution complete"
        );

        Ok(resolution)
    }

    /// Resolves a single record to a descriptor or the reason it has none.
    pub async fn resolve_one(
        &self,
        order: &MedicationOrder,
    ) -> Result<Arc<MedicationDescriptor>, MedRecError> {
        let mut resolution = self.resolve(std::slice::from_ref(order)).await?;
        if let Some(descriptor) = resolution.get(&order.id) {
            return Ok(descriptor.clone());
        }
        Err(resolution
            .issues
            .pop()
            .map(|issue| issue.error)
            .unwrap_or_else(|| MedRecError::not_found("Medication", order.id.clone())))
    }
}
