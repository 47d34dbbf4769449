use std::sync::{Arc, RwLock};

use medrec_core::{
    MedRecConfig, MedRecError, MedicationDescriptor, MedicationOrder, PatientContext,
    SafetyMedication, SafetyOptions, SafetyReport,
};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::cache::ResolutionCache;
use crate::discontinue::{DiscontinuationService, DiscontinueOutcome, DiscontinueRequest};
use crate::knowledge::DrugKnowledge;
use crate::lists::{ListChange, ListRegistry};
use crate::reconcile::{ReconciliationResult, Reconciler, SourceLists};
use crate::resolver::{MedicationResolver, Resolution};
use crate::safety::SafetyChecker;
use crate::store::{InMemoryStore, ResourceStore};

/// Wires the resolver, safety checker, list registry, discontinuation
/// service and reconciler around one store and one shared cache.
pub struct MedRecEngine {
    store: Arc<dyn ResourceStore>,
    cache: Arc<ResolutionCache>,
    resolver: Arc<MedicationResolver>,
    safety: Arc<SafetyChecker>,
    lists: Arc<ListRegistry>,
    discontinuation: DiscontinuationService,
    reconciler: Reconciler,
    active_patient: RwLock<Option<String>>,
}

impl MedRecEngine {
    pub fn new(store: Arc<dyn ResourceStore>, knowledge: DrugKnowledge, config: MedRecConfig) -> Self {
        let cache = Arc::new(ResolutionCache::new());
        let resolver = Arc::new(MedicationResolver::new(store.clone(), cache.clone()));
        let safety =
            Arc::new(SafetyChecker::new(knowledge).with_cache(config.safety_cache_enabled));
        let lists = Arc::new(ListRegistry::new());
        let discontinuation =
            DiscontinuationService::new(store.clone(), lists.clone(), config.clone());
        let reconciler = Reconciler::new(
            store.clone(),
            resolver.clone(),
            safety.clone(),
            lists.clone(),
            config,
        );

        Self {
            store,
            cache,
            resolver,
            safety,
            lists,
            discontinuation,
            reconciler,
            active_patient: RwLock::new(None),
        }
    }

    /// Engine over an in-memory store loaded from a FHIR Bundle.
    pub fn from_bundle(
        bundle: &Value,
        knowledge: DrugKnowledge,
        config: MedRecConfig,
    ) -> Result<Self, MedRecError> {
        let store = InMemoryStore::from_bundle(bundle)?;
        Ok(Self::new(Arc::new(store), knowledge, config))
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    pub fn lists(&self) -> &Arc<ListRegistry> {
        &self.lists
    }

    pub fn safety(&self) -> &Arc<SafetyChecker> {
        &self.safety
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListChange> {
        self.lists.subscribe()
    }

    pub fn active_patient(&self) -> Option<String> {
        self.active_patient.read().ok().and_then(|guard| guard.clone())
    }

    /// Makes `patient_id` the working patient. Both caches are cleared when it
    /// differs from the previous one. Returns whether a switch happened.
    pub fn switch_patient(&self, patient_id: &str) -> Result<bool, MedRecError> {
        let mut active = self
            .active_patient
            .write()
            .map_err(|_| MedRecError::LockPoisoned)?;
        if active.as_deref() == Some(patient_id) {
            return Ok(false);
        }
        self.cache.clear()?;
        self.safety.clear_cache()?;
        tracing::info!(
            from = active.as_deref().unwrap_or("<none>"),
            to = patient_id,
            "patient context switched, caches cleared"
        );
        *active = Some(patient_id.to_string());
        Ok(true)
    }

    pub async fn resolve(&self, orders: &[MedicationOrder]) -> Result<Resolution, MedRecError> {
        self.resolver.resolve(orders).await
    }

    pub async fn resolve_one(
        &self,
        order: &MedicationOrder,
    ) -> Result<Arc<MedicationDescriptor>, MedRecError> {
        self.resolver.resolve_one(order).await
    }

    pub fn check_safety(
        &self,
        candidates: &[SafetyMedication],
        context: &PatientContext,
        options: &SafetyOptions,
    ) -> Result<SafetyReport, MedRecError> {
        self.safety.check_safety(candidates, context, options)
    }

    pub async fn check_for_patient(
        &self,
        patient_id: &str,
        candidates: &[MedicationDescriptor],
        options: &SafetyOptions,
    ) -> Result<SafetyReport, MedRecError> {
        self.switch_patient(patient_id)?;
        self.safety
            .check_for_patient(self.store.as_ref(), &self.resolver, patient_id, candidates, options)
            .await
    }

    pub async fn discontinue(
        &self,
        order_id: &str,
        request: DiscontinueRequest,
    ) -> Result<DiscontinueOutcome, MedRecError> {
        let outcome = self.discontinuation.discontinue(order_id, request).await?;
        // The stored order changed; cached safety reports may describe the old medication set.
        self.safety.clear_cache()?;
        Ok(outcome)
    }

    pub fn discontinuation(&self) -> &DiscontinuationService {
        &self.discontinuation
    }

    pub fn reconcile(
        &self,
        patient_id: &str,
        sources: &SourceLists,
        resolution: &Resolution,
    ) -> Result<ReconciliationResult, MedRecError> {
        self.reconciler.reconcile(patient_id, sources, resolution)
    }

    pub async fn reconcile_patient(
        &self,
        patient_id: &str,
    ) -> Result<ReconciliationResult, MedRecError> {
        self.switch_patient(patient_id)?;
        self.reconciler.reconcile_patient(patient_id).await
    }
}
