//! FHIR-facing medication resolution, safety screening, discontinuation and
//! list reconciliation built on `medrec-core`.

use serde_json::Value;

mod cache;
mod discontinue;
mod engine;
mod json;
mod knowledge;
mod lists;
mod pointer;
mod reconcile;
mod record;
mod resolver;
mod safety;
mod store;

pub use cache::{CacheKey, CachedDescriptor, ResolutionCache};
pub use discontinue::{DiscontinuationService, DiscontinueOutcome, DiscontinueRequest};
pub use engine::MedRecEngine;
pub use knowledge::{DrugKnowledge, KnowledgeEntry};
pub use lists::{ChangeKind, ListChange, ListRegistry};
pub use pointer::{classify_reference, extract_pointer};
pub use reconcile::{ReconciliationResult, Reconciler, SourceLists, REVIEW_NOTE};
pub use record::{
    enrich_from_includes, parse_allergy, parse_condition, parse_medication_definition,
    parse_record, source_type_of,
};
pub use resolver::{MedicationResolver, Resolution, ResolutionIssue};
pub use safety::SafetyChecker;
pub use store::{InMemoryStore, ResourceStore, SearchPage, StoreError};

use medrec_core::{MedRecConfig, MedRecError};

/// Reconcile a patient's medications from a Bundle JSON string.
pub async fn reconcile_bundle_str(
    bundle_json: &str,
    patient_id: Option<&str>,
    knowledge: DrugKnowledge,
    config: MedRecConfig,
) -> Result<ReconciliationResult, MedRecError> {
    let value: Value =
        serde_json::from_str(bundle_json).map_err(|err| MedRecError::Parse(err.to_string()))?;
    reconcile_bundle_value(&value, patient_id, knowledge, config).await
}

/// Reconcile a patient's medications from a Bundle `serde_json::Value`.
///
/// Without an explicit patient, the first Patient entry of the bundle is used.
pub async fn reconcile_bundle_value(
    bundle: &Value,
    patient_id: Option<&str>,
    knowledge: DrugKnowledge,
    config: MedRecConfig,
) -> Result<ReconciliationResult, MedRecError> {
    let patient_id = match patient_id {
        Some(id) => id.to_string(),
        None => first_patient_id(bundle)
            .ok_or_else(|| MedRecError::ValidationFailed("bundle contains no Patient".into()))?,
    };
    let engine = MedRecEngine::from_bundle(bundle, knowledge, config)?;
    engine.reconcile_patient(&patient_id).await
}

/// Id of the first Patient resource in a Bundle.
pub fn first_patient_id(bundle: &Value) -> Option<String> {
    bundle
        .get("entry")?
        .as_array()?
        .iter()
        .filter_map(|entry| entry.get("resource"))
        .find(|resource| resource.get("resourceType").and_then(Value::as_str) == Some("Patient"))
        .and_then(|resource| resource.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
