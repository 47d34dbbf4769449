//! Core domain model for medication resolution and reconciliation.
//!
//! Everything here is plain data: no I/O, no FHIR JSON. The `medrec-fhir`
//! crate extracts these types from FHIR resources and drives the workflows.

use serde::{Deserialize, Serialize};

mod discontinuation;
mod list;
mod medication;
mod order;
mod safety;

pub use discontinuation::{
    DiscontinuationEffect, DiscontinuationKind, DiscontinuationRecord, ReasonCode, TaperingPlan,
    TaperingStep, MAX_TAPERING_INTERVAL_DAYS, MAX_TAPERING_STEPS,
};
pub use list::{
    ConflictGroup, ListCategory, ListEntry, ListStatistics, Provenance, ReconciliationList,
};
pub use medication::{
    name_key, CodedConcept, MedicationDescriptor, MedicationPointer, UNKNOWN_MEDICATION,
};
pub use order::{MedicationOrder, OrderNote, OrderStatus, SourceType};
pub use safety::{
    AllergyCriticality, AllergyRecord, Contraindication, FindingKind, InteractionRule,
    InteractionSeverity, PatientContext, RiskLevel, SafetyFinding, SafetyMedication,
    SafetyOptions, SafetyReport,
};

/// Tunables for discontinuation, reconciliation and safety checking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MedRecConfig {
    /// Number of dose-reduction steps in a generated tapering plan.
    pub tapering_steps: u32,
    /// Days between consecutive tapering steps.
    pub tapering_interval_days: u32,
    /// Append a review note to orders that end up in a conflict group.
    pub annotate_conflicts: bool,
    /// Reuse safety reports for identical (patient, medications, options) inputs.
    pub safety_cache_enabled: bool,
}

impl Default for MedRecConfig {
    fn default() -> Self {
        Self {
            tapering_steps: 3,
            tapering_interval_days: 7,
            annotate_conflicts: false,
            safety_cache_enabled: true,
        }
    }
}

/// Display priority shared by findings and list annotations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Moderate,
    Low,
    Info,
}

/// Errors surfaced by resolution, safety checking and discontinuation.
///
/// Reconciliation conflicts are not errors; they are reported as
/// [`ConflictGroup`] values on the reconciliation result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MedRecError {
    #[error("{resource_type}/{id} not found")]
    NotFound { resource_type: String, id: String },
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    #[error("could not parse input: {0}")]
    Parse(String),
    #[error("shared state lock poisoned")]
    LockPoisoned,
}

impl MedRecError {
    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

pub type MedRecResult<T> = Result<T, MedRecError>;
