use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::medication::{CodedConcept, MedicationDescriptor, MedicationPointer};

/// Where a medication record came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Prescription order (MedicationRequest).
    Order,
    /// Patient-reported usage (MedicationStatement).
    Statement,
    /// Pharmacy dispense event (MedicationDispense).
    Dispense,
    /// Synthesized by the reconciler.
    Reconciliation,
}

impl SourceType {
    pub fn resource_type(self) -> Option<&'static str> {
        match self {
            SourceType::Order => Some("MedicationRequest"),
            SourceType::Statement => Some("MedicationStatement"),
            SourceType::Dispense => Some("MedicationDispense"),
            SourceType::Reconciliation => None,
        }
    }
}

/// Lifecycle status of a medication record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OrderStatus {
    Draft,
    Active,
    OnHold,
    Stopped,
    Completed,
    Cancelled,
    Unknown,
}

impl OrderStatus {
    /// Map a FHIR status code to a status, taking the resource type into account.
    ///
    /// Dispense and statement resources use their own vocabularies; they are
    /// folded onto the order lattice here.
    pub fn from_code(source: SourceType, code: &str) -> Self {
        match (source, code) {
            (_, "draft") => OrderStatus::Draft,
            (_, "active") => OrderStatus::Active,
            (_, "on-hold") => OrderStatus::OnHold,
            (_, "stopped") => OrderStatus::Stopped,
            (_, "completed") if source != SourceType::Dispense => OrderStatus::Completed,
            (_, "cancelled") | (_, "entered-in-error") => OrderStatus::Cancelled,
            (SourceType::Dispense, "preparation" | "in-progress" | "completed") => {
                OrderStatus::Active
            }
            (SourceType::Dispense, "declined") => OrderStatus::Cancelled,
            (SourceType::Statement, "recorded" | "intended") => OrderStatus::Active,
            (SourceType::Statement, "not-taken") => OrderStatus::Stopped,
            _ => OrderStatus::Unknown,
        }
    }

    pub fn as_code(self) -> &'static str {
        match self {
            OrderStatus::Draft => "draft",
            OrderStatus::Active => "active",
            OrderStatus::OnHold => "on-hold",
            OrderStatus::Stopped => "stopped",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Stopped | OrderStatus::Completed | OrderStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        self == OrderStatus::Active
    }

    /// Whether `self -> next` is allowed. Self-transitions are not transitions.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Active, OnHold | Stopped | Completed)
                | (OnHold, Active | Stopped)
                | (Draft, Active | Cancelled)
                | (Unknown, Stopped)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// One entry of an order's append-only note history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderNote {
    pub text: String,
    pub time: Option<DateTime<Utc>>,
    pub author: Option<String>,
}

/// A medication record from any of the three sources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MedicationOrder {
    pub id: String,
    pub source: SourceType,
    pub status: OrderStatus,
    /// `None` when the record carries no usable medication pointer.
    pub pointer: Option<MedicationPointer>,
    pub patient_id: Option<String>,
    pub dosage_text: Option<String>,
    pub authored_on: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Vec<OrderNote>,
    /// Medication definitions carried inline (`contained`), keyed by local id.
    #[serde(default)]
    pub contained: Vec<MedicationDescriptor>,
    /// Display text attached by a batch-include step.
    pub enriched_text: Option<String>,
    /// Flat legacy `medicationCodeableConcept`, kept even when a reference wins.
    pub legacy_concept: Option<CodedConcept>,
    pub discharge: bool,
}

impl MedicationOrder {
    /// Minimal record, mostly useful for tests and synthetic inputs.
    pub fn new(id: impl Into<String>, source: SourceType, status: OrderStatus) -> Self {
        Self {
            id: id.into(),
            source,
            status,
            pointer: None,
            patient_id: None,
            dosage_text: None,
            authored_on: None,
            last_updated: None,
            notes: Vec::new(),
            contained: Vec::new(),
            enriched_text: None,
            legacy_concept: None,
            discharge: false,
        }
    }

    pub fn with_pointer(mut self, pointer: MedicationPointer) -> Self {
        self.pointer = Some(pointer);
        self
    }

    pub fn with_patient(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    pub fn contained_definition(&self, local_id: &str) -> Option<&MedicationDescriptor> {
        self.contained
            .iter()
            .find(|def| def.source_id.trim_start_matches('#') == local_id)
    }

    pub fn has_note_containing(&self, needle: &str) -> bool {
        self.notes.iter().any(|note| note.text.contains(needle))
    }
}
