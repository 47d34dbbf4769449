use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::order::OrderStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiscontinuationKind {
    Immediate,
    Tapered,
}

/// Why an order was discontinued.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    AdverseReaction,
    TherapyComplete,
    Ineffective,
    PatientRequest,
    Duplicate,
    Substitution,
    Other,
}

impl ReasonCode {
    pub fn as_code(self) -> &'static str {
        match self {
            ReasonCode::AdverseReaction => "adverse-reaction",
            ReasonCode::TherapyComplete => "therapy-complete",
            ReasonCode::Ineffective => "ineffective",
            ReasonCode::PatientRequest => "patient-request",
            ReasonCode::Duplicate => "duplicate",
            ReasonCode::Substitution => "substitution",
            ReasonCode::Other => "other",
        }
    }

    pub fn display(self) -> &'static str {
        match self {
            ReasonCode::AdverseReaction => "Adverse reaction",
            ReasonCode::TherapyComplete => "Therapy complete",
            ReasonCode::Ineffective => "Ineffective",
            ReasonCode::PatientRequest => "Patient request",
            ReasonCode::Duplicate => "Duplicate therapy",
            ReasonCode::Substitution => "Substituted",
            ReasonCode::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TaperingStep {
    /// Fraction of the original dose, in (0, 1).
    pub dose_fraction: f64,
    pub start_date: DateTime<Utc>,
}

/// Upper bound on reduction steps in one plan.
pub const MAX_TAPERING_STEPS: u32 = 52;
/// Upper bound on days between reduction steps.
pub const MAX_TAPERING_INTERVAL_DAYS: u32 = 365;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaperingPlan {
    pub steps: Vec<TaperingStep>,
}

impl TaperingPlan {
    /// Evenly spaced reductions: step `i` of `n` runs at `1 - (i + 1) / (n + 1)`.
    ///
    /// `steps` is clamped to `1..=MAX_TAPERING_STEPS` and `interval_days` to
    /// at most [`MAX_TAPERING_INTERVAL_DAYS`].
    pub fn linear(start: DateTime<Utc>, steps: u32, interval_days: u32) -> Self {
        let steps = steps.clamp(1, MAX_TAPERING_STEPS);
        let interval_days = interval_days.min(MAX_TAPERING_INTERVAL_DAYS);
        let plan = (0..steps)
            .map(|i| TaperingStep {
                dose_fraction: 1.0 - f64::from(i + 1) / f64::from(steps + 1),
                start_date: start + Duration::days(i64::from(i) * i64::from(interval_days)),
            })
            .collect();
        Self { steps: plan }
    }

    /// Date on which the last reduced dose ends.
    pub fn ends_at(&self, interval_days: u32) -> Option<DateTime<Utc>> {
        self.steps
            .last()
            .map(|step| step.start_date + Duration::days(i64::from(interval_days)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscontinuationEffect {
    Applied,
    /// Retry on an order that was already discontinued; nothing changed.
    NoOp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscontinuationRecord {
    pub id: Uuid,
    pub order_id: String,
    pub reason: ReasonCode,
    pub reason_text: Option<String>,
    pub kind: DiscontinuationKind,
    pub tapering: Option<TaperingPlan>,
    pub previous_status: OrderStatus,
    pub new_status: OrderStatus,
    pub effect: DiscontinuationEffect,
    pub created_at: DateTime<Utc>,
}

impl DiscontinuationRecord {
    pub fn is_applied(&self) -> bool {
        self.effect == DiscontinuationEffect::Applied
    }
}
