use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Severity;

/// Clinical significance of a drug-drug interaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionSeverity {
    Minor,
    Moderate,
    Major,
    /// Never combine.
    Contraindicated,
}

impl InteractionSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            InteractionSeverity::Minor => "minor",
            InteractionSeverity::Moderate => "moderate",
            InteractionSeverity::Major => "major",
            InteractionSeverity::Contraindicated => "contraindicated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "minor" | "low" => Some(InteractionSeverity::Minor),
            "moderate" => Some(InteractionSeverity::Moderate),
            "major" | "severe" | "high" => Some(InteractionSeverity::Major),
            "contraindicated" => Some(InteractionSeverity::Contraindicated),
            _ => None,
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            InteractionSeverity::Minor => Severity::Low,
            InteractionSeverity::Moderate => Severity::Moderate,
            InteractionSeverity::Major => Severity::High,
            InteractionSeverity::Contraindicated => Severity::Critical,
        }
    }
}

impl fmt::Display for InteractionSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared interaction: `trigger` is matched against the other drug's name or class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InteractionRule {
    pub trigger: String,
    pub severity: InteractionSeverity,
    pub description: Option<String>,
}

impl InteractionRule {
    pub fn new(trigger: impl Into<String>, severity: InteractionSeverity) -> Self {
        Self {
            trigger: trigger.into(),
            severity,
            description: None,
        }
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Contraindication {
    pub condition: String,
    /// Absolute contraindications block; relative ones only warn.
    pub absolute: bool,
}

/// A medication as seen by the safety checker.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SafetyMedication {
    pub name: String,
    pub generic_name: Option<String>,
    #[serde(default)]
    pub brand_names: Vec<String>,
    pub drug_class: Option<String>,
    #[serde(default)]
    pub interactions: Vec<InteractionRule>,
    #[serde(default)]
    pub contraindications: Vec<Contraindication>,
}

impl SafetyMedication {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Lower-cased name, generic and brand names.
    pub fn identity_terms(&self) -> Vec<String> {
        std::iter::once(&self.name)
            .chain(self.generic_name.iter())
            .chain(self.brand_names.iter())
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect()
    }

    /// Generic name when known, else the display name, lower-cased.
    pub fn ingredient_key(&self) -> String {
        self.generic_name
            .as_deref()
            .unwrap_or(&self.name)
            .trim()
            .to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AllergyCriticality {
    Low,
    High,
    UnableToAssess,
}

impl AllergyCriticality {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(AllergyCriticality::Low),
            "high" => Some(AllergyCriticality::High),
            "unable-to-assess" => Some(AllergyCriticality::UnableToAssess),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AllergyRecord {
    pub substance: String,
    pub criticality: Option<AllergyCriticality>,
    pub active: bool,
    pub reaction: Option<String>,
}

impl AllergyRecord {
    pub fn active(substance: impl Into<String>, criticality: Option<AllergyCriticality>) -> Self {
        Self {
            substance: substance.into(),
            criticality,
            active: true,
            reaction: None,
        }
    }
}

/// What is known about the patient when checking candidates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatientContext {
    pub patient_id: String,
    #[serde(default)]
    pub allergies: Vec<AllergyRecord>,
    #[serde(default)]
    pub current_medications: Vec<SafetyMedication>,
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl PatientContext {
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SafetyOptions {
    pub check_interactions: bool,
    pub check_allergies: bool,
    pub check_contraindications: bool,
    pub check_duplicates: bool,
    /// Include the patient's current medications in the interaction scan.
    pub include_current: bool,
    /// Skip the report cache for this call. Not part of the cache key.
    #[serde(skip)]
    pub bypass_cache: bool,
}

impl Default for SafetyOptions {
    fn default() -> Self {
        Self {
            check_interactions: true,
            check_allergies: true,
            check_contraindications: true,
            check_duplicates: true,
            include_current: true,
            bypass_cache: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Interaction,
    Allergy,
    Contraindication,
    Dosage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyFinding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub text: String,
    pub medications: Vec<String>,
    /// Set for direct allergy matches, absolute contraindications and
    /// contraindicated interactions.
    pub hard_stop: bool,
}

/// Overall risk of a report, least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    None,
    Low,
    Moderate,
    High,
    Critical,
}

impl From<Severity> for RiskLevel {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Critical => RiskLevel::Critical,
            Severity::High => RiskLevel::High,
            Severity::Moderate => RiskLevel::Moderate,
            Severity::Low | Severity::Info => RiskLevel::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyReport {
    pub patient_id: String,
    pub findings: Vec<SafetyFinding>,
    pub checked_at: DateTime<Utc>,
    #[serde(default)]
    pub from_cache: bool,
}

impl SafetyReport {
    /// False only when a known blocking issue is present. Missing data is not unsafe.
    pub fn is_safe_to_proceed(&self) -> bool {
        !self.findings.iter().any(|finding| finding.hard_stop)
    }

    pub fn severity_level(&self) -> RiskLevel {
        self.findings
            .iter()
            .map(|finding| RiskLevel::from(finding.severity))
            .max()
            .unwrap_or(RiskLevel::None)
    }

    pub fn findings_of(&self, kind: FindingKind) -> impl Iterator<Item = &SafetyFinding> {
        self.findings.iter().filter(move |finding| finding.kind == kind)
    }
}
