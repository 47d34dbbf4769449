use serde::{Deserialize, Serialize};

/// Display text used when nothing else identifies a medication.
pub const UNKNOWN_MEDICATION: &str = "Unknown medication";

/// A coded concept reduced to its text and first coding.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CodedConcept {
    pub text: Option<String>,
    pub system: Option<String>,
    pub code: Option<String>,
    pub display: Option<String>,
}

impl CodedConcept {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Best human label: text, then coding display, then the bare code.
    pub fn label(&self) -> Option<&str> {
        [&self.text, &self.display, &self.code]
            .into_iter()
            .filter_map(|value| value.as_deref())
            .map(str::trim)
            .find(|value| !value.is_empty())
    }

    /// `system|code` when both halves are present.
    pub fn coded_key(&self) -> Option<String> {
        match (self.system.as_deref(), self.code.as_deref()) {
            (Some(system), Some(code)) if !system.is_empty() && !code.is_empty() => {
                Some(format!("{system}|{code}"))
            }
            _ => None,
        }
    }
}

/// Resolved identity of a medication, independent of the record that pointed at it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MedicationDescriptor {
    pub name: String,
    pub code: Option<CodedConcept>,
    pub form: Option<String>,
    #[serde(default)]
    pub ingredients: Vec<String>,
    /// `Medication/{id}`, a urn, `#local` for contained definitions, or the
    /// owning record id for inline concepts.
    pub source_id: String,
}

impl MedicationDescriptor {
    pub fn named(name: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: None,
            form: None,
            ingredients: Vec::new(),
            source_id: source_id.into(),
        }
    }

    /// Key used to group records across sources.
    ///
    /// Coded identity wins; otherwise falls back to the lower-cased name, which
    /// can merge or split medications that are spelled differently.
    pub fn identity_key(&self) -> String {
        self.code
            .as_ref()
            .and_then(CodedConcept::coded_key)
            .map(|key| key.to_lowercase())
            .unwrap_or_else(|| name_key(&self.name))
    }
}

/// Name-based identity key.
pub fn name_key(name: &str) -> String {
    format!("name:{}", name.trim().to_lowercase())
}

/// Normalized pointer from a record to its medication definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MedicationPointer {
    /// `#local` reference to a definition contained in the same record.
    Embedded {
        local_id: String,
        display: Option<String>,
    },
    /// `urn:uuid:` or `urn:oid:` reference, usually to a bundle entry.
    UrnReference { urn: String, display: Option<String> },
    /// `Type/id` reference to a separately stored resource.
    TypedReference {
        resource_type: String,
        id: String,
        display: Option<String>,
    },
    /// Self-describing coded concept on the record itself.
    InlineConcept { concept: CodedConcept, legacy: bool },
}

impl MedicationPointer {
    pub fn display_hint(&self) -> Option<&str> {
        match self {
            MedicationPointer::Embedded { display, .. }
            | MedicationPointer::UrnReference { display, .. }
            | MedicationPointer::TypedReference { display, .. } => display.as_deref(),
            MedicationPointer::InlineConcept { .. } => None,
        }
    }

    /// Normalized key of an externally stored target, if this pointer has one.
    pub fn external_key(&self) -> Option<String> {
        match self {
            MedicationPointer::UrnReference { urn, .. } => Some(urn.clone()),
            MedicationPointer::TypedReference {
                resource_type, id, ..
            } => Some(format!("{resource_type}/{id}")),
            _ => None,
        }
    }
}
