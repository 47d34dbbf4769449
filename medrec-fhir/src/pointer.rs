//! Normalizes the four medication pointer shapes into [`MedicationPointer`].
//!
//! | shape                               | generation |
//! |-------------------------------------|------------|
//! | `medication.reference.reference`    | R5         |
//! | `medicationReference.reference`     | R4         |
//! | `medication.concept`                | R5         |
//! | `medicationCodeableConcept`         | R4         |
//!
//! Reference values are further split on their prefix: `#` (contained),
//! `urn:` (bundle-local), `Type/id` or a bare id.

use medrec_core::{MedRecError, MedicationPointer};
use serde_json::Value;

use crate::json::{extract_concept, string_field};

pub fn extract_pointer(resource: &Value) -> Result<MedicationPointer, MedRecError> {
    let nested = resource.get("medication");

    if let Some(reference) = nested.and_then(|medication| medication.get("reference")) {
        return pointer_from_reference(reference);
    }

    if let Some(reference) = resource.get("medicationReference") {
        return pointer_from_reference(reference);
    }

    if let Some(concept) = nested.and_then(|medication| medication.get("concept")) {
        return extract_concept(concept)
            .map(|concept| MedicationPointer::InlineConcept {
                concept,
                legacy: false,
            })
            .ok_or_else(|| MedRecError::ValidationFailed("medication.concept is empty".into()));
    }

    if let Some(concept) = resource.get("medicationCodeableConcept") {
        return extract_concept(concept)
            .map(|concept| MedicationPointer::InlineConcept {
                concept,
                legacy: true,
            })
            .ok_or_else(|| {
                MedRecError::ValidationFailed("medicationCodeableConcept is empty".into())
            });
    }

    Err(MedRecError::ValidationFailed(
        "record carries no medication pointer".into(),
    ))
}

fn pointer_from_reference(reference: &Value) -> Result<MedicationPointer, MedRecError> {
    let display = string_field(reference, "display");
    let Some(target) = string_field(reference, "reference") else {
        return Err(MedRecError::ValidationFailed(
            "medication reference has no target".into(),
        ));
    };
    classify_reference(&target, display)
}

/// Splits a reference string into one of the pointer variants.
pub fn classify_reference(
    target: &str,
    display: Option<String>,
) -> Result<MedicationPointer, MedRecError> {
    let target = target.trim();

    if let Some(local_id) = target.strip_prefix('#') {
        if local_id.is_empty() {
            return Err(MedRecError::ValidationFailed(
                "empty contained reference".into(),
            ));
        }
        return Ok(MedicationPointer::Embedded {
            local_id: local_id.to_string(),
            display,
        });
    }

    if target.starts_with("urn:") {
        return Ok(MedicationPointer::UrnReference {
            urn: target.to_string(),
            display,
        });
    }

    if target.contains('/') {
        let mut segments = strip_version(target.trim_end_matches('/')).rsplit('/');
        let id = segments.next().unwrap_or_default();
        let resource_type = segments.next().unwrap_or_default();
        let looks_typed = resource_type
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_uppercase());
        if id.is_empty() || !looks_typed {
            return Err(MedRecError::ValidationFailed(format!(
                "unrecognized reference {target}"
            )));
        }
        return Ok(MedicationPointer::TypedReference {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            display,
        });
    }

    if target.is_empty() || target.chars().any(char::is_whitespace) {
        return Err(MedRecError::ValidationFailed(format!(
            "unrecognized reference {target:?}"
        )));
    }

    Ok(MedicationPointer::TypedReference {
        resource_type: "Medication".to_string(),
        id: target.to_string(),
        display,
    })
}

/// Drops a trailing `/_history/{version}` from a reference.
fn strip_version(target: &str) -> &str {
    match target.rsplit_once("/_history/") {
        Some((base, version)) if !version.is_empty() && !version.contains('/') => base,
        _ => target,
    }
}
