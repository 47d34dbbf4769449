//! FHIR resource readers: medication records, definitions, allergies and conditions.

use std::collections::HashMap;

use medrec_core::{
    AllergyCriticality, AllergyRecord, MedRecError, MedicationDescriptor, MedicationOrder,
    OrderNote, OrderStatus, SourceType,
};
use serde_json::Value;

use crate::json::{
    category_matches, extract_codeable_text, extract_concept, extract_datetime, reference_id,
    str_field, string_field,
};
use crate::pointer::extract_pointer;

pub fn source_type_of(resource: &Value) -> Option<SourceType> {
    match str_field(resource, "resourceType")? {
        "MedicationRequest" => Some(SourceType::Order),
        "MedicationStatement" => Some(SourceType::Statement),
        "MedicationDispense" => Some(SourceType::Dispense),
        _ => None,
    }
}

/// Reads a MedicationRequest, MedicationStatement or MedicationDispense.
///
/// A record whose medication pointer is malformed still parses; its
/// `pointer` is left empty and the resolver reports it.
pub fn parse_record(resource: &Value) -> Result<MedicationOrder, MedRecError> {
    let source = source_type_of(resource).ok_or_else(|| {
        MedRecError::ValidationFailed(format!(
            "unsupported resourceType {}",
            str_field(resource, "resourceType").unwrap_or("<missing>")
        ))
    })?;

    let id = string_field(resource, "id")
        .ok_or_else(|| MedRecError::ValidationFailed("medication record has no id".into()))?;

    let status = str_field(resource, "status")
        .map(|code| OrderStatus::from_code(source, code))
        .unwrap_or(OrderStatus::Unknown);

    let pointer = match extract_pointer(resource) {
        Ok(pointer) => Some(pointer),
        Err(err) => {
            tracing::debug!(record = %id, error = %err, "record has no usable medication pointer");
            None
        }
    };

    let contained = resource
        .get("contained")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| str_field(item, "resourceType") == Some("Medication"))
                .filter_map(|item| {
                    let local = str_field(item, "id")?;
                    parse_medication_definition(item, &format!("#{local}"))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(MedicationOrder {
        id,
        source,
        status,
        pointer,
        patient_id: extract_patient_id(resource),
        dosage_text: extract_dosage_text(resource),
        authored_on: extract_datetime(
            resource,
            &[
                "authoredOn",
                "dateAsserted",
                "effectiveDateTime",
                "effectivePeriod",
                "whenHandedOver",
                "whenPrepared",
            ],
        ),
        last_updated: resource
            .get("meta")
            .and_then(|meta| extract_datetime(meta, &["lastUpdated"])),
        notes: extract_notes(resource),
        contained,
        enriched_text: None,
        legacy_concept: resource
            .get("medicationCodeableConcept")
            .and_then(extract_concept),
        discharge: category_matches(resource, "discharge"),
    })
}

/// Builds a descriptor from a Medication resource. `None` when it names nothing.
pub fn parse_medication_definition(
    resource: &Value,
    source_id: &str,
) -> Option<MedicationDescriptor> {
    let code = resource.get("code").and_then(extract_concept);
    let name = code.as_ref().and_then(|concept| concept.label())?.to_string();

    let ingredients = resource
        .get("ingredient")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(ingredient_label).collect())
        .unwrap_or_default();

    Some(MedicationDescriptor {
        name,
        code,
        form: resource.get("form").and_then(extract_codeable_text),
        ingredients,
        source_id: source_id.to_string(),
    })
}

fn ingredient_label(ingredient: &Value) -> Option<String> {
    let item = ingredient.get("item");
    item.and_then(|item| item.get("concept"))
        .and_then(extract_codeable_text)
        .or_else(|| ingredient.get("itemCodeableConcept").and_then(extract_codeable_text))
        .or_else(|| {
            item.and_then(|item| item.get("reference"))
                .and_then(|reference| string_field(reference, "display"))
        })
        .or_else(|| {
            ingredient
                .get("itemReference")
                .and_then(|reference| string_field(reference, "display"))
        })
}

/// Attaches the text of `_include`d Medication resources to the records that
/// reference them. Only records without enrichment are touched.
pub fn enrich_from_includes(orders: &mut [MedicationOrder], included: &[Value]) -> usize {
    let mut labels: HashMap<String, String> = HashMap::new();
    for resource in included {
        if str_field(resource, "resourceType") != Some("Medication") {
            continue;
        }
        let Some(id) = str_field(resource, "id") else {
            continue;
        };
        if let Some(label) = resource.get("code").and_then(extract_codeable_text) {
            labels.insert(format!("Medication/{id}"), label);
        }
    }

    let mut enriched = 0;
    for order in orders.iter_mut().filter(|order| order.enriched_text.is_none()) {
        let key = order.pointer.as_ref().and_then(|pointer| pointer.external_key());
        if let Some(label) = key.and_then(|key| labels.get(&key)) {
            order.enriched_text = Some(label.clone());
            enriched += 1;
        }
    }
    enriched
}

pub fn parse_allergy(resource: &Value) -> Option<AllergyRecord> {
    let substance = resource.get("code").and_then(extract_codeable_text)?;

    let clinical = resource
        .get("clinicalStatus")
        .and_then(extract_concept)
        .and_then(|concept| concept.code.or(concept.text))
        .unwrap_or_else(|| "active".to_string());
    let verification = resource
        .get("verificationStatus")
        .and_then(extract_concept)
        .and_then(|concept| concept.code);
    let refuted = matches!(
        verification.as_deref(),
        Some("refuted") | Some("entered-in-error")
    );

    Some(AllergyRecord {
        substance,
        criticality: str_field(resource, "criticality").and_then(AllergyCriticality::parse),
        active: clinical == "active" && !refuted,
        reaction: summarize_reactions(resource),
    })
}

/// Label of an active Condition, `None` for resolved or unnamed ones.
pub fn parse_condition(resource: &Value) -> Option<String> {
    let status = resource
        .get("clinicalStatus")
        .and_then(extract_concept)
        .and_then(|concept| concept.code);
    if matches!(
        status.as_deref(),
        Some("resolved") | Some("inactive") | Some("remission")
    ) {
        return None;
    }
    resource.get("code").and_then(extract_codeable_text)
}

fn summarize_reactions(resource: &Value) -> Option<String> {
    let reactions = resource.get("reaction")?.as_array()?;
    let parts: Vec<String> = reactions
        .iter()
        .filter_map(|reaction| reaction.get("manifestation").and_then(Value::as_array))
        .flatten()
        .filter_map(|manifestation| {
            manifestation
                .get("concept")
                .and_then(extract_codeable_text)
                .or_else(|| extract_codeable_text(manifestation))
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

fn extract_patient_id(resource: &Value) -> Option<String> {
    ["subject", "patient"]
        .iter()
        .filter_map(|field| resource.get(*field))
        .filter_map(|reference| str_field(reference, "reference"))
        .map(|reference| reference_id(reference).to_string())
        .next()
}

fn extract_dosage_text(resource: &Value) -> Option<String> {
    ["dosageInstruction", "dosage"]
        .iter()
        .filter_map(|field| resource.get(*field).and_then(Value::as_array))
        .filter_map(|dosages| dosages.first())
        .filter_map(|dosage| string_field(dosage, "text"))
        .next()
}

fn extract_notes(resource: &Value) -> Vec<OrderNote> {
    resource
        .get("note")
        .and_then(Value::as_array)
        .map(|notes| {
            notes
                .iter()
                .filter_map(|note| {
                    Some(OrderNote {
                        text: string_field(note, "text")?,
                        time: extract_datetime(note, &["time"]),
                        author: string_field(note, "authorString").or_else(|| {
                            note.get("authorReference")
                                .and_then(|author| string_field(author, "display"))
                        }),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use medrec_core::MedicationPointer;
    use serde_json::json;

    use super::*;

    #[test]
    fn request_with_contained_definition() {
        let order = parse_record(&json!({
            "resourceType": "MedicationRequest",
            "id": "rx1",
            "status": "active",
            "subject": {"reference": "Patient/p1"},
            "contained": [{"resourceType": "Medication", "id": "med1", "code": "Warfarin"}],
            "medicationReference": {"reference": "#med1"},
            "dosageInstruction": [{"text": "5 mg daily"}],
            "note": [{"text": "Started after AF diagnosis", "time": "2024-01-02T10:00:00Z"}]
        }))
        .unwrap();

        assert_eq!(order.source, SourceType::Order);
        assert_eq!(order.patient_id.as_deref(), Some("p1"));
        assert_eq!(order.dosage_text.as_deref(), Some("5 mg daily"));
        assert_eq!(order.notes.len(), 1);
        assert_eq!(
            order.contained_definition("med1").map(|d| d.name.as_str()),
            Some("Warfarin")
        );
        assert!(matches!(order.pointer, Some(MedicationPointer::Embedded { .. })));
    }

    #[test]
    fn dispense_and_statement_statuses() {
        let dispense = parse_record(&json!({
            "resourceType": "MedicationDispense",
            "id": "d1",
            "status": "completed",
            "medicationCodeableConcept": {"text": "Aspirin"}
        }))
        .unwrap();
        assert_eq!(dispense.status, OrderStatus::Active);
        assert!(dispense.legacy_concept.is_some());

        let statement = parse_record(&json!({
            "resourceType": "MedicationStatement",
            "id": "s1",
            "status": "stopped",
            "medication": {"concept": {"text": "Aspirin"}}
        }))
        .unwrap();
        assert_eq!(statement.status, OrderStatus::Stopped);
    }

    #[test]
    fn missing_pointer_still_parses() {
        let order = parse_record(&json!({
            "resourceType": "MedicationRequest",
            "id": "rx9",
            "status": "active"
        }))
        .unwrap();
        assert!(order.pointer.is_none());
    }

    #[test]
    fn other_resources_are_rejected() {
        let err = parse_record(&json!({"resourceType": "Observation", "id": "o1"})).unwrap_err();
        assert!(matches!(err, MedRecError::ValidationFailed(_)));
    }

    #[test]
    fn refuted_allergy_is_inactive() {
        let allergy = parse_allergy(&json!({
            "code": {"text": "Penicillin"},
            "criticality": "high",
            "verificationStatus": {"coding": [{"code": "refuted"}]}
        }))
        .unwrap();
        assert!(!allergy.active);
        assert_eq!(allergy.criticality, Some(AllergyCriticality::High));
    }

    #[test]
    fn includes_enrich_referencing_orders() {
        let mut orders = vec![parse_record(&json!({
            "resourceType": "MedicationRequest",
            "id": "rx2",
            "status": "active",
            "medicationReference": {"reference": "Medication/m7"}
        }))
        .unwrap()];
        let included = vec![json!({
            "resourceType": "Medication",
            "id": "m7",
            "code": {"text": "Metoprolol"}
        })];

        assert_eq!(enrich_from_includes(&mut orders, &included), 1);
        assert_eq!(orders[0].enriched_text.as_deref(), Some("Metoprolol"));
    }
}
