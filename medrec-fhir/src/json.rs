//! Small readers over FHIR JSON shared by the record and pointer parsers.

use chrono::{DateTime, Utc};
use medrec_core::CodedConcept;
use serde_json::Value;

pub(crate) fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

pub(crate) fn string_field(value: &Value, field: &str) -> Option<String> {
    str_field(value, field).map(str::to_string)
}

/// Reads a CodeableConcept. A bare string is accepted as concept text.
pub(crate) fn extract_concept(value: &Value) -> Option<CodedConcept> {
    if let Some(text) = value.as_str() {
        let text = text.trim();
        return (!text.is_empty()).then(|| CodedConcept::from_text(text));
    }

    let first_coding = value
        .get("coding")
        .and_then(Value::as_array)
        .and_then(|codings| codings.first());

    let concept = CodedConcept {
        text: string_field(value, "text"),
        system: first_coding.and_then(|coding| string_field(coding, "system")),
        code: first_coding.and_then(|coding| string_field(coding, "code")),
        display: first_coding.and_then(|coding| string_field(coding, "display")),
    };

    concept.label().is_some().then_some(concept)
}

pub(crate) fn extract_codeable_text(value: &Value) -> Option<String> {
    extract_concept(value).and_then(|concept| concept.label().map(str::to_string))
}

pub(crate) fn extract_datetime(resource: &Value, fields: &[&str]) -> Option<DateTime<Utc>> {
    for field in fields {
        let Some(value) = resource.get(*field) else {
            continue;
        };

        if let Some(dt) = value.as_str().and_then(parse_datetime) {
            return Some(dt);
        }

        if let Some(obj) = value.as_object() {
            for key in ["start", "end"] {
                if let Some(dt) = obj.get(key).and_then(Value::as_str).and_then(parse_datetime) {
                    return Some(dt);
                }
            }
        }
    }
    None
}

/// RFC 3339 timestamps, or bare `YYYY-MM-DD` dates taken at midnight UTC.
pub(crate) fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// True when any `category` concept mentions `keyword` in its text, display or code.
pub(crate) fn category_matches(resource: &Value, keyword: &str) -> bool {
    let needle = keyword.to_lowercase();
    let categories: Vec<&Value> = match resource.get("category") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single @ Value::Object(_)) => vec![single],
        _ => return false,
    };

    categories.into_iter().any(|entry| {
        if let Some(text) = entry.get("text").and_then(Value::as_str) {
            if text.to_lowercase().contains(&needle) {
                return true;
            }
        }

        entry
            .get("coding")
            .and_then(Value::as_array)
            .map(|codings| {
                codings.iter().any(|coding| {
                    ["display", "code"].iter().any(|field| {
                        coding
                            .get(*field)
                            .and_then(Value::as_str)
                            .is_some_and(|text| text.to_lowercase().contains(&needle))
                    })
                })
            })
            .unwrap_or(false)
    })
}

/// Last path segment of a `Type/id` reference, or the value itself.
pub(crate) fn reference_id(reference: &str) -> &str {
    reference.rsplit('/').next().unwrap_or(reference)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn concept_accepts_plain_string() {
        let concept = extract_concept(&json!("Warfarin")).unwrap();
        assert_eq!(concept.label(), Some("Warfarin"));
        assert!(extract_concept(&json!("   ")).is_none());
    }

    #[test]
    fn concept_reads_first_coding() {
        let concept = extract_concept(&json!({
            "coding": [
                {"system": "http://www.nlm.nih.gov/research/umls/rxnorm", "code": "1191", "display": "Aspirin"},
                {"system": "other", "code": "x"}
            ]
        }))
        .unwrap();
        assert_eq!(concept.code.as_deref(), Some("1191"));
        assert_eq!(concept.label(), Some("Aspirin"));
    }

    #[test]
    fn dates_without_time_are_midnight() {
        let dt = parse_datetime("2024-05-02").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-05-02T00:00:00+00:00");
    }

    #[test]
    fn discharge_category_is_detected() {
        let resource = json!({
            "category": [{"coding": [{"code": "discharge", "display": "Discharge"}]}]
        });
        assert!(category_matches(&resource, "discharge"));
        assert!(!category_matches(&json!({"category": []}), "discharge"));
    }
}
