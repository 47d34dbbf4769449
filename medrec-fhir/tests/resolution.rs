use std::sync::Arc;

use medrec_core::{MedRecError, MedicationOrder, OrderStatus, SourceType, UNKNOWN_MEDICATION};
use medrec_fhir::{parse_record, InMemoryStore, MedicationResolver, ResolutionCache};
use serde_json::{json, Value};

fn resolver_over(store: &Arc<InMemoryStore>) -> MedicationResolver {
    MedicationResolver::new(store.clone(), Arc::new(ResolutionCache::new()))
}

fn request(id: &str, medication: Value) -> MedicationOrder {
    let mut resource = json!({
        "resourceType": "MedicationRequest",
        "id": id,
        "status": "active",
        "subject": {"reference": "Patient/p1"}
    });
    if let (Some(body), Some(extra)) = (resource.as_object_mut(), medication.as_object()) {
        body.extend(extra.clone());
    }
    parse_record(&resource).expect("request should parse")
}

fn medication(id: &str, text: &str, code: &str) -> Value {
    json!({
        "resourceType": "Medication",
        "id": id,
        "code": {
            "coding": [{"system": "http://www.nlm.nih.gov/research/umls/rxnorm", "code": code}],
            "text": text
        }
    })
}

#[tokio::test]
async fn embedded_definition_resolves_without_fetch() {
    let store = Arc::new(InMemoryStore::new());
    let resolver = resolver_over(&store);
    let order = request(
        "rx1",
        json!({
            "contained": [{"resourceType": "Medication", "id": "med1", "code": {"text": "Warfarin"}}],
            "medicationReference": {"reference": "#med1"}
        }),
    );

    let resolution = resolver.resolve(&[order]).await.expect("resolve");

    assert_eq!(resolution.get("rx1").map(|d| d.name.as_str()), Some("Warfarin"));
    assert_eq!(resolution.fetched, 0);
    assert_eq!(store.read_count(), 0);
    assert!(resolution.issues.is_empty());
}

#[tokio::test]
async fn embedded_definitions_are_scoped_per_record() {
    let store = Arc::new(InMemoryStore::new());
    let resolver = resolver_over(&store);
    let first = request(
        "rx1",
        json!({
            "contained": [{"resourceType": "Medication", "id": "med1", "code": {"text": "Warfarin"}}],
            "medicationReference": {"reference": "#med1"}
        }),
    );
    let second = request(
        "rx2",
        json!({
            "contained": [{"resourceType": "Medication", "id": "med1", "code": {"text": "Metformin"}}],
            "medicationReference": {"reference": "#med1"}
        }),
    );

    let resolution = resolver.resolve(&[first, second]).await.expect("resolve");

    assert_eq!(resolution.get("rx1").map(|d| d.name.as_str()), Some("Warfarin"));
    assert_eq!(resolution.get("rx2").map(|d| d.name.as_str()), Some("Metformin"));
}

#[tokio::test]
async fn repeated_resolution_shares_descriptor_instances() {
    let store = Arc::new(InMemoryStore::new());
    store
        .insert(medication("m1", "Lisinopril 10 MG Oral Tablet", "314076"))
        .expect("insert");
    let resolver = resolver_over(&store);
    let orders = vec![
        request("rx1", json!({"medicationReference": {"reference": "Medication/m1"}})),
        request("rx2", json!({"medication": {"reference": {"reference": "Medication/m1"}}})),
    ];

    let first = resolver.resolve(&orders).await.expect("first resolve");
    let second = resolver.resolve(&orders).await.expect("second resolve");

    assert_eq!(store.read_count(), 1);
    assert_eq!(first.fetched, 1);
    assert_eq!(second.fetched, 0);

    let a = first.get("rx1").expect("rx1 resolved");
    let b = first.get("rx2").expect("rx2 resolved");
    let c = second.get("rx1").expect("rx1 resolved again");
    assert!(Arc::ptr_eq(a, b));
    assert!(Arc::ptr_eq(a, c));
}

#[tokio::test]
async fn failed_fetch_is_isolated_and_not_retried() {
    let store = Arc::new(InMemoryStore::new());
    store
        .insert(medication("good", "Metformin 500 MG Oral Tablet", "861007"))
        .expect("insert");
    store.insert(medication("bad", "Never served", "0")).expect("insert");
    store.fail_reads_for("Medication", "bad").expect("mark failing");
    let resolver = resolver_over(&store);
    let orders = vec![
        request("rx-good", json!({"medicationReference": {"reference": "Medication/good"}})),
        request(
            "rx-bad",
            json!({"medicationReference": {"reference": "Medication/bad", "display": "Coumadin"}}),
        ),
    ];

    let first = resolver.resolve(&orders).await.expect("batch succeeds");
    assert!(first.get("rx-good").is_some());
    assert!(first.get("rx-bad").is_none());
    assert_eq!(first.issues.len(), 1);
    assert_eq!(first.issues[0].order_id, "rx-bad");
    assert!(matches!(first.issues[0].error, MedRecError::FetchFailed(_)));
    assert_eq!(first.display_name(&orders[1]), "Coumadin");

    let reads = store.read_count();
    let second = resolver.resolve(&orders).await.expect("batch succeeds");
    assert_eq!(store.read_count(), reads);
    assert_eq!(second.issues.len(), 1);
}

#[tokio::test]
async fn missing_target_reports_not_found() {
    let store = Arc::new(InMemoryStore::new());
    let resolver = resolver_over(&store);
    let order = request("rx1", json!({"medicationReference": {"reference": "Medication/nope"}}));

    let err = resolver.resolve_one(&order).await.expect_err("nothing to resolve");
    assert_eq!(err, MedRecError::not_found("Medication", "nope"));
}

#[tokio::test]
async fn display_name_follows_fallback_chain() {
    let store = Arc::new(InMemoryStore::new());
    let resolver = resolver_over(&store);

    let mut enriched = request("rx-enriched", json!({"medicationReference": {"reference": "Medication/x"}}));
    enriched.enriched_text = Some("Included Label".into());
    let hinted = request(
        "rx-hint",
        json!({"medicationReference": {"reference": "Medication/y", "display": "Reference Display"}}),
    );
    let mut legacy = MedicationOrder::new("rx-legacy", SourceType::Order, OrderStatus::Active);
    legacy.legacy_concept = Some(medrec_core::CodedConcept {
        text: None,
        system: None,
        code: None,
        display: Some("Legacy Display".into()),
    });
    let bare = MedicationOrder::new("rx-bare", SourceType::Order, OrderStatus::Active);

    let orders = vec![enriched, hinted, legacy, bare];
    let resolution = resolver.resolve(&orders).await.expect("resolve");

    let names: Vec<String> = orders.iter().map(|o| resolution.display_name(o)).collect();
    assert_eq!(
        names,
        vec![
            "Included Label".to_string(),
            "Reference Display".to_string(),
            "Legacy Display".to_string(),
            UNKNOWN_MEDICATION.to_string(),
        ]
    );
    assert!(names.iter().all(|name| !name.is_empty()));
    assert_eq!(resolution.issues.len(), 4);
}

#[tokio::test]
async fn inline_concepts_need_no_cache_or_fetch() {
    let store = Arc::new(InMemoryStore::new());
    let resolver = resolver_over(&store);
    let order = request(
        "rx1",
        json!({"medicationCodeableConcept": {"text": "Aspirin 81 MG Chewable Tablet"}}),
    );

    let descriptor = resolver.resolve_one(&order).await.expect("inline concept");

    assert_eq!(descriptor.name, "Aspirin 81 MG Chewable Tablet");
    assert_eq!(store.read_count(), 0);
    assert!(resolver.cache().is_empty());
}

#[tokio::test]
async fn preloaded_context_and_bundle_urns_resolve() {
    let bundle = json!({
        "resourceType": "Bundle",
        "entry": [{
            "fullUrl": "urn:uuid:6f1b0c2a-3d4e-4f5a-8b9c-0d1e2f3a4b5c",
            "resource": medication("m-urn", "Simvastatin 20 MG Oral Tablet", "198211")
        }]
    });
    let store = Arc::new(InMemoryStore::from_bundle(&bundle).expect("bundle"));
    store
        .preload_context(medication("m-ctx", "Metformin 500 MG Oral Tablet", "861007"))
        .expect("preload");
    let resolver = resolver_over(&store);
    let orders = vec![
        request(
            "rx-urn",
            json!({"medicationReference": {"reference": "urn:uuid:6f1b0c2a-3d4e-4f5a-8b9c-0d1e2f3a4b5c"}}),
        ),
        request("rx-ctx", json!({"medicationReference": {"reference": "Medication/m-ctx"}})),
    ];

    let resolution = resolver.resolve(&orders).await.expect("resolve");

    assert_eq!(
        resolution.get("rx-urn").map(|d| d.name.as_str()),
        Some("Simvastatin 20 MG Oral Tablet")
    );
    assert_eq!(
        resolution.get("rx-ctx").map(|d| d.name.as_str()),
        Some("Metformin 500 MG Oral Tablet")
    );
    assert_eq!(resolution.fetched, 1);
}

#[tokio::test]
async fn concurrent_batches_keep_one_instance() {
    let store = Arc::new(InMemoryStore::new());
    store
        .insert(medication("m1", "Naproxen 250 MG Oral Tablet", "198013"))
        .expect("insert");
    let resolver = Arc::new(resolver_over(&store));
    let order = request("rx1", json!({"medicationReference": {"reference": "Medication/m1"}}));

    let (left, right) = tokio::join!(
        resolver.resolve_one(&order),
        resolver.resolve_one(&order)
    );
    let left = left.expect("left");
    let right = right.expect("right");
    let cached = resolver.resolve_one(&order).await.expect("cached");

    assert!(Arc::ptr_eq(&left, &cached));
    assert!(Arc::ptr_eq(&right, &cached));
}
