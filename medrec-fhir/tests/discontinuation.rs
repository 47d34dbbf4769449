mod common;

use chrono::{DateTime, Duration, Utc};
use medrec_core::{
    DiscontinuationEffect, ListCategory, MedRecConfig, MedRecError, OrderStatus, ReasonCode,
};
use medrec_fhir::{ChangeKind, DiscontinueRequest, ResourceStore};
use serde_json::json;

use common::{engine_over, fixture_store};

fn march_first() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-01T08:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

#[tokio::test]
async fn immediate_stop_updates_order_and_current_list() {
    let store = fixture_store();
    let engine = engine_over(&store, MedRecConfig::default());
    engine.reconcile_patient("p1").await.expect("reconcile");
    assert!(engine
        .lists()
        .list("p1", ListCategory::Current)
        .expect("registry")
        .expect("current list")
        .contains_live("rx-warfarin"));

    let outcome = engine
        .discontinue(
            "rx-warfarin",
            DiscontinueRequest::immediate(ReasonCode::AdverseReaction)
                .with_text("Bleeding gums")
                .effective(march_first()),
        )
        .await
        .expect("discontinue");

    assert_eq!(outcome.updated_order.status, OrderStatus::Stopped);
    assert_eq!(outcome.record.effect, DiscontinuationEffect::Applied);
    assert_eq!(outcome.record.previous_status, OrderStatus::Active);
    assert!(outcome.tapering_plan.is_none());
    assert_eq!(outcome.updated_order.notes.len(), 1);
    assert!(outcome.updated_order.notes[0].text.contains("Bleeding gums"));
    assert_eq!(outcome.updated_order.notes[0].time, Some(march_first()));

    let stored = store
        .read("MedicationRequest", "rx-warfarin")
        .await
        .expect("stored order");
    assert_eq!(stored["status"], "stopped");
    assert_eq!(stored["statusReason"]["coding"][0]["code"], "adverse-reaction");

    let current = engine
        .lists()
        .list("p1", ListCategory::Current)
        .expect("registry")
        .expect("current list");
    assert!(!current.contains_live("rx-warfarin"));
    assert!(current.contains_live("rx-amox"));
}

#[tokio::test]
async fn repeated_discontinuation_is_a_no_op() {
    let store = fixture_store();
    let engine = engine_over(&store, MedRecConfig::default());
    let request = DiscontinueRequest::immediate(ReasonCode::TherapyComplete);

    let first = engine
        .discontinue("rx-warfarin", request.clone())
        .await
        .expect("first");
    let writes = store.write_count();
    let second = engine
        .discontinue("rx-warfarin", request)
        .await
        .expect("second");

    assert_eq!(first.updated_order.status, OrderStatus::Stopped);
    assert_eq!(second.updated_order.status, OrderStatus::Stopped);
    assert_eq!(second.record.effect, DiscontinuationEffect::NoOp);
    assert_eq!(store.write_count(), writes);

    let history = engine
        .discontinuation()
        .history("rx-warfarin")
        .expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|record| record.is_applied()).count(), 1);
}

#[tokio::test]
async fn tapering_holds_the_order_with_a_linear_plan() {
    let store = fixture_store();
    let engine = engine_over(&store, MedRecConfig::default());
    engine.reconcile_patient("p1").await.expect("reconcile");

    let outcome = engine
        .discontinue(
            "rx-amox",
            DiscontinueRequest::tapered(ReasonCode::Ineffective).effective(march_first()),
        )
        .await
        .expect("taper");

    assert_eq!(outcome.updated_order.status, OrderStatus::OnHold);
    let plan = outcome.tapering_plan.expect("plan attached");
    let fractions: Vec<f64> = plan.steps.iter().map(|step| step.dose_fraction).collect();
    assert_eq!(fractions, vec![0.75, 0.5, 0.25]);
    assert_eq!(plan.steps[0].start_date, march_first());
    assert_eq!(plan.steps[2].start_date, march_first() + Duration::days(14));
    assert_eq!(outcome.record.tapering.as_ref(), Some(&plan));

    let lists = engine.lists();
    let current = lists
        .list("p1", ListCategory::Current)
        .expect("registry")
        .expect("current");
    let discharge = lists
        .list("p1", ListCategory::Discharge)
        .expect("registry")
        .expect("discharge");
    assert!(!current.contains_live("rx-amox"));
    assert!(discharge.contains_live("rx-amox"));
    assert!(discharge
        .live_entries()
        .any(|entry| entry.order_id == "rx-amox" && entry.status == OrderStatus::OnHold));

    let again = engine
        .discontinue("rx-amox", DiscontinueRequest::tapered(ReasonCode::Ineffective))
        .await
        .expect("taper again");
    assert_eq!(again.record.effect, DiscontinuationEffect::NoOp);

    let stopped = engine
        .discontinue("rx-amox", DiscontinueRequest::immediate(ReasonCode::Ineffective))
        .await
        .expect("stop after taper");
    assert_eq!(stopped.updated_order.status, OrderStatus::Stopped);
    assert_eq!(stopped.record.previous_status, OrderStatus::OnHold);
    assert_eq!(stopped.updated_order.notes.len(), 2);
}

#[tokio::test]
async fn tapering_steps_can_be_overridden() {
    let store = fixture_store();
    let config = MedRecConfig {
        tapering_interval_days: 3,
        ..MedRecConfig::default()
    };
    let engine = engine_over(&store, config);
    let mut request = DiscontinueRequest::tapered(ReasonCode::PatientRequest).effective(march_first());
    request.tapering_steps = Some(1);

    let outcome = engine.discontinue("rx-warfarin", request).await.expect("taper");

    let plan = outcome.tapering_plan.expect("plan attached");
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].dose_fraction, 0.5);
    assert_eq!(plan.ends_at(3), Some(march_first() + Duration::days(3)));
}

#[tokio::test]
async fn missing_order_is_rejected_without_writes() {
    let store = fixture_store();
    let engine = engine_over(&store, MedRecConfig::default());

    let err = engine
        .discontinue("rx-ghost", DiscontinueRequest::immediate(ReasonCode::Other))
        .await
        .expect_err("unknown order");

    assert_eq!(err, MedRecError::not_found("MedicationRequest", "rx-ghost"));
    assert_eq!(store.write_count(), 0);
    assert!(engine
        .discontinuation()
        .history("rx-ghost")
        .expect("history")
        .is_empty());
}

#[tokio::test]
async fn drafts_are_cancelled_and_cannot_taper() {
    let store = fixture_store();
    store
        .insert(json!({
            "resourceType": "MedicationRequest",
            "id": "rx-draft",
            "status": "draft",
            "subject": {"reference": "Patient/p1"},
            "medicationCodeableConcept": {"text": "Naproxen 250 MG Oral Tablet"}
        }))
        .expect("insert draft");
    let engine = engine_over(&store, MedRecConfig::default());

    let err = engine
        .discontinue("rx-draft", DiscontinueRequest::tapered(ReasonCode::Duplicate))
        .await
        .expect_err("drafts are never tapered");
    assert_eq!(
        err,
        MedRecError::InvalidTransition {
            from: OrderStatus::Draft,
            to: OrderStatus::OnHold
        }
    );
    assert_eq!(store.write_count(), 0);

    let outcome = engine
        .discontinue("rx-draft", DiscontinueRequest::immediate(ReasonCode::Duplicate))
        .await
        .expect("cancel draft");
    assert_eq!(outcome.updated_order.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn earlier_notes_are_preserved() {
    let store = fixture_store();
    let engine = engine_over(&store, MedRecConfig::default());

    engine
        .discontinue("rx-warfarin", DiscontinueRequest::tapered(ReasonCode::Substitution))
        .await
        .expect("taper");
    let stopped = engine
        .discontinue("rx-warfarin", DiscontinueRequest::immediate(ReasonCode::Substitution))
        .await
        .expect("stop");

    let notes = &stopped.updated_order.notes;
    assert_eq!(notes.len(), 2);
    assert!(notes[0].text.starts_with("Tapering started"));
    assert!(notes[1].text.starts_with("Discontinued"));
}

#[tokio::test]
async fn subscribers_see_current_list_removal() {
    let store = fixture_store();
    let engine = engine_over(&store, MedRecConfig::default());
    engine.reconcile_patient("p1").await.expect("reconcile");
    let mut changes = engine.subscribe();

    engine
        .discontinue("rx-warfarin", DiscontinueRequest::immediate(ReasonCode::AdverseReaction))
        .await
        .expect("discontinue");

    let mut received = Vec::new();
    while let Ok(change) = changes.try_recv() {
        received.push(change);
    }
    assert!(received.iter().any(|change| {
        change.category == ListCategory::Current
            && change.kind == ChangeKind::Removed
            && change.order_ids == vec!["rx-warfarin".to_string()]
    }));
    assert!(received
        .iter()
        .all(|change| change.category != ListCategory::Home));
}

#[tokio::test]
async fn concurrent_requests_apply_once_and_release_their_lock() {
    let store = fixture_store();
    let engine = engine_over(&store, MedRecConfig::default());
    let request = DiscontinueRequest::immediate(ReasonCode::AdverseReaction);

    let (left, right) = tokio::join!(
        engine.discontinue("rx-warfarin", request.clone()),
        engine.discontinue("rx-warfarin", request),
    );

    let effects = [
        left.expect("left").record.effect,
        right.expect("right").record.effect,
    ];
    assert_eq!(
        effects
            .iter()
            .filter(|effect| **effect == DiscontinuationEffect::Applied)
            .count(),
        1
    );
    assert_eq!(store.write_count(), 1);
    assert_eq!(engine.discontinuation().tracked_locks(), 0);
}
