mod common;

use std::sync::Arc;

use medrec_core::{
    AllergyCriticality, AllergyRecord, FindingKind, MedRecError, MedicationDescriptor,
    PatientContext, RiskLevel, SafetyOptions, Severity,
};
use medrec_fhir::{DrugKnowledge, MedicationResolver, ResolutionCache, SafetyChecker};

use common::fixture_store;

fn checker() -> SafetyChecker {
    SafetyChecker::new(DrugKnowledge::builtin())
}

#[test]
fn warfarin_with_aspirin_is_a_moderate_interaction() {
    let checker = checker();
    let knowledge = checker.knowledge();
    let mut context = PatientContext::new("p1");
    context
        .current_medications
        .push(knowledge.medication_named("Warfarin"));
    let candidates = vec![knowledge.medication_named("Aspirin")];

    let report = checker
        .check_safety(&candidates, &context, &SafetyOptions::default())
        .expect("check");

    let interactions: Vec<_> = report.findings_of(FindingKind::Interaction).collect();
    assert_eq!(interactions.len(), 1);
    assert_eq!(interactions[0].severity, Severity::Moderate);
    assert!(interactions[0].medications.contains(&"Warfarin".to_string()));
    assert!(interactions[0].medications.contains(&"Aspirin".to_string()));
    assert!(SafetyChecker::is_safe_to_proceed(&report));
    assert_eq!(SafetyChecker::severity_level(&report), RiskLevel::Moderate);
}

#[test]
fn class_trigger_flags_interaction() {
    let checker = checker();
    let knowledge = checker.knowledge();
    let mut context = PatientContext::new("p1");
    context
        .current_medications
        .push(knowledge.medication_named("Coumadin 5 MG Oral Tablet"));
    let candidates = vec![knowledge.medication_named("Ibuprofen 400 MG Oral Tablet")];

    let report = checker
        .check_safety(&candidates, &context, &SafetyOptions::default())
        .expect("check");

    let finding = report
        .findings_of(FindingKind::Interaction)
        .next()
        .expect("nsaid and anticoagulant interact");
    assert_eq!(finding.severity, Severity::High);
    assert!(!finding.hard_stop);
}

#[test]
fn contraindicated_interaction_blocks() {
    let checker = checker();
    let knowledge = checker.knowledge();
    let candidates = vec![
        knowledge.medication_named("Simvastatin 20 MG"),
        knowledge.medication_named("Clarithromycin 500 MG"),
    ];

    let report = checker
        .check_safety(&candidates, &PatientContext::new("p1"), &SafetyOptions::default())
        .expect("check");

    assert!(!report.is_safe_to_proceed());
    assert_eq!(report.severity_level(), RiskLevel::Critical);
}

#[test]
fn direct_allergy_match_is_a_hard_stop() {
    let checker = checker();
    let candidates = vec![checker.knowledge().medication_named("Amoxil 500 MG Capsule")];
    let mut context = PatientContext::new("p1");
    context.allergies.push(AllergyRecord::active(
        "Amoxicillin",
        Some(AllergyCriticality::High),
    ));
    let options = SafetyOptions {
        bypass_cache: true,
        ..SafetyOptions::default()
    };

    let report = checker.check_safety(&candidates, &context, &options).expect("check");
    assert!(!report.is_safe_to_proceed());
    let allergy = report
        .findings_of(FindingKind::Allergy)
        .next()
        .expect("allergy finding");
    assert_eq!(allergy.severity, Severity::Critical);

    context.allergies.clear();
    let report = checker.check_safety(&candidates, &context, &options).expect("check");
    assert!(report.is_safe_to_proceed());
}

#[test]
fn class_allergy_is_cross_reactivity_only() {
    let checker = checker();
    let candidates = vec![checker.knowledge().medication_named("Amoxicillin 500 MG")];
    let mut context = PatientContext::new("p1");
    context
        .allergies
        .push(AllergyRecord::active("Penicillin", Some(AllergyCriticality::Low)));

    let report = checker
        .check_safety(&candidates, &context, &SafetyOptions::default())
        .expect("check");

    let finding = report
        .findings_of(FindingKind::Allergy)
        .next()
        .expect("cross-reactivity finding");
    assert!(!finding.hard_stop);
    assert_eq!(finding.severity, Severity::Moderate);
    assert!(report.is_safe_to_proceed());
}

#[test]
fn inactive_allergies_are_ignored() {
    let checker = checker();
    let candidates = vec![checker.knowledge().medication_named("Aspirin")];
    let mut context = PatientContext::new("p1");
    let mut refuted = AllergyRecord::active("Aspirin", Some(AllergyCriticality::High));
    refuted.active = false;
    context.allergies.push(refuted);

    let report = checker
        .check_safety(&candidates, &context, &SafetyOptions::default())
        .expect("check");
    assert!(report.findings.is_empty());
}

#[test]
fn contraindications_follow_conditions() {
    let checker = checker();
    let knowledge = checker.knowledge();
    let mut context = PatientContext::new("p1");
    context.conditions.push("Chronic renal failure".into());
    context.conditions.push("Peptic ulcer disease".into());

    let report = checker
        .check_safety(
            &[knowledge.medication_named("Metformin 500 MG")],
            &context,
            &SafetyOptions::default(),
        )
        .expect("check");
    assert!(!report.is_safe_to_proceed());

    let report = checker
        .check_safety(
            &[knowledge.medication_named("Aspirin 81 MG")],
            &context,
            &SafetyOptions::default(),
        )
        .expect("check");
    let finding = report
        .findings_of(FindingKind::Contraindication)
        .next()
        .expect("relative contraindication");
    assert_eq!(finding.severity, Severity::High);
    assert!(report.is_safe_to_proceed());
}

#[test]
fn duplicate_ingredient_is_flagged() {
    let checker = checker();
    let knowledge = checker.knowledge();
    let mut context = PatientContext::new("p1");
    context
        .current_medications
        .push(knowledge.medication_named("Warfarin 5 MG"));

    let report = checker
        .check_safety(
            &[knowledge.medication_named("Jantoven 2 MG")],
            &context,
            &SafetyOptions::default(),
        )
        .expect("check");

    assert_eq!(report.findings_of(FindingKind::Dosage).count(), 1);
}

#[test]
fn unknown_medication_without_data_is_safe() {
    let checker = checker();
    let report = checker
        .check_safety(
            &[checker.knowledge().medication_named("Unobtainium")],
            &PatientContext::new("p1"),
            &SafetyOptions::default(),
        )
        .expect("check");

    assert!(report.findings.is_empty());
    assert!(report.is_safe_to_proceed());
    assert_eq!(report.severity_level(), RiskLevel::None);
}

#[test]
fn reports_are_cached_until_cleared() {
    let checker = checker();
    let candidates = vec![checker.knowledge().medication_named("Aspirin")];
    let context = PatientContext::new("p1");
    let options = SafetyOptions::default();

    let first = checker.check_safety(&candidates, &context, &options).expect("check");
    let second = checker.check_safety(&candidates, &context, &options).expect("check");
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(checker.cached_reports(), 1);

    let bypass = SafetyOptions {
        bypass_cache: true,
        ..SafetyOptions::default()
    };
    assert!(!checker.check_safety(&candidates, &context, &bypass).expect("check").from_cache);

    checker.clear_cache().expect("clear");
    assert_eq!(checker.cached_reports(), 0);
    assert!(!checker.check_safety(&candidates, &context, &options).expect("check").from_cache);
}

#[test]
fn disabled_cache_never_serves_reports() {
    let checker = checker().with_cache(false);
    let candidates = vec![checker.knowledge().medication_named("Aspirin")];
    let context = PatientContext::new("p1");

    checker
        .check_safety(&candidates, &context, &SafetyOptions::default())
        .expect("check");
    let again = checker
        .check_safety(&candidates, &context, &SafetyOptions::default())
        .expect("check");
    assert!(!again.from_cache);
    assert_eq!(checker.cached_reports(), 0);
}

#[tokio::test]
async fn patient_check_loads_context_from_store() {
    let store = fixture_store();
    let resolver = MedicationResolver::new(store.clone(), Arc::new(ResolutionCache::new()));
    let checker = checker();
    let candidate = MedicationDescriptor::named("Aspirin 81 MG Oral Tablet", "candidate");

    let report = checker
        .check_for_patient(
            &*store,
            &resolver,
            "p1",
            &[candidate],
            &SafetyOptions::default(),
        )
        .await
        .expect("check");

    let interaction = report
        .findings_of(FindingKind::Interaction)
        .next()
        .expect("current warfarin order interacts with aspirin");
    assert!(interaction.text.contains("Warfarin"));
    assert!(report.is_safe_to_proceed());
}

#[tokio::test]
async fn patient_check_rejects_unknown_patient() {
    let store = fixture_store();
    let resolver = MedicationResolver::new(store.clone(), Arc::new(ResolutionCache::new()));

    let err = checker()
        .check_for_patient(&*store, &resolver, "nobody", &[], &SafetyOptions::default())
        .await
        .expect_err("unknown patient");

    assert_eq!(err, MedRecError::not_found("Patient", "nobody"));
}

#[test]
fn newly_recorded_allergy_is_not_hidden_by_cache() {
    let checker = checker();
    let candidates = vec![checker.knowledge().medication_named("Amoxicillin 500 MG")];
    let mut context = PatientContext::new("p1");
    let options = SafetyOptions::default();

    let before = checker.check_safety(&candidates, &context, &options).expect("check");
    assert!(before.is_safe_to_proceed());

    context.allergies.push(AllergyRecord::active(
        "Amoxicillin",
        Some(AllergyCriticality::High),
    ));
    let after = checker.check_safety(&candidates, &context, &options).expect("check");
    assert!(!after.from_cache);
    assert!(!after.is_safe_to_proceed());

    context.allergies.clear();
    context.conditions.push("Chronic renal failure".into());
    let with_condition = checker.check_safety(&candidates, &context, &options).expect("check");
    assert!(!with_condition.from_cache);
    assert_eq!(checker.cached_reports(), 3);
}
