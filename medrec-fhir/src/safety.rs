//! Interaction, allergy, contraindication and duplicate-therapy screening.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use chrono::Utc;
use medrec_core::{
    AllergyCriticality, AllergyRecord, FindingKind, InteractionRule, InteractionSeverity,
    MedRecError, MedicationDescriptor, PatientContext, RiskLevel, SafetyFinding,
    SafetyMedication, SafetyOptions, SafetyReport, Severity,
};
use serde::Serialize;

use crate::knowledge::DrugKnowledge;
use crate::record::{parse_allergy, parse_condition, parse_record};
use crate::resolver::MedicationResolver;
use crate::store::ResourceStore;

/// Terms shorter than this never produce substring matches.
const MIN_MATCH_LEN: usize = 3;

pub struct SafetyChecker {
    knowledge: DrugKnowledge,
    cache: RwLock<HashMap<String, SafetyReport>>,
    cache_enabled: bool,
}

#[derive(Serialize)]
struct ReportKey<'a> {
    patient_id: &'a str,
    candidates: BTreeSet<String>,
    current: BTreeSet<String>,
    allergies: BTreeSet<String>,
    conditions: BTreeSet<String>,
    options: &'a SafetyOptions,
}

impl SafetyChecker {
    pub fn new(knowledge: DrugKnowledge) -> Self {
        Self {
            knowledge,
            cache: RwLock::new(HashMap::new()),
            cache_enabled: true,
        }
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn knowledge(&self) -> &DrugKnowledge {
        &self.knowledge
    }

    pub fn is_safe_to_proceed(report: &SafetyReport) -> bool {
        report.is_safe_to_proceed()
    }

    pub fn severity_level(report: &SafetyReport) -> RiskLevel {
        report.severity_level()
    }

    /// Screens `candidates` against each other and the patient context.
    pub fn check_safety(
        &self,
        candidates: &[SafetyMedication],
        context: &PatientContext,
        options: &SafetyOptions,
    ) -> Result<SafetyReport, MedRecError> {
        let use_cache = self.cache_enabled && !options.bypass_cache;
        let key = report_key(candidates, context, options)?;

        if use_cache {
            let cache = self.cache.read().map_err(|_| MedRecError::LockPoisoned)?;
            if let Some(report) = cache.get(&key) {
                tracing::debug!(patient = %context.patient_id, "safety report served from cache");
                let mut report = report.clone();
                report.from_cache = true;
                return Ok(report);
            }
        }

        let mut findings = Vec::new();
        if options.check_interactions {
            let mut pool: Vec<&SafetyMedication> = candidates.iter().collect();
            if options.include_current {
                pool.extend(context.current_medications.iter());
            }
            findings.extend(scan_interactions(&pool));
        }
        if options.check_allergies {
            findings.extend(scan_allergies(candidates, &context.allergies));
        }
        if options.check_contraindications {
            findings.extend(scan_contraindications(candidates, &context.conditions));
        }
        if options.check_duplicates {
            findings.extend(scan_duplicates(candidates, &context.current_medications));
        }
        findings.sort_by_key(|finding| finding.severity);

        let report = SafetyReport {
            patient_id: context.patient_id.clone(),
            findings,
            checked_at: Utc::now(),
            from_cache: false,
        };

        tracing::info!(
            patient = %context.patient_id,
            candidates = candidates.len(),
            findings = report.findings.len(),
            safe = report.is_safe_to_proceed(),
            "safety check complete"
        );

        if use_cache {
            self.cache
                .write()
                .map_err(|_| MedRecError::LockPoisoned)?
                .insert(key, report.clone());
        }

        Ok(report)
    }

    /// Drops every cached report. Call when the patient context changes.
    pub fn clear_cache(&self) -> Result<(), MedRecError> {
        self.cache
            .write()
            .map_err(|_| MedRecError::LockPoisoned)?
            .clear();
        Ok(())
    }

    pub fn cached_reports(&self) -> usize {
        self.cache.read().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Loads allergies, conditions and (optionally) current medications through the store.
    ///
    /// A missing patient is rejected with `NotFound`.
    pub async fn load_context(
        &self,
        store: &dyn ResourceStore,
        resolver: &MedicationResolver,
        patient_id: &str,
        include_current: bool,
    ) -> Result<PatientContext, MedRecError> {
        store.read("Patient", patient_id).await?;
        let mut context = PatientContext::new(patient_id);

        let allergies = store
            .search("AllergyIntolerance", &[("patient", patient_id)])
            .await?;
        context.allergies = allergies.resources.iter().filter_map(parse_allergy).collect();

        let conditions = store.search("Condition", &[("patient", patient_id)]).await?;
        context.conditions = conditions
            .resources
            .iter()
            .filter_map(parse_condition)
            .collect();

        if include_current {
            let page = store
                .search(
                    "MedicationRequest",
                    &[("patient", patient_id), ("status", "active")],
                )
                .await?;
            let orders: Vec<_> = page
                .resources
                .iter()
                .filter_map(|resource| match parse_record(resource) {
                    Ok(order) => Some(order),
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping unreadable medication record");
                        None
                    }
                })
                .collect();
            let resolution = resolver.resolve(&orders).await?;
            context.current_medications = orders
                .iter()
                .map(|order| match resolution.get(&order.id) {
                    Some(descriptor) => self.knowledge.safety_medication(descriptor),
                    None => self.knowledge.medication_named(&resolution.display_name(order)),
                })
                .collect();
        }

        Ok(context)
    }

    /// Loads the patient's context and screens resolved candidates against it.
    pub async fn check_for_patient(
        &self,
        store: &dyn ResourceStore,
        resolver: &MedicationResolver,
        patient_id: &str,
        candidates: &[MedicationDescriptor],
        options: &SafetyOptions,
    ) -> Result<SafetyReport, MedRecError> {
        let context = self
            .load_context(store, resolver, patient_id, options.include_current)
            .await?;
        let candidates: Vec<SafetyMedication> = candidates
            .iter()
            .map(|descriptor| self.knowledge.safety_medication(descriptor))
            .collect();
        self.check_safety(&candidates, &context, options)
    }
}

fn report_key(
    candidates: &[SafetyMedication],
    context: &PatientContext,
    options: &SafetyOptions,
) -> Result<String, MedRecError> {
    let names = |meds: &[SafetyMedication]| -> BTreeSet<String> {
        meds.iter().map(|med| med.name.to_lowercase()).collect()
    };
    let key = ReportKey {
        patient_id: &context.patient_id,
        candidates: names(candidates),
        current: names(&context.current_medications),
        allergies: context
            .allergies
            .iter()
            .filter(|allergy| allergy.active)
            .map(|allergy| {
                format!(
                    "{}|{:?}",
                    allergy.substance.trim().to_lowercase(),
                    allergy.criticality
                )
            })
            .collect(),
        conditions: context
            .conditions
            .iter()
            .map(|condition| condition.trim().to_lowercase())
            .collect(),
        options,
    };
    serde_json::to_string(&key).map_err(|err| MedRecError::Parse(err.to_string()))
}

fn match_terms(med: &SafetyMedication) -> Vec<String> {
    let mut terms = med.identity_terms();
    if let Some(class) = &med.drug_class {
        terms.push(class.to_lowercase());
    }
    terms
}

fn strongest_rule<'a>(
    rules: &'a [InteractionRule],
    other_terms: &[String],
) -> Option<&'a InteractionRule> {
    rules
        .iter()
        .filter(|rule| {
            let trigger = rule.trigger.trim().to_lowercase();
            trigger.len() >= MIN_MATCH_LEN && other_terms.iter().any(|term| term.contains(&trigger))
        })
        .max_by_key(|rule| rule.severity)
}

fn scan_interactions(pool: &[&SafetyMedication]) -> Vec<SafetyFinding> {
    let mut seen = HashSet::new();
    let meds: Vec<&SafetyMedication> = pool
        .iter()
        .copied()
        .filter(|med| seen.insert(med.name.trim().to_lowercase()))
        .collect();

    let mut findings = Vec::new();
    for (i, a) in meds.iter().enumerate() {
        let a_terms = match_terms(a);
        for b in meds.iter().skip(i + 1) {
            let b_terms = match_terms(b);
            let strongest = [
                strongest_rule(&a.interactions, &b_terms),
                strongest_rule(&b.interactions, &a_terms),
            ]
            .into_iter()
            .flatten()
            .max_by_key(|rule| rule.severity);

            let Some(rule) = strongest else {
                continue;
            };

            let mut text = format!(
                "{} + {}: {} interaction",
                a.name, b.name, rule.severity
            );
            if let Some(description) = &rule.description {
                text.push_str(&format!(" ({description})"));
            }

            findings.push(SafetyFinding {
                kind: FindingKind::Interaction,
                severity: rule.severity.severity(),
                text,
                medications: vec![a.name.clone(), b.name.clone()],
                hard_stop: rule.severity == InteractionSeverity::Contraindicated,
            });
        }
    }
    findings
}

fn terms_overlap(term: &str, substance: &str) -> bool {
    term.len() >= MIN_MATCH_LEN
        && substance.len() >= MIN_MATCH_LEN
        && (term.contains(substance) || substance.contains(term))
}

fn scan_allergies(candidates: &[SafetyMedication], allergies: &[AllergyRecord]) -> Vec<SafetyFinding> {
    let mut findings = Vec::new();
    for candidate in candidates {
        let identity = candidate.identity_terms();
        let class = candidate.drug_class.as_deref().map(str::to_lowercase);

        for allergy in allergies.iter().filter(|allergy| allergy.active) {
            let substance = allergy.substance.trim().to_lowercase();
            let high = allergy.criticality == Some(AllergyCriticality::High);
            let reaction = allergy
                .reaction
                .as_deref()
                .map(|reaction| format!(" Reaction: {reaction}."))
                .unwrap_or_default();

            if identity.iter().any(|term| terms_overlap(term, &substance)) {
                findings.push(SafetyFinding {
                    kind: FindingKind::Allergy,
                    severity: if high { Severity::Critical } else { Severity::High },
                    text: format!(
                        "{} matches documented allergy to {}.{reaction}",
                        candidate.name, allergy.substance
                    ),
                    medications: vec![candidate.name.clone()],
                    hard_stop: true,
                });
            } else if class
                .as_deref()
                .is_some_and(|class| terms_overlap(class, &substance))
            {
                findings.push(SafetyFinding {
                    kind: FindingKind::Allergy,
                    severity: if high { Severity::High } else { Severity::Moderate },
                    text: format!(
                        "{} belongs to a class related to documented allergy to {}.{reaction}",
                        candidate.name, allergy.substance
                    ),
                    medications: vec![candidate.name.clone()],
                    hard_stop: false,
                });
            }
        }
    }
    findings
}

fn scan_contraindications(candidates: &[SafetyMedication], conditions: &[String]) -> Vec<SafetyFinding> {
    let mut findings = Vec::new();
    for candidate in candidates {
        for contraindication in &candidate.contraindications {
            let needle = contraindication.condition.trim().to_lowercase();
            if needle.len() < MIN_MATCH_LEN {
                continue;
            }
            let Some(condition) = conditions
                .iter()
                .find(|condition| condition.to_lowercase().contains(&needle))
            else {
                continue;
            };
            let (severity, label) = if contraindication.absolute {
                (Severity::Critical, "absolute")
            } else {
                (Severity::High, "relative")
            };
            findings.push(SafetyFinding {
                kind: FindingKind::Contraindication,
                severity,
                text: format!("{} has a {label} contraindication: {condition}.", candidate.name),
                medications: vec![candidate.name.clone()],
                hard_stop: contraindication.absolute,
            });
        }
    }
    findings
}

fn scan_duplicates(candidates: &[SafetyMedication], current: &[SafetyMedication]) -> Vec<SafetyFinding> {
    let mut findings = Vec::new();
    let mut seen: HashMap<String, &SafetyMedication> = current
        .iter()
        .map(|med| (med.ingredient_key(), med))
        .collect();

    for candidate in candidates {
        let key = candidate.ingredient_key();
        if key.is_empty() {
            continue;
        }
        match seen.get(&key) {
            Some(existing) => findings.push(SafetyFinding {
                kind: FindingKind::Dosage,
                severity: Severity::Moderate,
                text: format!(
                    "{} duplicates {} ({key}); combined dose may exceed intent.",
                    candidate.name, existing.name
                ),
                medications: vec![candidate.name.clone(), existing.name.clone()],
                hard_stop: false,
            }),
            None => {
                seen.insert(key, candidate);
            }
        }
    }
    findings
}
