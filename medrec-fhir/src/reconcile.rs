//! Merges orders, patient statements and dispenses into categorized lists.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use medrec_core::{
    name_key, ConflictGroup, ListCategory, ListEntry, ListStatistics, MedRecConfig, MedRecError,
    MedicationOrder, OrderStatus, Provenance, ReconciliationList, SafetyMedication, SafetyOptions,
    SafetyReport, SourceType,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::lists::ListRegistry;
use crate::record::{enrich_from_includes, parse_record};
use crate::resolver::{MedicationResolver, Resolution, ResolutionIssue};
use crate::safety::SafetyChecker;
use crate::store::ResourceStore;

/// Marker text of the review note written onto conflicting orders.
pub const REVIEW_NOTE: &str = "Reconciliation review needed";

/// The three record collections for one patient.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceLists {
    pub orders: Vec<MedicationOrder>,
    pub statements: Vec<MedicationOrder>,
    pub dispenses: Vec<MedicationOrder>,
}

impl SourceLists {
    /// Sorts records into buckets by their source.
    pub fn from_records(records: impl IntoIterator<Item = MedicationOrder>) -> Self {
        let mut sources = Self::default();
        for record in records {
            match record.source {
                SourceType::Order => sources.orders.push(record),
                SourceType::Statement => sources.statements.push(record),
                SourceType::Dispense => sources.dispenses.push(record),
                SourceType::Reconciliation => {}
            }
        }
        sources
    }

    pub fn iter(&self) -> impl Iterator<Item = &MedicationOrder> {
        self.orders
            .iter()
            .chain(self.statements.iter())
            .chain(self.dispenses.iter())
    }

    pub fn all(&self) -> Vec<MedicationOrder> {
        self.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.orders.len() + self.statements.len() + self.dispenses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReconciliationResult {
    pub patient_id: String,
    pub lists: Vec<ReconciliationList>,
    pub conflicts: Vec<ConflictGroup>,
    pub statistics: Vec<ListStatistics>,
    /// Records seen but kept off every list (cancelled or entered in error).
    pub excluded: usize,
    #[serde(skip)]
    pub issues: Vec<ResolutionIssue>,
    pub safety: Option<SafetyReport>,
    /// Orders that received a review note during this run.
    pub annotated: Vec<String>,
}

impl ReconciliationResult {
    pub fn list(&self, category: ListCategory) -> Option<&ReconciliationList> {
        self.lists.iter().find(|list| list.category == category)
    }

    pub fn statistics_for(&self, category: ListCategory) -> Option<&ListStatistics> {
        self.statistics.iter().find(|stats| stats.category == category)
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

struct Group<'a> {
    display: String,
    records: Vec<&'a MedicationOrder>,
}

pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    resolver: Arc<MedicationResolver>,
    safety: Arc<SafetyChecker>,
    lists: Arc<ListRegistry>,
    config: MedRecConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        resolver: Arc<MedicationResolver>,
        safety: Arc<SafetyChecker>,
        lists: Arc<ListRegistry>,
        config: MedRecConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            safety,
            lists,
            config,
        }
    }

    /// Groups records by identity, flags conflicts and refreshes the
    /// patient's four lists in the registry.
    ///
    /// Running it again over the same inputs leaves every list unchanged.
    pub fn reconcile(
        &self,
        patient_id: &str,
        sources: &SourceLists,
        resolution: &Resolution,
    ) -> Result<ReconciliationResult, MedRecError> {
        let mut groups: BTreeMap<String, Group<'_>> = BTreeMap::new();
        for record in sources.iter() {
            let identity = resolution.identity_key(record);
            groups
                .entry(identity)
                .or_insert_with(|| Group {
                    display: resolution.display_name(record),
                    records: Vec::new(),
                })
                .records
                .push(record);
        }
        fold_uncoded_groups(&mut groups, resolution);

        let conflicts: Vec<ConflictGroup> = groups
            .iter()
            .filter_map(|(identity, group)| find_conflict(identity, group))
            .collect();
        let conflicting = |identity: &str| conflicts.iter().any(|c| c.identity == identity);

        let mut current = Vec::new();
        let mut home = Vec::new();
        let mut discharge = Vec::new();
        let mut audit = Vec::new();
        let mut excluded = 0;

        for (identity, group) in &groups {
            let review = conflicting(identity);
            for record in &group.records {
                let entry = list_entry(record, identity, &group.display, review);
                if review {
                    audit.push(entry.clone());
                }
                if excluded_from_lists(record) {
                    excluded += 1;
                    continue;
                }
                match record.source {
                    SourceType::Order => {
                        if record.status.is_active() {
                            current.push(entry.clone());
                        }
                        if record.discharge {
                            discharge.push(entry);
                        }
                    }
                    SourceType::Statement => home.push(entry),
                    SourceType::Dispense | SourceType::Reconciliation => {}
                }
            }
        }
        audit.extend(conflicts.iter().map(discrepancy_entry));

        for (category, entries) in [
            (ListCategory::Current, current),
            (ListCategory::Home, home),
            (ListCategory::Discharge, discharge),
            (ListCategory::ReconciliationAudit, audit),
        ] {
            self.lists.merge_list(patient_id, category, entries)?;
        }

        let lists = self.lists.lists_for(patient_id)?;
        let statistics = lists.iter().map(ReconciliationList::statistics).collect();

        tracing::info!(
            patient = patient_id,
            records = sources.len(),
            identities = groups.len(),
            conflicts = conflicts.len(),
            excluded,
            "reconciliation complete"
        );

        Ok(ReconciliationResult {
            patient_id: patient_id.to_string(),
            lists,
            conflicts,
            statistics,
            excluded,
            issues: resolution.issues.clone(),
            safety: None,
            annotated: Vec::new(),
        })
    }

    /// Fetches, resolves and reconciles everything the store holds for a
    /// patient, then screens the current list for safety problems.
    pub async fn reconcile_patient(
        &self,
        patient_id: &str,
    ) -> Result<ReconciliationResult, MedRecError> {
        let mut issues = Vec::new();
        let mut records = Vec::new();
        for source in [SourceType::Order, SourceType::Statement, SourceType::Dispense] {
            let Some(resource_type) = source.resource_type() else {
                continue;
            };
            records.extend(self.fetch_records(resource_type, patient_id, &mut issues).await?);
        }
        let sources = SourceLists::from_records(records);

        let resolution = self.resolver.resolve(&sources.all()).await?;
        let mut result = self.reconcile(patient_id, &sources, &resolution)?;
        issues.extend(result.issues.drain(..));
        result.issues = issues;

        let current: Vec<SafetyMedication> = sources
            .orders
            .iter()
            .filter(|order| order.status.is_active())
            .map(|order| match resolution.get(&order.id) {
                Some(descriptor) => self.safety.knowledge().safety_medication(descriptor),
                None => self
                    .safety
                    .knowledge()
                    .medication_named(&resolution.display_name(order)),
            })
            .collect();
        match self
            .safety
            .load_context(self.store.as_ref(), &self.resolver, patient_id, false)
            .await
        {
            Ok(context) => {
                let options = SafetyOptions {
                    include_current: false,
                    ..SafetyOptions::default()
                };
                result.safety = Some(self.safety.check_safety(&current, &context, &options)?);
            }
            Err(MedRecError::NotFound { resource_type, .. }) if resource_type == "Patient" => {
                tracing::warn!(patient = patient_id, "patient record missing, safety screen skipped");
            }
            Err(err) => return Err(err),
        }

        if self.config.annotate_conflicts {
            result.annotated = self.annotate(&sources, &result.conflicts).await?;
        }

        Ok(result)
    }

    async fn fetch_records(
        &self,
        resource_type: &str,
        patient_id: &str,
        issues: &mut Vec<ResolutionIssue>,
    ) -> Result<Vec<MedicationOrder>, MedRecError> {
        let page = self
            .store
            .search(
                resource_type,
                &[("patient", patient_id), ("_include", "medication")],
            )
            .await?;

        let mut records = Vec::with_capacity(page.resources.len());
        for resource in &page.resources {
            match parse_record(resource) {
                Ok(record) => records.push(record),
                Err(error) => {
                    let order_id = resource
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or("<unknown>")
                        .to_string();
                    tracing::warn!(record = %order_id, error = %error, "skipping unreadable record");
                    issues.push(ResolutionIssue { order_id, error });
                }
            }
        }
        enrich_from_includes(&mut records, &page.included);
        Ok(records)
    }

    /// Appends a review note to each conflicting order that lacks one.
    async fn annotate(
        &self,
        sources: &SourceLists,
        conflicts: &[ConflictGroup],
    ) -> Result<Vec<String>, MedRecError> {
        let mut annotated = Vec::new();
        for conflict in conflicts {
            let orders = sources.orders.iter().filter(|order| {
                conflict.order_ids.contains(&order.id) && !order.has_note_containing(REVIEW_NOTE)
            });
            for order in orders {
                let mut resource = self.store.read("MedicationRequest", &order.id).await?;
                let text = format!("{REVIEW_NOTE}: {}", conflict.summary());
                let body = resource.as_object_mut().ok_or_else(|| {
                    MedRecError::ValidationFailed(format!("order {} is not a JSON object", order.id))
                })?;
                match body.get_mut("note").and_then(Value::as_array_mut) {
                    Some(notes) => notes.push(json!({"text": text})),
                    None => {
                        body.insert("note".into(), json!([{"text": text}]));
                    }
                }
                self.store
                    .update("MedicationRequest", &order.id, resource)
                    .await?;
                tracing::debug!(order = %order.id, identity = %conflict.identity, "review note added");
                annotated.push(order.id.clone());
            }
        }
        Ok(annotated)
    }
}

/// Moves each name-keyed group into the coded group whose records carry the
/// same display name, so a coded order and an uncoded statement of one drug
/// are reconciled together.
fn fold_uncoded_groups(groups: &mut BTreeMap<String, Group<'_>>, resolution: &Resolution) {
    let mut coded_by_name: HashMap<String, String> = HashMap::new();
    for (identity, group) in groups.iter() {
        if is_name_identity(identity) {
            continue;
        }
        for record in &group.records {
            coded_by_name
                .entry(name_key(&resolution.display_name(record)))
                .or_insert_with(|| identity.clone());
        }
    }

    let uncoded: Vec<String> = groups
        .keys()
        .filter(|identity| is_name_identity(identity) && coded_by_name.contains_key(*identity))
        .cloned()
        .collect();
    for identity in uncoded {
        let Some(target) = coded_by_name.get(&identity) else {
            continue;
        };
        if let Some(group) = groups.remove(&identity) {
            if let Some(coded) = groups.get_mut(target) {
                coded.records.extend(group.records);
            }
        }
    }
}

fn is_name_identity(identity: &str) -> bool {
    identity.starts_with("name:")
}

/// Conflict when one source calls the medication active and a different
/// source calls it stopped, completed or cancelled.
fn find_conflict(identity: &str, group: &Group<'_>) -> Option<ConflictGroup> {
    let mut active_sources = Vec::new();
    let mut inactive_sources = Vec::new();
    for record in &group.records {
        if record.status.is_active() {
            active_sources.push(record.source);
        } else if record.status.is_terminal() {
            inactive_sources.push(record.source);
        }
    }
    active_sources.sort();
    active_sources.dedup();
    inactive_sources.sort();
    inactive_sources.dedup();

    let disagree = active_sources
        .iter()
        .any(|active| inactive_sources.iter().any(|inactive| inactive != active));
    if !disagree {
        return None;
    }

    let mut order_ids: Vec<String> = group.records.iter().map(|r| r.id.clone()).collect();
    order_ids.sort();
    Some(ConflictGroup {
        identity: identity.to_string(),
        display: group.display.clone(),
        active_sources,
        inactive_sources,
        order_ids,
    })
}

fn excluded_from_lists(record: &MedicationOrder) -> bool {
    record.status == OrderStatus::Cancelled
}

fn list_entry(record: &MedicationOrder, identity: &str, display: &str, review: bool) -> ListEntry {
    ListEntry {
        order_id: record.id.clone(),
        identity: identity.to_string(),
        display: display.to_string(),
        status: record.status,
        provenance: Provenance {
            source: record.source,
            deleted: false,
            review_needed: review,
        },
        note: record.dosage_text.clone(),
    }
}

fn discrepancy_entry(conflict: &ConflictGroup) -> ListEntry {
    ListEntry {
        order_id: format!("discrepancy:{}", conflict.identity),
        identity: conflict.identity.clone(),
        display: conflict.display.clone(),
        status: OrderStatus::Unknown,
        provenance: Provenance {
            source: SourceType::Reconciliation,
            deleted: false,
            review_needed: true,
        },
        note: Some(conflict.summary()),
    }
}
