//! Per-patient category lists with push notifications on change.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockWriteGuard};

use chrono::Utc;
use medrec_core::{
    ListCategory, ListEntry, MedRecError, OrderStatus, ReconciliationList, SourceType,
};
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Updated,
}

/// Sent to subscribers whenever a list's entries change.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListChange {
    pub patient_id: String,
    pub category: ListCategory,
    pub kind: ChangeKind,
    pub order_ids: Vec<String>,
}

type PatientLists = HashMap<ListCategory, ReconciliationList>;

pub struct ListRegistry {
    lists: RwLock<HashMap<String, PatientLists>>,
    notifier: broadcast::Sender<ListChange>,
}

impl Default for ListRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListRegistry {
    pub fn new() -> Self {
        let (notifier, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            lists: RwLock::new(HashMap::new()),
            notifier,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListChange> {
        self.notifier.subscribe()
    }

    pub fn list(
        &self,
        patient_id: &str,
        category: ListCategory,
    ) -> Result<Option<ReconciliationList>, MedRecError> {
        let lists = self.lists.read().map_err(|_| MedRecError::LockPoisoned)?;
        Ok(lists
            .get(patient_id)
            .and_then(|patient| patient.get(&category))
            .cloned())
    }

    /// All lists held for a patient, in category order.
    pub fn lists_for(&self, patient_id: &str) -> Result<Vec<ReconciliationList>, MedRecError> {
        let lists = self.lists.read().map_err(|_| MedRecError::LockPoisoned)?;
        let mut found: Vec<ReconciliationList> = lists
            .get(patient_id)
            .map(|patient| patient.values().cloned().collect())
            .unwrap_or_default();
        found.sort_by_key(|list| list.category);
        Ok(found)
    }

    /// Adds or refreshes an entry. The current list keeps one live entry per order.
    pub fn add_entry(
        &self,
        patient_id: &str,
        category: ListCategory,
        entry: ListEntry,
    ) -> Result<bool, MedRecError> {
        let order_id = entry.order_id.clone();
        let changed = {
            let mut lists = self.write()?;
            let list = list_mut(&mut lists, patient_id, category);
            let changed = upsert(list, entry);
            if changed {
                list.updated_at = Utc::now();
            }
            changed
        };
        if changed {
            self.notify(patient_id, category, ChangeKind::Added, vec![order_id]);
        }
        Ok(changed)
    }

    /// Soft-removes the order's live entries by setting their deleted flag.
    pub fn remove_entry(
        &self,
        patient_id: &str,
        category: ListCategory,
        order_id: &str,
    ) -> Result<bool, MedRecError> {
        let changed = {
            let mut lists = self.write()?;
            let Some(list) = lists
                .get_mut(patient_id)
                .and_then(|patient| patient.get_mut(&category))
            else {
                return Ok(false);
            };
            let mut changed = false;
            for entry in list
                .entries
                .iter_mut()
                .filter(|entry| entry.order_id == order_id && entry.is_live())
            {
                entry.provenance.deleted = true;
                changed = true;
            }
            if changed {
                list.updated_at = Utc::now();
            }
            changed
        };
        if changed {
            self.notify(
                patient_id,
                category,
                ChangeKind::Removed,
                vec![order_id.to_string()],
            );
        }
        Ok(changed)
    }

    /// Merges freshly computed entries into a list.
    ///
    /// For the current list, live entries missing from `entries` are removed.
    /// Historical lists keep their record entries and drop only discrepancy
    /// entries whose conflict is gone.
    pub fn merge_list(
        &self,
        patient_id: &str,
        category: ListCategory,
        entries: Vec<ListEntry>,
    ) -> Result<bool, MedRecError> {
        let mut touched = Vec::new();
        let changed = {
            let mut lists = self.write()?;
            let list = list_mut(&mut lists, patient_id, category);
            let before = list.entries.clone();

            let historical = category.is_historical();
            for existing in list.entries.iter_mut().filter(|e| e.is_live()) {
                // Historical lists only retire synthesized discrepancy entries.
                if historical && existing.provenance.source != SourceType::Reconciliation {
                    continue;
                }
                if !entries.iter().any(|fresh| fresh.order_id == existing.order_id) {
                    existing.provenance.deleted = true;
                    touched.push(existing.order_id.clone());
                }
            }
            for entry in entries {
                let order_id = entry.order_id.clone();
                if upsert(list, entry) {
                    touched.push(order_id);
                }
            }

            let changed = list.entries != before;
            if changed {
                list.updated_at = Utc::now();
            }
            changed
        };
        if changed {
            self.notify(patient_id, category, ChangeKind::Updated, touched);
        }
        Ok(changed)
    }

    /// Applies a status change: on-hold and terminal orders leave the current
    /// list, historical lists only record the new status.
    pub fn on_status_change(
        &self,
        patient_id: &str,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<(), MedRecError> {
        let mut updated = Vec::new();
        {
            let mut lists = self.write()?;
            if let Some(patient) = lists.get_mut(patient_id) {
                for list in patient.values_mut() {
                    let mut touched = false;
                    for entry in list
                        .entries
                        .iter_mut()
                        .filter(|entry| entry.order_id == order_id && entry.status != status)
                    {
                        entry.status = status;
                        touched = true;
                    }
                    if touched {
                        list.updated_at = Utc::now();
                        updated.push(list.category);
                    }
                }
            }
        }
        for category in updated {
            self.notify(
                patient_id,
                category,
                ChangeKind::Updated,
                vec![order_id.to_string()],
            );
        }

        if status == OrderStatus::OnHold || status.is_terminal() {
            self.remove_entry(patient_id, ListCategory::Current, order_id)?;
        }
        Ok(())
    }

    pub fn clear_patient(&self, patient_id: &str) -> Result<(), MedRecError> {
        self.write()?.remove(patient_id);
        Ok(())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, PatientLists>>, MedRecError> {
        self.lists.write().map_err(|_| MedRecError::LockPoisoned)
    }

    fn notify(
        &self,
        patient_id: &str,
        category: ListCategory,
        kind: ChangeKind,
        order_ids: Vec<String>,
    ) {
        let change = ListChange {
            patient_id: patient_id.to_string(),
            category,
            kind,
            order_ids,
        };
        // No subscribers is not an error.
        let _ = self.notifier.send(change);
    }
}

fn list_mut<'a>(
    lists: &'a mut HashMap<String, PatientLists>,
    patient_id: &str,
    category: ListCategory,
) -> &'a mut ReconciliationList {
    lists
        .entry(patient_id.to_string())
        .or_default()
        .entry(category)
        .or_insert_with(|| ReconciliationList::new(patient_id, category))
}

/// Inserts or replaces the entry for the same order (and source, on
/// historical lists). Returns whether anything changed.
fn upsert(list: &mut ReconciliationList, entry: ListEntry) -> bool {
    let historical = list.category.is_historical();
    let existing = list.entries.iter_mut().find(|current| {
        current.order_id == entry.order_id
            && (!historical || current.provenance.source == entry.provenance.source)
    });
    match existing {
        Some(current) if *current == entry => false,
        Some(current) => {
            *current = entry;
            true
        }
        None => {
            list.entries.push(entry);
            true
        }
    }
}
