use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::order::{OrderStatus, SourceType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum ListCategory {
    Current,
    Home,
    Discharge,
    ReconciliationAudit,
}

impl ListCategory {
    pub const ALL: [ListCategory; 4] = [
        ListCategory::Current,
        ListCategory::Home,
        ListCategory::Discharge,
        ListCategory::ReconciliationAudit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ListCategory::Current => "current",
            ListCategory::Home => "home",
            ListCategory::Discharge => "discharge",
            ListCategory::ReconciliationAudit => "reconciliation-audit",
        }
    }

    /// Lists that keep history: entries are never dropped on status changes.
    pub fn is_historical(self) -> bool {
        !matches!(self, ListCategory::Current)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provenance {
    pub source: SourceType,
    pub deleted: bool,
    pub review_needed: bool,
}

impl Provenance {
    pub fn from_source(source: SourceType) -> Self {
        Self {
            source,
            deleted: false,
            review_needed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListEntry {
    pub order_id: String,
    pub identity: String,
    pub display: String,
    pub status: OrderStatus,
    pub provenance: Provenance,
    pub note: Option<String>,
}

impl ListEntry {
    pub fn is_live(&self) -> bool {
        !self.provenance.deleted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationList {
    pub patient_id: String,
    pub category: ListCategory,
    pub entries: Vec<ListEntry>,
    pub updated_at: DateTime<Utc>,
}

impl ReconciliationList {
    pub fn new(patient_id: impl Into<String>, category: ListCategory) -> Self {
        Self {
            patient_id: patient_id.into(),
            category,
            entries: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn live_entries(&self) -> impl Iterator<Item = &ListEntry> {
        self.entries.iter().filter(|entry| entry.is_live())
    }

    pub fn contains_live(&self, order_id: &str) -> bool {
        self.live_entries().any(|entry| entry.order_id == order_id)
    }

    pub fn statistics(&self) -> ListStatistics {
        let mut stats = ListStatistics {
            category: self.category,
            total: 0,
            active: 0,
            conflicts: 0,
        };
        for entry in self.live_entries() {
            stats.total += 1;
            if entry.status.is_active() {
                stats.active += 1;
            }
            if entry.provenance.source == SourceType::Reconciliation {
                stats.conflicts += 1;
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListStatistics {
    pub category: ListCategory,
    pub total: usize,
    pub active: usize,
    /// Synthesized discrepancy records; only the audit list has any.
    pub conflicts: usize,
}

/// Records sharing one identity whose sources disagree about whether it is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictGroup {
    pub identity: String,
    pub display: String,
    pub active_sources: Vec<SourceType>,
    pub inactive_sources: Vec<SourceType>,
    pub order_ids: Vec<String>,
}

impl ConflictGroup {
    pub fn summary(&self) -> String {
        let describe = |sources: &[SourceType]| {
            sources
                .iter()
                .map(|source| format!("{source:?}").to_lowercase())
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "{} is active per {} but inactive per {}",
            self.display,
            describe(&self.active_sources),
            describe(&self.inactive_sources)
        )
    }
}
