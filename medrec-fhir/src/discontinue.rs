//! Discontinuation state machine for medication orders.
//!
//! `immediate` stops an order, `tapered` puts it on hold with a dose-reduction
//! plan. Repeating a discontinuation on an already discontinued order succeeds
//! with a zero-effect record and writes nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use medrec_core::{
    DiscontinuationEffect, DiscontinuationKind, DiscontinuationRecord, MedRecConfig,
    MedRecError, MedicationOrder, OrderStatus, ReasonCode, TaperingPlan,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::lists::ListRegistry;
use crate::record::parse_record;
use crate::store::ResourceStore;

const REASON_SYSTEM: &str = "urn:medrec:discontinuation-reason";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscontinueRequest {
    pub kind: DiscontinuationKind,
    pub reason: ReasonCode,
    pub reason_text: Option<String>,
    /// Defaults to now.
    pub effective_at: Option<DateTime<Utc>>,
    /// Overrides the configured step count for tapered requests.
    pub tapering_steps: Option<u32>,
}

impl DiscontinueRequest {
    pub fn immediate(reason: ReasonCode) -> Self {
        Self {
            kind: DiscontinuationKind::Immediate,
            reason,
            reason_text: None,
            effective_at: None,
            tapering_steps: None,
        }
    }

    pub fn tapered(reason: ReasonCode) -> Self {
        Self {
            kind: DiscontinuationKind::Tapered,
            ..Self::immediate(reason)
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.reason_text = Some(text.into());
        self
    }

    pub fn effective(mut self, at: DateTime<Utc>) -> Self {
        self.effective_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscontinueOutcome {
    pub updated_order: MedicationOrder,
    pub record: DiscontinuationRecord,
    pub tapering_plan: Option<TaperingPlan>,
}

pub struct DiscontinuationService {
    store: Arc<dyn ResourceStore>,
    lists: Arc<ListRegistry>,
    config: MedRecConfig,
    audit: RwLock<Vec<DiscontinuationRecord>>,
    order_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DiscontinuationService {
    pub fn new(store: Arc<dyn ResourceStore>, lists: Arc<ListRegistry>, config: MedRecConfig) -> Self {
        Self {
            store,
            lists,
            config,
            audit: RwLock::new(Vec::new()),
            order_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn discontinue(
        &self,
        order_id: &str,
        request: DiscontinueRequest,
    ) -> Result<DiscontinueOutcome, MedRecError> {
        // Serialize read-modify-write per order so concurrent retries see each other.
        let lock = self.order_lock(order_id)?;
        let outcome = {
            let _guard = lock.lock().await;
            self.discontinue_locked(order_id, request).await
        };
        self.release_lock(order_id, lock)?;
        outcome
    }

    async fn discontinue_locked(
        &self,
        order_id: &str,
        request: DiscontinueRequest,
    ) -> Result<DiscontinueOutcome, MedRecError> {
        let resource = self.store.read("MedicationRequest", order_id).await?;
        let order = parse_record(&resource)?;
        let now = request.effective_at.unwrap_or_else(Utc::now);

        let already_done = order.status.is_terminal()
            || (order.status == OrderStatus::OnHold
                && request.kind == DiscontinuationKind::Tapered);
        if already_done {
            let record = self.make_record(&order, &request, order.status, None, now, DiscontinuationEffect::NoOp);
            self.remember(record.clone())?;
            tracing::info!(order = order_id, status = %order.status, "order already discontinued, nothing to do");
            return Ok(DiscontinueOutcome {
                updated_order: order,
                record,
                tapering_plan: None,
            });
        }

        let target = match (request.kind, order.status) {
            (DiscontinuationKind::Tapered, _) => OrderStatus::OnHold,
            (DiscontinuationKind::Immediate, OrderStatus::Draft) => OrderStatus::Cancelled,
            (DiscontinuationKind::Immediate, _) => OrderStatus::Stopped,
        };
        if !order.status.can_transition_to(target) {
            return Err(MedRecError::InvalidTransition {
                from: order.status,
                to: target,
            });
        }

        let plan = (request.kind == DiscontinuationKind::Tapered).then(|| {
            TaperingPlan::linear(
                now,
                request.tapering_steps.unwrap_or(self.config.tapering_steps),
                self.config.tapering_interval_days,
            )
        });

        let updated = apply_transition(resource, target, &request, plan.as_ref(), now)?;
        let stored = self
            .store
            .update("MedicationRequest", order_id, updated)
            .await?;
        let updated_order = parse_record(&stored)?;

        let record = self.make_record(
            &order,
            &request,
            target,
            plan.clone(),
            now,
            DiscontinuationEffect::Applied,
        );
        self.remember(record.clone())?;

        if let Some(patient_id) = updated_order.patient_id.as_deref() {
            self.lists.on_status_change(patient_id, order_id, target)?;
        }

        tracing::info!(
            order = order_id,
            from = %order.status,
            to = %target,
            reason = request.reason.as_code(),
            tapered = plan.is_some(),
            "order discontinued"
        );

        Ok(DiscontinueOutcome {
            updated_order,
            record,
            tapering_plan: plan,
        })
    }

    /// Every record for an order, oldest first, including zero-effect retries.
    pub fn history(&self, order_id: &str) -> Result<Vec<DiscontinuationRecord>, MedRecError> {
        let audit = self.audit.read().map_err(|_| MedRecError::LockPoisoned)?;
        Ok(audit
            .iter()
            .filter(|record| record.order_id == order_id)
            .cloned()
            .collect())
    }

    pub fn audit_trail(&self) -> Result<Vec<DiscontinuationRecord>, MedRecError> {
        Ok(self
            .audit
            .read()
            .map_err(|_| MedRecError::LockPoisoned)?
            .clone())
    }

    fn order_lock(&self, order_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, MedRecError> {
        let mut locks = self
            .order_locks
            .lock()
            .map_err(|_| MedRecError::LockPoisoned)?;
        Ok(locks.entry(order_id.to_string()).or_default().clone())
    }

    /// Drops the order's lock entry when no other caller holds or awaits it.
    fn release_lock(
        &self,
        order_id: &str,
        lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Result<(), MedRecError> {
        let mut locks = self
            .order_locks
            .lock()
            .map_err(|_| MedRecError::LockPoisoned)?;
        let idle = locks
            .get(order_id)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(order_id);
        }
        Ok(())
    }

    /// Number of orders with a tracked lock.
    pub fn tracked_locks(&self) -> usize {
        self.order_locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    fn remember(&self, record: DiscontinuationRecord) -> Result<(), MedRecError> {
        self.audit
            .write()
            .map_err(|_| MedRecError::LockPoisoned)?
            .push(record);
        Ok(())
    }

    fn make_record(
        &self,
        order: &MedicationOrder,
        request: &DiscontinueRequest,
        new_status: OrderStatus,
        tapering: Option<TaperingPlan>,
        created_at: DateTime<Utc>,
        effect: DiscontinuationEffect,
    ) -> DiscontinuationRecord {
        DiscontinuationRecord {
            id: Uuid::new_v4(),
            order_id: order.id.clone(),
            reason: request.reason,
            reason_text: request.reason_text.clone(),
            kind: request.kind,
            tapering,
            previous_status: order.status,
            new_status,
            effect,
            created_at,
        }
    }
}

/// New resource body: status, statusReason and one appended note.
fn apply_transition(
    mut resource: Value,
    target: OrderStatus,
    request: &DiscontinueRequest,
    plan: Option<&TaperingPlan>,
    now: DateTime<Utc>,
) -> Result<Value, MedRecError> {
    let reason_text = request
        .reason_text
        .clone()
        .unwrap_or_else(|| request.reason.display().to_string());

    let mut note = match request.kind {
        DiscontinuationKind::Immediate => format!("Discontinued: {reason_text}."),
        DiscontinuationKind::Tapered => format!("Tapering started: {reason_text}."),
    };
    if let Some(plan) = plan {
        let steps: Vec<String> = plan
            .steps
            .iter()
            .map(|step| {
                format!(
                    "{:.0}% from {}",
                    step.dose_fraction * 100.0,
                    step.start_date.format("%Y-%m-%d")
                )
            })
            .collect();
        note.push_str(&format!(" Plan: {}.", steps.join(", ")));
    }

    let body = resource.as_object_mut().ok_or_else(|| {
        MedRecError::ValidationFailed("medication order is not a JSON object".into())
    })?;
    body.insert("status".into(), json!(target.as_code()));
    body.insert(
        "statusReason".into(),
        json!({
            "coding": [{
                "system": REASON_SYSTEM,
                "code": request.reason.as_code(),
                "display": request.reason.display(),
            }],
            "text": reason_text,
        }),
    );

    let notes = body.entry("note").or_insert_with(|| json!([]));
    if !notes.is_array() {
        let previous = notes.take();
        *notes = json!([previous]);
    }
    if let Some(history) = notes.as_array_mut() {
        history.push(json!({"text": note, "time": now.to_rfc3339()}));
    }

    Ok(resource)
}
