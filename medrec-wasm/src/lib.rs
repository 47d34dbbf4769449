//! Framework-neutral WASM <-> JavaScript bridge.

use futures::executor::block_on;
use medrec_core::{MedRecConfig, MedRecError, PatientContext, SafetyOptions};
use medrec_fhir::{DrugKnowledge, SafetyChecker};
use serde::Deserialize;
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct JsMedRecConfig {
    #[serde(default)]
    tapering_steps: Option<u32>,
    #[serde(default)]
    tapering_interval_days: Option<u32>,
    #[serde(default)]
    annotate_conflicts: Option<bool>,
    #[serde(default)]
    safety_cache_enabled: Option<bool>,
}

impl From<JsMedRecConfig> for MedRecConfig {
    fn from(cfg: JsMedRecConfig) -> Self {
        let mut base = MedRecConfig::default();
        if let Some(steps) = cfg.tapering_steps {
            base.tapering_steps = steps;
        }
        if let Some(days) = cfg.tapering_interval_days {
            base.tapering_interval_days = days;
        }
        if let Some(annotate) = cfg.annotate_conflicts {
            base.annotate_conflicts = annotate;
        }
        if let Some(enabled) = cfg.safety_cache_enabled {
            base.safety_cache_enabled = enabled;
        }
        base
    }
}

/// Reconciles one patient's medications from a FHIR Bundle.
///
/// `patient_id` defaults to the first Patient in the bundle.
#[wasm_bindgen]
pub fn reconcile_bundle(
    input_bundle: JsValue,
    patient_id: Option<String>,
    config: Option<JsValue>,
) -> Result<JsValue, JsValue> {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let bundle_value = from_value::<serde_json::Value>(input_bundle)
        .map_err(|err| JsValue::from_str(&format!("Could not read JSON bundle: {err}")))?;
    let cfg = read_config(config)?;

    let result = block_on(medrec_fhir::reconcile_bundle_value(
        &bundle_value,
        patient_id.as_deref(),
        DrugKnowledge::builtin(),
        cfg,
    ))
    .map_err(|err| JsValue::from_str(&format_medrec_error(err)))?;

    to_value(&result)
        .map_err(|err| JsValue::from_str(&format!("Could not serialize reconciliation: {err}")))
}

/// Screens candidate medication names against a patient context.
#[wasm_bindgen]
pub fn check_safety(
    candidate_names: JsValue,
    context: JsValue,
    options: Option<JsValue>,
) -> Result<JsValue, JsValue> {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let names: Vec<String> = from_value(candidate_names)
        .map_err(|err| JsValue::from_str(&format!("Could not read candidates: {err}")))?;
    let context: PatientContext = from_value(context)
        .map_err(|err| JsValue::from_str(&format!("Could not read patient context: {err}")))?;
    let options: SafetyOptions = match options {
        Some(js_options) => from_value(js_options)
            .map_err(|err| JsValue::from_str(&format!("Could not read options: {err}")))?,
        None => SafetyOptions::default(),
    };

    let checker = SafetyChecker::new(DrugKnowledge::builtin()).with_cache(false);
    let candidates: Vec<_> = names
        .iter()
        .map(|name| checker.knowledge().medication_named(name))
        .collect();
    let report = checker
        .check_safety(&candidates, &context, &options)
        .map_err(|err| JsValue::from_str(&format_medrec_error(err)))?;

    to_value(&report).map_err(|err| JsValue::from_str(&format!("Could not serialize report: {err}")))
}

fn read_config(config: Option<JsValue>) -> Result<MedRecConfig, JsValue> {
    match config {
        Some(js_cfg) => {
            let cfg: JsMedRecConfig = from_value(js_cfg)
                .map_err(|err| JsValue::from_str(&format!("Could not read config: {err}")))?;
            Ok(MedRecConfig::from(cfg))
        }
        None => Ok(MedRecConfig::default()),
    }
}

fn format_medrec_error(err: MedRecError) -> String {
    format!("Medication reconciliation error: {err}")
}
