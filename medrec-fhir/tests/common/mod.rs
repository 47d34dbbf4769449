#![allow(dead_code)]

use std::fs;
use std::sync::Arc;

use medrec_core::MedRecConfig;
use medrec_fhir::{DrugKnowledge, InMemoryStore, MedRecEngine};
use serde_json::Value;

pub fn fixture_path(name: &str) -> String {
    format!("{}/tests/data/{name}", env!("CARGO_MANIFEST_DIR"))
}

pub fn fixture_bundle() -> Value {
    let raw = fs::read_to_string(fixture_path("reconciliation_bundle.json"))
        .expect("fixture bundle should exist");
    serde_json::from_str(&raw).expect("fixture bundle should be valid JSON")
}

pub fn fixture_store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::from_bundle(&fixture_bundle()).expect("fixture bundle should load"))
}

pub fn engine_over(store: &Arc<InMemoryStore>, config: MedRecConfig) -> MedRecEngine {
    MedRecEngine::new(store.clone(), DrugKnowledge::builtin(), config)
}
