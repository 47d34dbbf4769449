use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use medrec_core::{
    MedRecConfig, MedicationDescriptor, ReasonCode, SafetyOptions, MAX_TAPERING_INTERVAL_DAYS,
    MAX_TAPERING_STEPS,
};
use medrec_fhir::{first_patient_id, DiscontinueRequest, DrugKnowledge, MedRecEngine};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "medrec-cli",
    about = "Medication resolution, safety screening and reconciliation over a FHIR bundle."
)]
struct Args {
    /// Path to the FHIR JSON bundle.
    #[arg(short, long)]
    input: PathBuf,

    /// Patient id; defaults to the first Patient in the bundle.
    #[arg(short, long)]
    patient: Option<String>,

    /// JSON file with drug knowledge entries, replacing the built-in set.
    #[arg(long)]
    knowledge: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_TAPERING_STEPS))
    )]
    tapering_steps: u32,

    #[arg(
        long,
        default_value_t = 7,
        value_parser = clap::value_parser!(u32).range(0..=i64::from(MAX_TAPERING_INTERVAL_DAYS))
    )]
    tapering_interval_days: u32,

    /// Write a review note onto orders found in conflict.
    #[arg(long)]
    annotate_conflicts: bool,

    /// Print full JSON instead of a summary.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the patient's current, home, discharge and audit lists.
    Reconcile,
    /// Screen candidate medications against the patient's record.
    Check {
        /// Candidate medication names.
        #[arg(required = true)]
        candidates: Vec<String>,
    },
    /// Stop an order, or taper it when --tapered is given.
    Discontinue {
        order_id: String,
        #[arg(long)]
        tapered: bool,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "medrec=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let data = std::fs::read_to_string(&args.input)
        .with_context(|| format!("Could not read file {:?}", args.input))?;
    let bundle: Value = serde_json::from_str(&data).context("Input is not valid JSON")?;

    let patient_id = match &args.patient {
        Some(id) => id.clone(),
        None => first_patient_id(&bundle).context("Bundle contains no Patient; pass --patient")?,
    };
    let knowledge = load_knowledge(args.knowledge.as_deref())?;
    let config = MedRecConfig {
        tapering_steps: args.tapering_steps,
        tapering_interval_days: args.tapering_interval_days,
        annotate_conflicts: args.annotate_conflicts,
        ..MedRecConfig::default()
    };

    let engine = MedRecEngine::from_bundle(&bundle, knowledge, config)?;
    tracing::info!(patient = %patient_id, input = ?args.input, "bundle loaded");

    match args.command {
        Command::Reconcile => {
            let result = engine.reconcile_patient(&patient_id).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(());
            }
            println!("Patient: {}", result.patient_id);
            for stats in &result.statistics {
                println!(
                    "{:<22} total {:>3}  active {:>3}  conflicts {:>3}",
                    stats.category.as_str(),
                    stats.total,
                    stats.active,
                    stats.conflicts
                );
            }
            for conflict in &result.conflicts {
                println!("Review: {}", conflict.summary());
            }
            for issue in &result.issues {
                println!("Unresolved {}: {}", issue.order_id, issue.error);
            }
            if let Some(report) = &result.safety {
                println!(
                    "Safety: {} finding(s), safe to proceed: {}",
                    report.findings.len(),
                    report.is_safe_to_proceed()
                );
            }
        }
        Command::Check { candidates } => {
            let descriptors: Vec<MedicationDescriptor> = candidates
                .iter()
                .enumerate()
                .map(|(i, name)| MedicationDescriptor::named(name.as_str(), format!("candidate-{i}")))
                .collect();
            let report = engine
                .check_for_patient(&patient_id, &descriptors, &SafetyOptions::default())
                .await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            for finding in &report.findings {
                let marker = if finding.hard_stop { "STOP" } else { "warn" };
                println!("[{marker}] {:?}: {}", finding.severity, finding.text);
            }
            println!(
                "Risk: {:?}, safe to proceed: {}",
                report.severity_level(),
                report.is_safe_to_proceed()
            );
        }
        Command::Discontinue {
            order_id,
            tapered,
            reason,
        } => {
            let mut request = if tapered {
                DiscontinueRequest::tapered(ReasonCode::Other)
            } else {
                DiscontinueRequest::immediate(ReasonCode::Other)
            };
            request.reason_text = reason;
            let outcome = engine.discontinue(&order_id, request).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&outcome.record)?);
                return Ok(());
            }
            println!(
                "{}: {} -> {} ({:?})",
                order_id,
                outcome.record.previous_status,
                outcome.record.new_status,
                outcome.record.effect
            );
            if let Some(plan) = &outcome.tapering_plan {
                for step in &plan.steps {
                    println!(
                        "  {:.0}% from {}",
                        step.dose_fraction * 100.0,
                        step.start_date.format("%Y-%m-%d")
                    );
                }
            }
        }
    }

    Ok(())
}

fn load_knowledge(path: Option<&Path>) -> anyhow::Result<DrugKnowledge> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Could not read knowledge file {path:?}"))?;
            Ok(DrugKnowledge::from_json_str(&raw)?)
        }
        None => Ok(DrugKnowledge::builtin()),
    }
}
