//! The analyze subcommand: expand targets, run the engine, render output.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, ValueEnum};
use serde::Serialize;

use crate::binary::signing::SidecarSignatureVerifier;
use crate::config::Policy;
use crate::engine::registry::RuleRegistry;
use crate::engine::results::{CollectingSink, ConsoleSink, ResultRecord};
use crate::engine::{AnalysisEngine, ScanSummary};

use super::discover;

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    /// Files or directories to scan.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Descend into subdirectories when a path names a directory.
    #[arg(long)]
    pub recurse: bool,

    /// Policy file overriding the built-in defaults.
    #[arg(long, value_name = "FILE")]
    pub policy: Option<PathBuf>,

    /// Encode the full runtime condition bitset in the exit code instead of
    /// collapsing it to 0/1.
    #[arg(long)]
    pub rich_return_code: bool,

    /// Scan targets one at a time instead of in parallel.
    #[arg(long)]
    pub sequential: bool,

    /// Cap the number of per-module records quoted in result evidence.
    #[arg(long, value_name = "N")]
    pub max_evidence: Option<usize>,

    /// Output format for results.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Log results as they are produced.
    Text,
    /// Collect results and print one JSON report to stdout.
    Json,
}

pub fn run(args: AnalyzeArgs) -> Result<i32> {
    let mut policy = match &args.policy {
        Some(path) => Policy::load(path)?,
        None => Policy::default(),
    };
    if let Some(max) = args.max_evidence {
        policy.engine.max_evidence_records = max;
    }

    let registry = RuleRegistry::built_in()?;
    let targets = discover::expand_targets(&args.paths, args.recurse)?;
    let verifier = SidecarSignatureVerifier;

    match args.output {
        OutputFormat::Text => {
            let sink = ConsoleSink;
            let summary = AnalysisEngine::new(&registry, &policy, &sink, &verifier)
                .sequential(args.sequential)
                .run(&targets);
            Ok(summary.exit_code(args.rich_return_code))
        }
        OutputFormat::Json => {
            let sink = CollectingSink::new();
            let summary = AnalysisEngine::new(&registry, &policy, &sink, &verifier)
                .sequential(args.sequential)
                .run(&targets);
            let records = sink.snapshot();
            println!("{}", serde_json::to_string_pretty(&JsonReport::new(&summary, &records))?);
            Ok(summary.exit_code(args.rich_return_code))
        }
    }
}

/// Shape of the --output json document.
#[derive(Serialize)]
struct JsonReport<'a> {
    started_at: chrono::DateTime<chrono::Utc>,
    duration_ms: u64,
    targets_scanned: usize,
    targets_failed_to_parse: usize,
    passes: usize,
    errors: usize,
    warnings: usize,
    not_applicable: usize,
    internal_errors: usize,
    conditions: String,
    results: &'a [ResultRecord],
}

impl<'a> JsonReport<'a> {
    fn new(summary: &ScanSummary, records: &'a [ResultRecord]) -> Self {
        JsonReport {
            started_at: summary.started_at,
            duration_ms: summary.duration.as_millis() as u64,
            targets_scanned: summary.targets_scanned,
            targets_failed_to_parse: summary.targets_failed_to_parse,
            passes: summary.tally.passes,
            errors: summary.tally.errors,
            warnings: summary.tally.warnings,
            not_applicable: summary.tally.not_applicable,
            internal_errors: summary.tally.internal_errors,
            conditions: summary.conditions.to_string(),
            results: records,
        }
    }
}
