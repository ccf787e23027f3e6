//! Analysis engine.
//!
//! Drives the per-target lifecycle: load metadata, walk the registry,
//! isolate rule failures, aggregate runtime conditions into the exit
//! status. Targets run in parallel on rayon workers; rules for one target
//! run sequentially against a context owned by that worker.

pub mod registry;
pub mod results;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use thiserror::Error;

use crate::binary::signing::SignatureVerifier;
use crate::binary::TargetImage;
use crate::config::{FailureLevel, Policy};
use crate::rules::{AnalysisContext, Applicability, Rule};

use self::registry::RuleRegistry;
use self::results::{ResultLevel, ResultRecord, ResultSink, RuleResult, RuntimeConditions};

/// Reserved id for the target-level "could not parse" determination. Real
/// rules start at BA2001; this one exists so parse failures carry a stable
/// id through the same reporting pipeline.
pub const INVALID_BINARY_RULE_ID: &str = "BA1000";
pub const INVALID_BINARY_RULE_NAME: &str = "InvalidBinary";

/// Rules that take longer than this on one target get flagged in the log.
const SLOW_RULE_THRESHOLD: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Lifecycle of one target through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    NotStarted,
    MetadataLoading,
    MetadataLoaded,
    MetadataLoadFailed,
    RuleEvaluation,
    Completed,
}

fn advance(target: &Path, state: &mut TargetState, next: TargetState) {
    tracing::trace!("{}: {:?} -> {:?}", target.display(), *state, next);
    *state = next;
}

/// Per-level result counts for one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResultTally {
    pub passes: usize,
    pub errors: usize,
    pub warnings: usize,
    pub notes: usize,
    pub not_applicable: usize,
    pub internal_errors: usize,
}

impl ResultTally {
    fn count(&mut self, level: ResultLevel) {
        match level {
            ResultLevel::Pass => self.passes += 1,
            ResultLevel::Error => self.errors += 1,
            ResultLevel::Warning => self.warnings += 1,
            ResultLevel::Note | ResultLevel::Pending => self.notes += 1,
            ResultLevel::NotApplicable => self.not_applicable += 1,
            ResultLevel::InternalError | ResultLevel::ConfigurationError => {
                self.internal_errors += 1
            }
        }
    }

    fn merge(&mut self, other: ResultTally) {
        self.passes += other.passes;
        self.errors += other.errors;
        self.warnings += other.warnings;
        self.notes += other.notes;
        self.not_applicable += other.not_applicable;
        self.internal_errors += other.internal_errors;
    }
}

/// Everything one run produced, aside from what went to the sink.
#[derive(Debug)]
pub struct ScanSummary {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub targets_scanned: usize,
    pub targets_failed_to_parse: usize,
    pub tally: ResultTally,
    pub conditions: RuntimeConditions,
}

impl ScanSummary {
    pub fn exit_code(&self, rich: bool) -> i32 {
        self.conditions.exit_code(rich)
    }
}

#[derive(Debug, Default)]
struct TargetOutcome {
    conditions: RuntimeConditions,
    tally: ResultTally,
    parsed: bool,
    scanned: bool,
}

pub struct AnalysisEngine<'a> {
    registry: &'a RuleRegistry,
    policy: &'a Policy,
    sink: &'a dyn ResultSink,
    verifier: &'a dyn SignatureVerifier,
    cancel: Arc<AtomicBool>,
    sequential: bool,
}

impl<'a> AnalysisEngine<'a> {
    pub fn new(
        registry: &'a RuleRegistry,
        policy: &'a Policy,
        sink: &'a dyn ResultSink,
        verifier: &'a dyn SignatureVerifier,
    ) -> Self {
        AnalysisEngine {
            registry,
            policy,
            sink,
            verifier,
            cancel: Arc::new(AtomicBool::new(false)),
            sequential: false,
        }
    }

    pub fn sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    /// Token that aborts the scan between targets when set.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn run(&self, targets: &[PathBuf]) -> ScanSummary {
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut conditions = RuntimeConditions::empty();
        if self.registry.is_empty() {
            conditions |= RuntimeConditions::NO_RULES_LOADED;
        }
        if targets.is_empty() {
            conditions |= RuntimeConditions::NO_VALID_ANALYSIS_TARGETS;
        }
        if !conditions.is_empty() {
            tracing::error!("nothing to do: {}", conditions);
            return ScanSummary {
                started_at,
                duration: clock.elapsed(),
                targets_scanned: 0,
                targets_failed_to_parse: 0,
                tally: ResultTally::default(),
                conditions,
            };
        }

        tracing::info!(
            "scanning {} target(s) with {} rule(s)",
            targets.len(),
            self.registry.len()
        );

        let outcomes: Vec<TargetOutcome> = if self.sequential {
            targets.iter().map(|t| self.analyze_target(t)).collect()
        } else {
            targets.par_iter().map(|t| self.analyze_target(t)).collect()
        };

        let mut tally = ResultTally::default();
        let mut targets_scanned = 0;
        let mut targets_failed_to_parse = 0;
        for outcome in outcomes {
            conditions |= outcome.conditions;
            tally.merge(outcome.tally);
            if outcome.scanned {
                targets_scanned += 1;
                if !outcome.parsed {
                    targets_failed_to_parse += 1;
                }
            }
        }
        if tally.errors > 0 {
            conditions |= RuntimeConditions::ONE_OR_MORE_RULES_FIRED_ERRORS;
        }
        if tally.warnings > 0 {
            conditions |= RuntimeConditions::ONE_OR_MORE_RULES_FIRED_WARNINGS;
        }

        let summary = ScanSummary {
            started_at,
            duration: clock.elapsed(),
            targets_scanned,
            targets_failed_to_parse,
            tally,
            conditions,
        };
        tracing::info!(
            "scan finished in {:?}: {} pass, {} error, {} warning, conditions: {}",
            summary.duration,
            summary.tally.passes,
            summary.tally.errors,
            summary.tally.warnings,
            summary.conditions
        );
        summary
    }

    fn analyze_target(&self, path: &Path) -> TargetOutcome {
        let mut outcome = TargetOutcome::default();
        if self.cancel.load(Ordering::Relaxed) {
            outcome.conditions |= RuntimeConditions::CANCELED;
            return outcome;
        }
        outcome.scanned = true;

        let mut state = TargetState::NotStarted;
        tracing::info!("analyzing {}", path.display());

        advance(path, &mut state, TargetState::MetadataLoading);
        let image = match TargetImage::load(path, self.verifier) {
            Ok(image) => {
                advance(path, &mut state, TargetState::MetadataLoaded);
                image
            }
            Err(err) => {
                advance(path, &mut state, TargetState::MetadataLoadFailed);
                outcome.conditions |= RuntimeConditions::TARGET_PARSE_ERROR;
                self.sink.log(&ResultRecord {
                    rule_id: INVALID_BINARY_RULE_ID.to_string(),
                    rule_name: INVALID_BINARY_RULE_NAME.to_string(),
                    target: path.display().to_string(),
                    level: ResultLevel::Error,
                    message: format!(
                        "'{}' was not analyzed as it does not appear to be a valid PE, ELF, or Mach-O image: {:#}",
                        file_name(path),
                        err
                    ),
                    evidence: None,
                });
                return outcome;
            }
        };
        outcome.parsed = true;

        advance(path, &mut state, TargetState::RuleEvaluation);
        let ctx = AnalysisContext {
            target: &image,
            policy: self.policy,
        };
        for rule in self.registry.rules() {
            self.evaluate_rule(rule.as_ref(), &ctx, &mut outcome);
        }
        advance(path, &mut state, TargetState::Completed);
        outcome
    }

    fn evaluate_rule(&self, rule: &dyn Rule, ctx: &AnalysisContext, outcome: &mut TargetOutcome) {
        let target_name = ctx.target.file_name.as_str();
        let started = Instant::now();

        match catch_unwind(AssertUnwindSafe(|| rule.can_analyze(ctx))) {
            Err(panic) => {
                outcome.conditions |= RuntimeConditions::EXCEPTION_IN_RULE_CAN_ANALYZE;
                let message = format!(
                    "An unhandled failure was raised determining whether '{}' is a valid \
                     analysis target for check '{}'. The failure may reflect a problem \
                     parsing image metadata rather than the check itself. Details: {}",
                    target_name,
                    rule.name(),
                    panic_message(panic)
                );
                self.emit(rule, ctx, RuleResult::new(ResultLevel::InternalError, message), outcome);
                return;
            }
            Ok(Applicability::Error(detail)) => {
                outcome.conditions |= RuntimeConditions::EXCEPTION_IN_RULE_CAN_ANALYZE;
                let message = format!(
                    "Applicability of check '{}' to '{}' could not be determined: {}",
                    rule.name(),
                    target_name,
                    detail
                );
                self.emit(rule, ctx, RuleResult::new(ResultLevel::InternalError, message), outcome);
                return;
            }
            Ok(Applicability::NotApplicableToTarget(reason)) => {
                outcome.conditions |= RuntimeConditions::RULE_NOT_APPLICABLE_TO_TARGET;
                let message = format!(
                    "Image '{}' was not evaluated for check '{}' as the analysis is not \
                     relevant based on observed metadata: {}.",
                    target_name,
                    rule.name(),
                    reason
                );
                self.emit(rule, ctx, RuleResult::not_applicable(message), outcome);
                return;
            }
            Ok(Applicability::Applicable) => {}
        }

        match catch_unwind(AssertUnwindSafe(|| rule.analyze(ctx))) {
            Err(panic) => {
                outcome.conditions |= RuntimeConditions::EXCEPTION_IN_RULE_ANALYZE;
                let message = format!(
                    "An unhandled failure was encountered analyzing '{}' with check '{}'. \
                     Details: {}",
                    target_name,
                    rule.name(),
                    panic_message(panic)
                );
                self.emit(rule, ctx, RuleResult::new(ResultLevel::InternalError, message), outcome);
            }
            Ok(results) if results.is_empty() => {
                // Every applicable evaluation must end in a determination.
                outcome.conditions |= RuntimeConditions::EXCEPTION_IN_RULE_ANALYZE;
                let message = format!(
                    "Check '{}' completed without producing a determination for '{}'.",
                    rule.name(),
                    target_name
                );
                self.emit(rule, ctx, RuleResult::new(ResultLevel::InternalError, message), outcome);
            }
            Ok(results) => {
                for result in results {
                    self.emit(rule, ctx, result, outcome);
                }
            }
        }

        let elapsed = started.elapsed();
        if elapsed > SLOW_RULE_THRESHOLD {
            tracing::warn!(
                "check {} took {:?} on {}",
                rule.id(),
                elapsed,
                ctx.target.path.display()
            );
        }
    }

    fn emit(
        &self,
        rule: &dyn Rule,
        ctx: &AnalysisContext,
        result: RuleResult,
        outcome: &mut TargetOutcome,
    ) {
        let level = self.effective_level(rule, result.level);
        outcome.tally.count(level);
        self.sink.log(&ResultRecord {
            rule_id: rule.id().to_string(),
            rule_name: rule.name().to_string(),
            target: ctx.target.path.display().to_string(),
            level,
            message: result.message,
            evidence: result.evidence,
        });
    }

    /// Applies the policy's severity override to a rule's failing verdicts.
    /// Passes, skips, and engine-generated levels are never remapped.
    fn effective_level(&self, rule: &dyn Rule, level: ResultLevel) -> ResultLevel {
        if !matches!(level, ResultLevel::Error | ResultLevel::Warning) {
            return level;
        }
        match self.policy.rule_levels.get(rule.id()) {
            Some(FailureLevel::Error) => ResultLevel::Error,
            Some(FailureLevel::Warning) => ResultLevel::Warning,
            Some(FailureLevel::Note) => ResultLevel::Note,
            None => level,
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
