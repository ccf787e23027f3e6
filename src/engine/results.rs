//! Result model and sinks.

use std::fmt;
use std::sync::Mutex;

use bitflags::bitflags;
use serde::Serialize;

/// Terminal classification of one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultLevel {
    Pass,
    Error,
    Warning,
    Note,
    NotApplicable,
    Pending,
    InternalError,
    ConfigurationError,
}

impl fmt::Display for ResultLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResultLevel::Pass => "pass",
            ResultLevel::Error => "error",
            ResultLevel::Warning => "warning",
            ResultLevel::Note => "note",
            ResultLevel::NotApplicable => "not applicable",
            ResultLevel::Pending => "pending",
            ResultLevel::InternalError => "internal error",
            ResultLevel::ConfigurationError => "configuration error",
        };
        f.write_str(text)
    }
}

/// A single determination produced by a rule, before the engine stamps it
/// with rule and target identity.
#[derive(Debug, Clone)]
pub struct RuleResult {
    pub level: ResultLevel,
    pub message: String,
    /// Multi-line supporting detail, typically a rendered compiland list.
    pub evidence: Option<String>,
}

impl RuleResult {
    pub fn new(level: ResultLevel, message: impl Into<String>) -> Self {
        RuleResult {
            level,
            message: message.into(),
            evidence: None,
        }
    }

    pub fn pass(message: impl Into<String>) -> Self {
        Self::new(ResultLevel::Pass, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResultLevel::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(ResultLevel::Warning, message)
    }

    pub fn note(message: impl Into<String>) -> Self {
        Self::new(ResultLevel::Note, message)
    }

    pub fn not_applicable(message: impl Into<String>) -> Self {
        Self::new(ResultLevel::NotApplicable, message)
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }
}

/// A fully attributed result as seen by sinks.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRecord {
    pub rule_id: String,
    pub rule_name: String,
    pub target: String,
    pub level: ResultLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

/// Receives every result the engine produces. Implementations must be
/// callable from multiple rayon workers at once.
pub trait ResultSink: Send + Sync {
    fn log(&self, record: &ResultRecord);
}

/// Sink that renders results through the tracing subscriber.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ResultSink for ConsoleSink {
    fn log(&self, record: &ResultRecord) {
        let line = match &record.evidence {
            Some(evidence) => format!(
                "{} {}: {}: {}\n{}",
                record.level, record.rule_id, record.target, record.message, evidence
            ),
            None => format!(
                "{} {}: {}: {}",
                record.level, record.rule_id, record.target, record.message
            ),
        };
        match record.level {
            ResultLevel::Error | ResultLevel::InternalError | ResultLevel::ConfigurationError => {
                tracing::error!("{line}");
            }
            ResultLevel::Warning => tracing::warn!("{line}"),
            ResultLevel::Pass | ResultLevel::Note | ResultLevel::Pending => {
                tracing::info!("{line}");
            }
            ResultLevel::NotApplicable => tracing::debug!("{line}"),
        }
    }
}

/// Sink that retains every record, for JSON output and tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    records: Mutex<Vec<ResultRecord>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<ResultRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl ResultSink for CollectingSink {
    fn log(&self, record: &ResultRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

bitflags! {
    /// Conditions observed across one run, ORed into the exit status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RuntimeConditions: u32 {
        const EXCEPTION_IN_ENGINE = 1 << 0;
        const EXCEPTION_IN_RULE_CAN_ANALYZE = 1 << 1;
        const EXCEPTION_IN_RULE_ANALYZE = 1 << 2;
        const TARGET_PARSE_ERROR = 1 << 3;
        const RULE_NOT_APPLICABLE_TO_TARGET = 1 << 4;
        const RULE_MISSING_REQUIRED_CONFIGURATION = 1 << 5;
        const ONE_OR_MORE_RULES_FIRED_ERRORS = 1 << 6;
        const ONE_OR_MORE_RULES_FIRED_WARNINGS = 1 << 7;
        const NO_RULES_LOADED = 1 << 8;
        const NO_VALID_ANALYSIS_TARGETS = 1 << 9;
        const CANCELED = 1 << 10;
    }
}

impl RuntimeConditions {
    /// Conditions that do not make a run unsuccessful. The not-applicable
    /// bit is set on essentially every run because no rule applies to every
    /// binary format, so it carries no signal.
    pub const NON_FATAL: RuntimeConditions = RuntimeConditions::RULE_NOT_APPLICABLE_TO_TARGET
        .union(RuntimeConditions::ONE_OR_MORE_RULES_FIRED_WARNINGS);

    pub fn fatal(self) -> RuntimeConditions {
        self.difference(Self::NON_FATAL)
    }

    /// Process exit status. Rich mode exposes the whole bitset (minus the
    /// uninformative not-applicable bit); plain mode collapses to 0/1.
    pub fn exit_code(self, rich: bool) -> i32 {
        if rich {
            self.difference(Self::RULE_NOT_APPLICABLE_TO_TARGET).bits() as i32
        } else if self.fatal().is_empty() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RuntimeConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str(" | ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}
