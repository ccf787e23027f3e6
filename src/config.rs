//! Analysis policy.
//!
//! Every tunable lives in one typed document. Defaults are compiled in;
//! a JSON policy file selectively overrides them, keyed by rule id. The
//! policy is validated once at load time and then frozen for the run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::binary::pe;
use crate::version::{ToolVersion, VersionRange};

pub const DEFAULT_MAX_EVIDENCE_RECORDS: usize = 100;

/// Engine-wide knobs, independent of any single rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    /// Upper bound on evidence lines a single result may carry before the
    /// truncation renderer kicks in.
    pub max_evidence_records: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            max_evidence_records: DEFAULT_MAX_EVIDENCE_RECORDS,
        }
    }
}

/// Severity a policy can assign to a rule's failing verdicts, replacing the
/// level the rule itself would report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureLevel {
    Error,
    Warning,
    Note,
}

/// Processor families that share a Spectre mitigation timeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MachineFamily {
    X86,
    Arm,
}

impl MachineFamily {
    /// Maps a PE machine type onto its family, if mitigations exist for it.
    pub fn classify(machine: u16) -> Option<MachineFamily> {
        match machine {
            pe::IMAGE_FILE_MACHINE_I386 | pe::IMAGE_FILE_MACHINE_AMD64 => {
                Some(MachineFamily::X86)
            }
            pe::IMAGE_FILE_MACHINE_ARM
            | pe::IMAGE_FILE_MACHINE_ARMNT
            | pe::IMAGE_FILE_MACHINE_ARM64 => Some(MachineFamily::Arm),
            _ => None,
        }
    }
}

/// A speculative-execution mitigation a compiler release can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompilerMitigation {
    #[serde(rename = "qspectre")]
    QSpectre,
    #[serde(rename = "d2guardspecload")]
    D2GuardSpecLoad,
    /// Mitigations also cover code compiled without optimizations.
    #[serde(rename = "nonoptimized_code_mitigated")]
    NonoptimizedCodeMitigated,
}

/// One compiler version interval and the mitigations it makes available.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MitigatedCompilerEntry {
    pub range: VersionRange,
    pub mitigations: Vec<CompilerMitigation>,
}

impl MitigatedCompilerEntry {
    fn new(min: &str, max: &str, mitigations: &[CompilerMitigation]) -> Self {
        // Only called with compiled-in literals; a bad literal is a bug the
        // policy tests catch immediately.
        let parse = |s: &str| s.parse::<ToolVersion>().unwrap_or(ToolVersion::MAX);
        MitigatedCompilerEntry {
            range: VersionRange::new(parse(min), parse(max)),
            mitigations: mitigations.to_vec(),
        }
    }

    pub fn supports(&self, mitigation: CompilerMitigation) -> bool {
        self.mitigations.contains(&mitigation)
    }

    pub fn supports_any_spectre_switch(&self) -> bool {
        self.supports(CompilerMitigation::QSpectre)
            || self.supports(CompilerMitigation::D2GuardSpecLoad)
    }
}

/// Options for the Spectre mitigation rule, shared with the secure-tools
/// rule when advanced mitigation enforcement is switched on there.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpectreOptions {
    /// Per-family compiler release timeline, sorted by minimum version.
    pub mitigated_compilers: BTreeMap<MachineFamily, Vec<MitigatedCompilerEntry>>,
    /// Libraries exempted from analysis, keyed `"<lib file name>,<language>"`
    /// (lowercase) and valued with the minimum back-end version the
    /// exemption applies from.
    pub allowed_libraries: BTreeMap<String, ToolVersion>,
    /// Also report assembly-language modules, which cannot carry
    /// compiler-inserted mitigations.
    pub report_masm_modules: bool,
}

impl Default for SpectreOptions {
    fn default() -> Self {
        use CompilerMitigation::{D2GuardSpecLoad, NonoptimizedCodeMitigated, QSpectre};

        // Version ranges follow the MSVC release timeline for /Qspectre and
        // /d2guardspecload support; gaps between ranges are real gaps in
        // compiler support.
        let x86 = vec![
            MitigatedCompilerEntry::new("19.0.24232.0", "19.0.*.*", &[QSpectre]),
            MitigatedCompilerEntry::new(
                "19.10.25024.0",
                "19.10.25099.*",
                &[D2GuardSpecLoad, QSpectre],
            ),
            MitigatedCompilerEntry::new("19.12.25830.2", "19.12.25834.*", &[D2GuardSpecLoad]),
            MitigatedCompilerEntry::new(
                "19.12.25835.0",
                "19.12.*.*",
                &[D2GuardSpecLoad, QSpectre],
            ),
            MitigatedCompilerEntry::new("19.13.26029.0", "19.13.26117.*", &[D2GuardSpecLoad]),
            MitigatedCompilerEntry::new(
                "19.13.26118.0",
                "19.14.26328.*",
                &[D2GuardSpecLoad, QSpectre],
            ),
            MitigatedCompilerEntry::new(
                "19.14.26329.0",
                "*",
                &[D2GuardSpecLoad, QSpectre, NonoptimizedCodeMitigated],
            ),
        ];
        let arm = vec![
            MitigatedCompilerEntry::new(
                "19.13.26214.0",
                "19.14.26328.*",
                &[D2GuardSpecLoad, QSpectre],
            ),
            MitigatedCompilerEntry::new(
                "19.14.26329.0",
                "*",
                &[D2GuardSpecLoad, QSpectre, NonoptimizedCodeMitigated],
            ),
        ];

        let mut mitigated_compilers = BTreeMap::new();
        mitigated_compilers.insert(MachineFamily::X86, x86);
        mitigated_compilers.insert(MachineFamily::Arm, arm);

        SpectreOptions {
            mitigated_compilers,
            allowed_libraries: BTreeMap::new(),
            report_masm_modules: false,
        }
    }
}

impl SpectreOptions {
    pub fn family_is_mitigated(&self, family: MachineFamily) -> bool {
        self.mitigated_compilers.contains_key(&family)
    }

    /// Mitigations a compiler of the given version can provide, or an empty
    /// slice when the version falls in a support gap.
    pub fn available_mitigations(
        &self,
        family: MachineFamily,
        version: ToolVersion,
    ) -> &[CompilerMitigation] {
        self.mitigated_compilers
            .get(&family)
            .and_then(|entries| entries.iter().find(|e| e.range.contains(version)))
            .map(|e| e.mitigations.as_slice())
            .unwrap_or(&[])
    }

    /// Smallest upgrade target whose release line carries a Spectre switch.
    /// `None` means the family has no mitigation timeline at all.
    pub fn closest_mitigated_version(
        &self,
        family: MachineFamily,
        version: ToolVersion,
    ) -> Option<ToolVersion> {
        let entries = self.mitigated_compilers.get(&family)?;
        let mut previous_max = ToolVersion::MIN;
        for entry in entries {
            if version > previous_max
                && version <= entry.range.min
                && entry.supports_any_spectre_switch()
            {
                return Some(entry.range.min);
            }
            previous_max = entry.range.max;
        }
        // Newer than every known range; recommend the newest mitigated line.
        entries.last().map(|e| e.range.min)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (family, entries) in &self.mitigated_compilers {
            for entry in entries {
                if entry.range.min >= entry.range.max {
                    bail!(
                        "mitigated compiler range {} for {:?} is empty",
                        entry.range,
                        family
                    );
                }
            }
            for pair in entries.windows(2) {
                if pair[0].range.min > pair[1].range.min {
                    bail!(
                        "mitigated compiler ranges for {:?} are not sorted: {} after {}",
                        family,
                        pair[1].range,
                        pair[0].range
                    );
                }
                if pair[0].range.overlaps(&pair[1].range) {
                    bail!(
                        "mitigated compiler ranges for {:?} overlap: {} and {}",
                        family,
                        pair[0].range,
                        pair[1].range
                    );
                }
            }
        }
        Ok(())
    }
}

/// Cross-cutting enforcement the secure-tools rule can layer on top of its
/// minimum version checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvancedMitigation {
    Spectre,
}

/// Options for the secure-tools (minimum compiler version) rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecureToolsOptions {
    pub minimum_c_version: ToolVersion,
    pub minimum_cxx_version: ToolVersion,
    pub minimum_xbox_version: ToolVersion,
    /// Libraries exempted from the minimum, keyed like
    /// [`SpectreOptions::allowed_libraries`].
    pub allowed_libraries: BTreeMap<String, ToolVersion>,
    pub advanced_mitigations: Vec<AdvancedMitigation>,
}

impl Default for SecureToolsOptions {
    fn default() -> Self {
        let mut allowed_libraries = BTreeMap::new();
        allowed_libraries.insert("libeay32.lib,unknown".to_string(), ToolVersion::MIN);
        SecureToolsOptions {
            minimum_c_version: ToolVersion::new(17, 0, 65501, 17013),
            minimum_cxx_version: ToolVersion::new(17, 0, 65501, 17013),
            minimum_xbox_version: ToolVersion::new(16, 0, 11886, 0),
            allowed_libraries,
            advanced_mitigations: Vec::new(),
        }
    }
}

impl SecureToolsOptions {
    pub fn enforces_spectre(&self) -> bool {
        self.advanced_mitigations
            .contains(&AdvancedMitigation::Spectre)
    }
}

/// Options for the compiler-warnings rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerWarningsOptions {
    /// Warning ids that must not be explicitly disabled.
    pub required_warnings: BTreeSet<u32>,
}

impl Default for CompilerWarningsOptions {
    fn default() -> Self {
        CompilerWarningsOptions {
            required_warnings: [4018, 4146, 4244, 4267].into_iter().collect(),
        }
    }
}

/// Options for the stack-protection-disabled-functions rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StackProtectionOptions {
    /// Functions allowed to opt out of stack protection.
    pub approved_functions: BTreeSet<String>,
}

impl Default for StackProtectionOptions {
    fn default() -> Self {
        // Event-tracing helpers plus the driver entry points that run
        // before the cookie is initialized.
        StackProtectionOptions {
            approved_functions: [
                "_TlgWrite",
                "__vcrt_trace_logging_provider::_TlgWrite",
                "__security_init_cookie",
                "_GsDriverEntry",
                "GsDriverEntry",
                "_GsDrvEnableDriver",
                "GsDrvEnableDriver",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Per-rule option blocks, keyed by rule id in the policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleOptions {
    #[serde(rename = "BA2006")]
    pub secure_tools: SecureToolsOptions,
    #[serde(rename = "BA2007")]
    pub compiler_warnings: CompilerWarningsOptions,
    #[serde(rename = "BA2014")]
    pub stack_protection: StackProtectionOptions,
    #[serde(rename = "BA2024")]
    pub spectre: SpectreOptions,
}

/// The frozen analysis policy for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Policy {
    pub engine: EngineOptions,
    /// Failing-severity overrides keyed by rule id, e.g. downgrading a
    /// check to `note` while a violation backlog is burned down.
    pub rule_levels: BTreeMap<String, FailureLevel>,
    pub rules: RuleOptions,
}

impl Policy {
    /// Loads and validates a policy file. Unknown rule ids or option names
    /// are rejected rather than ignored.
    pub fn load(path: &Path) -> anyhow::Result<Policy> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy {}", path.display()))?;
        let policy: Policy = serde_json::from_str(&raw)
            .with_context(|| format!("invalid policy document {}", path.display()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for id in self.rule_levels.keys() {
            let digits = id.strip_prefix("BA").unwrap_or("");
            if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
                bail!("rule level override '{}' is not a rule id", id);
            }
        }
        self.rules.spectre.validate()
    }

    pub fn to_pretty_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize policy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ToolVersion {
        s.parse().unwrap()
    }

    #[test]
    fn default_policy_is_valid_and_round_trips() {
        let policy = Policy::default();
        policy.validate().unwrap();

        let json = policy.to_pretty_json().unwrap();
        let back: Policy = serde_json::from_str(&json).unwrap();
        back.validate().unwrap();
        assert_eq!(back.engine.max_evidence_records, DEFAULT_MAX_EVIDENCE_RECORDS);
    }

    #[test]
    fn rule_level_overrides_validate_their_keys() {
        let policy: Policy =
            serde_json::from_str(r#"{ "rule_levels": { "BA3001": "note" } }"#).unwrap();
        policy.validate().unwrap();
        assert_eq!(policy.rule_levels.get("BA3001"), Some(&FailureLevel::Note));

        let bad: Policy =
            serde_json::from_str(r#"{ "rule_levels": { "CVE-2024": "warning" } }"#).unwrap();
        let err = bad.validate().unwrap_err().to_string();
        assert!(err.contains("not a rule id"), "unexpected error: {err}");
    }

    #[test]
    fn spectre_table_lookup_honors_gaps() {
        let spectre = SpectreOptions::default();

        // Inside VS2015 Update 3 servicing range.
        let found = spectre.available_mitigations(MachineFamily::X86, v("19.0.24232.0"));
        assert!(found.contains(&CompilerMitigation::QSpectre));

        // The 19.11 line never shipped a Spectre switch.
        let gap = spectre.available_mitigations(MachineFamily::X86, v("19.11.25506.0"));
        assert!(gap.is_empty());

        // Everything from 15.7 preview 3 onward mitigates /Od builds too.
        let modern = spectre.available_mitigations(MachineFamily::X86, v("19.22.27905.0"));
        assert!(modern.contains(&CompilerMitigation::NonoptimizedCodeMitigated));
    }

    #[test]
    fn closest_mitigated_version_recommends_smallest_upgrade() {
        let spectre = SpectreOptions::default();

        // 19.11 sits between the 19.10 range and the 19.12 range; the next
        // mitigated minimum is the smallest upgrade.
        let next = spectre
            .closest_mitigated_version(MachineFamily::X86, v("19.11.25506.0"))
            .unwrap();
        assert_eq!(next, v("19.12.25830.2"));

        // Versions beyond every known range fall back to the newest line.
        let newest = spectre
            .closest_mitigated_version(MachineFamily::X86, ToolVersion::new(99, 0, 0, 0))
            .unwrap();
        assert_eq!(newest, v("19.14.26329.0"));
    }

    #[test]
    fn overlapping_ranges_fail_validation() {
        let mut policy = Policy::default();
        let entries = policy
            .rules
            .spectre
            .mitigated_compilers
            .get_mut(&MachineFamily::X86)
            .unwrap();
        entries[1].range.min = v("19.0.25000.0");

        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("not sorted") || err.to_string().contains("overlap"));
    }

    #[test]
    fn policy_overrides_merge_over_defaults() {
        let json = r#"{
            "engine": { "max_evidence_records": 25 },
            "rules": {
                "BA2007": { "required_warnings": [4018] }
            }
        }"#;
        let policy: Policy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.engine.max_evidence_records, 25);
        assert_eq!(policy.rules.compiler_warnings.required_warnings.len(), 1);
        // Untouched blocks keep their defaults.
        assert_eq!(
            policy.rules.secure_tools.minimum_cxx_version,
            v("17.0.65501.17013")
        );
    }

    #[test]
    fn unknown_rule_ids_are_rejected() {
        let json = r#"{ "rules": { "BA9999": {} } }"#;
        assert!(serde_json::from_str::<Policy>(json).is_err());
    }

    #[test]
    fn machine_family_classification() {
        assert_eq!(
            MachineFamily::classify(pe::IMAGE_FILE_MACHINE_AMD64),
            Some(MachineFamily::X86)
        );
        assert_eq!(
            MachineFamily::classify(pe::IMAGE_FILE_MACHINE_ARM64),
            Some(MachineFamily::Arm)
        );
        assert_eq!(MachineFamily::classify(0x0200), None);
    }
}
