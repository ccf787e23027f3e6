//! Toolchain provenance checks: minimum compiler versions and the warning
//! configuration the modules were built with.

use std::collections::{BTreeMap, BTreeSet};

use crate::binary::debug_info::{ModuleLanguage, ObjectModule, MICROSOFT_NATIVE_COMPILER};
use crate::config::{CompilerMitigation, MachineFamily, SecureToolsOptions};
use crate::engine::results::RuleResult;
use crate::evidence::TruncatedRecordList;
use crate::rules::{reasons, shared, AnalysisContext, Applicability, Rule};
use crate::version::ToolVersion;

/// BA2006: every linked module must come from a toolchain at or beyond the
/// configured minimum for its language.
pub struct BuildWithSecureTools;

fn minimum_version(
    options: &SecureToolsOptions,
    language: ModuleLanguage,
    is_xbox: bool,
) -> ToolVersion {
    if is_xbox {
        return options.minimum_xbox_version;
    }
    match language {
        ModuleLanguage::C => options.minimum_c_version,
        _ => options.minimum_cxx_version,
    }
}

impl Rule for BuildWithSecureTools {
    fn id(&self) -> &'static str {
        "BA2006"
    }

    fn name(&self) -> &'static str {
        "BuildWithSecureTools"
    }

    fn description(&self) -> &'static str {
        "Application code should be compiled with the most up-to-date tool sets possible \
         to take advantage of the most current compile-time security features. Among \
         other things, these features provide address space layout randomization, help \
         prevent arbitrary code execution and enable code generation that can help \
         prevent speculative execution side-channel attacks."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let pe = match shared::pe_binary(ctx) {
            Ok(pe) => pe,
            Err(gate) => return gate,
        };
        if let Err(gate) = shared::debug_info_can_analyze(pe) {
            return gate;
        }
        if pe.is_il_only() {
            return shared::skip(reasons::IL_ONLY_ASSEMBLY);
        }
        if pe.is_resource_only() {
            return shared::skip(reasons::RESOURCE_ONLY);
        }
        Applicability::Applicable
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let Some(pe) = ctx.target.pe() else {
            return Vec::new();
        };
        let debug_info = match shared::require_debug_info(ctx, self.name()) {
            Ok(info) => info,
            Err(result) => return vec![result],
        };

        let options = &ctx.policy.rules.secure_tools;
        let spectre = &ctx.policy.rules.spectre;

        let mut in_policy: BTreeSet<String> = BTreeSet::new();
        let mut out_of_policy: BTreeMap<ModuleLanguage, Vec<&ObjectModule>> = BTreeMap::new();

        for module in &debug_info.modules {
            if !module.is_microsoft_native_compiler() {
                continue;
            }

            if let Some(key) = module.allow_list_key() {
                if let Some(allowed_from) = options.allowed_libraries.get(&key) {
                    if module.back_end_version >= *allowed_from {
                        continue;
                    }
                }
            }

            let actual = module.minimum_tool_version();
            let mut found_issue = actual < minimum_version(options, module.language, pe.is_xbox());

            if !found_issue && options.enforces_spectre() {
                if let Some(family) = MachineFamily::classify(pe.machine) {
                    let mitigations = spectre.available_mitigations(family, actual);
                    let unmitigated = !mitigations.contains(&CompilerMitigation::QSpectre)
                        && !mitigations.contains(&CompilerMitigation::D2GuardSpecLoad);
                    // A family with no upgrade path has no Spectre timeline to
                    // enforce; only flag versions an upgrade would fix.
                    found_issue = unmitigated
                        && spectre.closest_mitigated_version(family, actual).is_some();
                }
            }

            if found_issue {
                out_of_policy.entry(module.language).or_default().push(module);
            } else {
                in_policy.insert(format!(
                    "{}:{}:{}",
                    module.compiler_name, module.language, module.back_end_version
                ));
            }
        }

        if !out_of_policy.is_empty() {
            let mut minimums = Vec::with_capacity(out_of_policy.len());
            let mut blocks = Vec::with_capacity(out_of_policy.len());
            for (language, modules) in &out_of_policy {
                minimums.push(format!(
                    "{} ({})",
                    language,
                    minimum_version(options, *language, pe.is_xbox())
                ));
                blocks.push(shared::coalesce_by_compiler(modules.iter().copied()));
            }
            return vec![RuleResult::warning(format!(
                "'{}' was compiled with one or more modules which were not built using \
                 minimum required tool versions ({}). More recent toolchains contain \
                 mitigations that make it more difficult for an attacker to exploit \
                 vulnerabilities in programs they produce. To resolve this issue, compile \
                 and/or link your binary with more recent tools. If you are servicing a \
                 product where the tool chain cannot be modified (e.g. producing a hotfix \
                 for an already shipped version) ignore this warning. Modules built \
                 outside of policy: {}",
                ctx.target.file_name,
                minimums.join(", "),
                blocks.join("; "),
            ))];
        }

        let observed: Vec<&str> = in_policy.iter().map(String::as_str).collect();
        vec![RuleResult::pass(format!(
            "All linked modules of '{}' satisfy configured policy (observed compilers: {}).",
            ctx.target.file_name,
            observed.join(", "),
        ))]
    }
}

/// BA2007: modules must be compiled at warning level 3 or above, without
/// disabling warnings the policy requires.
pub struct EnableCriticalCompilerWarnings;

const MINIMUM_WARNING_LEVEL: u32 = 3;

impl Rule for EnableCriticalCompilerWarnings {
    fn id(&self) -> &'static str {
        "BA2007"
    }

    fn name(&self) -> &'static str {
        "EnableCriticalCompilerWarnings"
    }

    fn description(&self) -> &'static str {
        "Binaries should be compiled with a warning level that enables all critical \
         security-relevant checks. Enabling at least warning level 3 enables important \
         static analysis in the compiler that can identify bugs with a potential to \
         provoke memory corruption, information disclosure, or double-free \
         vulnerabilities. To resolve this issue, compile at warning level 3 or higher \
         by supplying /W3, /W4, or /Wall to the compiler, and resolve the warnings \
         emitted."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let pe = match shared::pe_binary(ctx) {
            Ok(pe) => pe,
            Err(gate) => return gate,
        };
        if let Err(gate) = shared::debug_info_can_analyze(pe) {
            return gate;
        }
        if pe.is_il_only() {
            return shared::skip(reasons::IL_ONLY_ASSEMBLY);
        }
        if pe.is_resource_only() {
            return shared::skip(reasons::RESOURCE_ONLY);
        }
        Applicability::Applicable
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let debug_info = match shared::require_debug_info(ctx, self.name()) {
            Ok(info) => info,
            Err(result) => return vec![result],
        };

        let required = &ctx.policy.rules.compiler_warnings.required_warnings;
        let max_records = ctx.max_evidence_records();

        let mut too_low_modules = TruncatedRecordList::with_max_records(max_records);
        let mut disabled_modules = TruncatedRecordList::with_max_records(max_records);
        let mut unknown_language_modules = TruncatedRecordList::with_max_records(max_records);

        let mut overall_minimum_level = u32::MAX;
        let mut example_too_low_command_line: Option<&str> = None;
        let mut example_disabled_command_line: Option<&str> = None;

        for module in &debug_info.modules {
            // Detection applies to output of the Microsoft native compiler only.
            if module.compiler_name != MICROSOFT_NATIVE_COMPILER {
                continue;
            }

            if module.language == ModuleLanguage::Unknown {
                // Only worth reporting when the module contributed code that
                // actually runs.
                if module.contributes_to_executable_section {
                    unknown_language_modules.add(module.record());
                }
                continue;
            }

            if !matches!(module.language, ModuleLanguage::C | ModuleLanguage::Cxx) {
                continue;
            }

            if !module.has_functions {
                continue;
            }

            let command_line = module.command_line();
            let warning_level = command_line.warning_level();
            let disabled_required: Vec<u32> = command_line
                .explicitly_disabled_warnings()
                .into_iter()
                .filter(|id| required.contains(id))
                .collect();

            overall_minimum_level = overall_minimum_level.min(warning_level);

            if warning_level < MINIMUM_WARNING_LEVEL {
                example_too_low_command_line.get_or_insert(&module.command_line);
                too_low_modules.add(
                    module.record_with_suffix(&format!("[warning level: {}]", warning_level)),
                );
            }

            if !disabled_required.is_empty() {
                example_disabled_command_line.get_or_insert(&module.command_line);
                let ids: Vec<String> =
                    disabled_required.iter().map(u32::to_string).collect();
                disabled_modules.add(module.record_with_suffix(&format!(
                    "[Explicitly disabled warnings: {}]",
                    ids.join(";")
                )));
            }
        }

        if unknown_language_modules.is_empty()
            && example_too_low_command_line.is_none()
            && example_disabled_command_line.is_none()
        {
            return vec![RuleResult::pass(format!(
                "'{}' was compiled at a secure warning level ({}) and does not include \
                 any modules that disable specific warnings which are required by \
                 policy. As a result, there is a greater likelihood that memory \
                 corruption, information disclosure, double-free and other \
                 security-related vulnerabilities do not exist in code.",
                ctx.target.file_name, overall_minimum_level,
            ))];
        }

        let mut results = Vec::new();

        if !unknown_language_modules.is_empty() {
            results.push(
                RuleResult::error(format!(
                    "'{}' contains code from an unknown language, preventing a \
                     comprehensive analysis of the compiler warning settings. The \
                     language could not be identified for the following modules:",
                    ctx.target.file_name,
                ))
                .with_evidence(unknown_language_modules.create_sorted_object_list()),
            );
        }

        if let Some(command_line) = example_too_low_command_line {
            results.push(
                RuleResult::error(format!(
                    "'{}' was compiled at too low a warning level (observed minimum \
                     level {}). Warning level 3 enables important static analysis in \
                     the compiler to flag bugs that can lead to memory corruption, \
                     information disclosure, or double-free vulnerabilities. To \
                     resolve this issue, compile at warning level 3 or higher by \
                     supplying /W3, /W4, or /Wall to the compiler, and resolve the \
                     warnings emitted. An example compiler command line triggering \
                     this check: {}. Modules triggering this check:",
                    ctx.target.file_name, overall_minimum_level, command_line,
                ))
                .with_evidence(too_low_modules.create_truncated_object_list()),
            );
        }

        if let Some(command_line) = example_disabled_command_line {
            results.push(
                RuleResult::error(format!(
                    "'{}' disables compiler warning(s) which are required by policy. A \
                     compiler warning is typically required if it has a high likelihood \
                     of flagging memory corruption, information disclosure, or \
                     double-free vulnerabilities. To resolve this issue, enable the \
                     indicated warning(s) by removing /Wxxxx switches (where xxxx is a \
                     warning id indicated here) from your command line, and resolve any \
                     warnings subsequently raised during compilation. An example \
                     compiler command line triggering this check was: {}. Modules \
                     triggering this check were:",
                    ctx.target.file_name, command_line,
                ))
                .with_evidence(disabled_modules.create_truncated_object_list()),
            );
        }

        results
    }
}
