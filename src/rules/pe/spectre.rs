//! Speculative execution (Spectre) mitigation check.

use crate::binary::debug_info::{
    ModuleLanguage, ObjectModule, OrderOfPrecedence, SwitchState, MICROSOFT_NATIVE_COMPILER,
};
use crate::config::{CompilerMitigation, MachineFamily};
use crate::engine::results::RuleResult;
use crate::rules::{reasons, shared, AnalysisContext, Applicability, Rule};

const MITIGATION_SWITCHES: &[&str] = &["Qspectre", "guardspecload"];
const OD_SWITCHES: &[&str] = &["Od"];
// These switches override /Od; there is no one place where this is documented.
const OPTIMIZE_SWITCHES: &[&str] = &["O1", "O2", "Ox", "Og"];

/// BA2024: modules must be compiled by a toolset that provides Spectre
/// mitigations, with the mitigation switch enabled and optimizations on.
pub struct EnableSpectreMitigations;

impl Rule for EnableSpectreMitigations {
    fn id(&self) -> &'static str {
        "BA2024"
    }

    fn name(&self) -> &'static str {
        "EnableSpectreMitigations"
    }

    fn description(&self) -> &'static str {
        "Application code should be compiled with the most up-to-date toolsets possible \
         in order to take advantage of the most current compile-time security features."
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
        if pe.is_native_universal_windows_platform() {
            return shared::skip(reasons::NATIVE_UWP);
        }
        if MachineFamily::classify(pe.machine).is_none() {
            return shared::skip(reasons::NO_SPECTRE_MITIGATIONS_FOR_ARCHITECTURE);
        }
        Applicability::Applicable
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let Some(pe) = ctx.target.pe() else {
            return Vec::new();
        };
        let Some(family) = MachineFamily::classify(pe.machine) else {
            return Vec::new();
        };
        let debug_info = match shared::require_debug_info(ctx, self.name()) {
            Ok(info) => info,
            Err(result) => return vec![result],
        };

        let options = &ctx.policy.rules.spectre;

        let mut masm_modules: Vec<&ObjectModule> = Vec::new();
        let mut not_enabled_modules: Vec<&ObjectModule> = Vec::new();
        let mut od_modules: Vec<&ObjectModule> = Vec::new();
        let mut explicitly_disabled_modules: Vec<&ObjectModule> = Vec::new();

        for module in &debug_info.modules {
            if let Some(key) = module.allow_list_key() {
                if let Some(allowed_from) = options.allowed_libraries.get(&key) {
                    if module.back_end_version >= *allowed_from {
                        continue;
                    }
                }
            }

            // IL-only images were gated out above, so judge the native
            // languages and the ones that appear in mixed binaries.
            match module.language {
                ModuleLanguage::C | ModuleLanguage::Cxx => {
                    if module.compiler_name != MICROSOFT_NATIVE_COMPILER {
                        continue;
                    }
                }
                ModuleLanguage::Masm => {
                    masm_modules.push(module);
                    continue;
                }
                // Neither the linker nor the resource and shader compilers
                // insert mitigations; IL is the runtime's responsibility.
                _ => continue,
            }

            let version = module.back_end_version;
            let available = options.available_mitigations(family, version);
            if available.is_empty() {
                // Toolsets with no mitigation support at all are reported by
                // the minimum-version check instead.
                continue;
            }

            let command_line = module.command_line();
            let effective = command_line.switch_state(
                MITIGATION_SWITCHES,
                &[],
                SwitchState::Disabled,
                OrderOfPrecedence::LastWins,
            );

            if effective == SwitchState::Disabled {
                let mut qspectre = SwitchState::NotFound;
                let mut guardspecload = SwitchState::NotFound;

                if available.contains(&CompilerMitigation::QSpectre) {
                    qspectre = command_line.switch_state(
                        &MITIGATION_SWITCHES[..1],
                        &[],
                        SwitchState::NotFound,
                        OrderOfPrecedence::LastWins,
                    );
                }
                if available.contains(&CompilerMitigation::D2GuardSpecLoad) {
                    // /d2xxxx switches are recorded without the d2 prefix.
                    guardspecload = command_line.switch_state(
                        &MITIGATION_SWITCHES[1..],
                        &[],
                        SwitchState::NotFound,
                        OrderOfPrecedence::LastWins,
                    );
                }

                if qspectre == SwitchState::NotFound && guardspecload == SwitchState::NotFound {
                    not_enabled_modules.push(module);
                } else {
                    explicitly_disabled_modules.push(module);
                }
                continue;
            }

            if !available.contains(&CompilerMitigation::NonoptimizedCodeMitigated)
                && command_line.switch_state(
                    OD_SWITCHES,
                    OPTIMIZE_SWITCHES,
                    SwitchState::Enabled,
                    OrderOfPrecedence::LastWins,
                ) == SwitchState::Enabled
            {
                od_modules.push(module);
            }
        }

        let mut blocks = Vec::new();
        if !explicitly_disabled_modules.is_empty() {
            blocks.push(format!(
                "The following modules were compiled with Spectre mitigations explicitly \
                 disabled: {}",
                shared::coalesce_by_library(explicitly_disabled_modules),
            ));
        }
        if !not_enabled_modules.is_empty() {
            blocks.push(format!(
                "The following modules were compiled with a toolset that supports \
                 /Qspectre but the switch was not enabled on the command-line: {}",
                shared::coalesce_by_library(not_enabled_modules),
            ));
        }
        if !od_modules.is_empty() {
            blocks.push(format!(
                "The following modules were compiled with optimizations disabled (/Od), \
                 a condition that disables Spectre mitigations: {}",
                shared::coalesce_by_library(od_modules),
            ));
        }
        if options.report_masm_modules && !masm_modules.is_empty() {
            blocks.push(format!(
                "The following modules were compiled from assembly language, where \
                 Spectre mitigations must be applied by hand: {}",
                shared::coalesce_by_library(masm_modules),
            ));
        }

        if !blocks.is_empty() {
            return vec![RuleResult::warning(format!(
                "'{}' was compiled with one or more modules that do not properly enable \
                 code generation mitigations for speculative execution side-channel \
                 attack (Spectre) vulnerabilities. Spectre attacks can compromise \
                 hardware-based isolation, allowing non-privileged users to retrieve \
                 potentially sensitive data from the CPU cache. To resolve the issue, \
                 provide the /Qspectre switch on the compiler command-line (or \
                 /d2guardspecload in cases where your compiler supports this switch and \
                 it is not possible to update to a toolset that supports /Qspectre). The \
                 following modules are out of policy:",
                ctx.target.file_name,
            ))
            .with_evidence(blocks.join("\n"))];
        }

        vec![RuleResult::pass(format!(
            "All linked modules of '{}' were compiled with mitigations enabled that help \
             prevent Spectre (speculative execution side-channel attack) vulnerabilities.",
            ctx.target.file_name,
        ))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::debug_info::DebugInfo;
    use crate::binary::TargetImage;
    use crate::config::Policy;
    use crate::engine::results::ResultLevel;
    use crate::rules::test_support;

    fn module(object: &str, version: &str, command_line: &str) -> ObjectModule {
        ObjectModule {
            object: object.to_string(),
            library: None,
            language: ModuleLanguage::Cxx,
            compiler_name: MICROSOFT_NATIVE_COMPILER.to_string(),
            front_end_version: version.parse().unwrap(),
            back_end_version: version.parse().unwrap(),
            command_line: command_line.to_string(),
            has_security_checks: true,
            has_functions: true,
            contributes_to_executable_section: true,
        }
    }

    fn image_with_modules(modules: Vec<ObjectModule>) -> TargetImage {
        let mut image = test_support::pe_image(test_support::pe_metadata());
        image.debug_info = Some(DebugInfo {
            modules,
            safe_buffers_functions: Vec::new(),
        });
        image
    }

    #[test]
    fn mitigated_modules_pass() {
        let image = image_with_modules(vec![module(
            "a.obj",
            "19.16.27034.0",
            "/W4 /O2 /Qspectre",
        )]);
        let policy = Policy::default();

        let results = EnableSpectreMitigations.analyze(&test_support::context(&image, &policy));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].level, ResultLevel::Pass);
    }

    #[test]
    fn missing_switch_is_reported_as_not_enabled() {
        let image = image_with_modules(vec![module("a.obj", "19.16.27034.0", "/W4 /O2")]);
        let policy = Policy::default();

        let results = EnableSpectreMitigations.analyze(&test_support::context(&image, &policy));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].level, ResultLevel::Warning);
        let evidence = results[0].evidence.as_deref().unwrap();
        assert!(evidence.contains("switch was not enabled"));
        assert!(evidence.contains("a.obj"));
    }

    #[test]
    fn trailing_minus_counts_as_explicitly_disabled() {
        let image = image_with_modules(vec![module(
            "off.obj",
            "19.16.27034.0",
            "/W4 /O2 /Qspectre-",
        )]);
        let policy = Policy::default();

        let results = EnableSpectreMitigations.analyze(&test_support::context(&image, &policy));
        let evidence = results[0].evidence.as_deref().unwrap();
        assert!(evidence.contains("explicitly disabled"));
    }

    #[test]
    fn unoptimized_build_defeats_older_toolset_mitigations() {
        // 19.13.26118 supports /Qspectre but does not mitigate /Od builds.
        let image = image_with_modules(vec![module(
            "dbg.obj",
            "19.13.26118.0",
            "/Od /Qspectre",
        )]);
        let policy = Policy::default();

        let results = EnableSpectreMitigations.analyze(&test_support::context(&image, &policy));
        assert_eq!(results[0].level, ResultLevel::Warning);
        let evidence = results[0].evidence.as_deref().unwrap();
        assert!(evidence.contains("optimizations disabled (/Od)"));

        // From 19.14.26329 on, unoptimized code is mitigated too.
        let modern = image_with_modules(vec![module(
            "dbg.obj",
            "19.16.27034.0",
            "/Od /Qspectre",
        )]);
        let results = EnableSpectreMitigations.analyze(&test_support::context(&modern, &policy));
        assert_eq!(results[0].level, ResultLevel::Pass);
    }

    #[test]
    fn unsupported_toolset_is_left_to_the_version_check() {
        // 19.11 has no Spectre support at all, so this rule stays quiet.
        let image = image_with_modules(vec![module("gap.obj", "19.11.25506.0", "/W4 /O2")]);
        let policy = Policy::default();

        let results = EnableSpectreMitigations.analyze(&test_support::context(&image, &policy));
        assert_eq!(results[0].level, ResultLevel::Pass);
    }

    #[test]
    fn masm_modules_are_reported_only_on_request() {
        let mut asm = module("stubs.obj", "14.16.27034.0", "");
        asm.language = ModuleLanguage::Masm;
        let image = image_with_modules(vec![
            asm,
            module("a.obj", "19.16.27034.0", "/O2 /Qspectre"),
        ]);

        let policy = Policy::default();
        let results = EnableSpectreMitigations.analyze(&test_support::context(&image, &policy));
        assert_eq!(results[0].level, ResultLevel::Pass);

        let mut reporting = Policy::default();
        reporting.rules.spectre.report_masm_modules = true;
        let results = EnableSpectreMitigations.analyze(&test_support::context(&image, &reporting));
        assert_eq!(results[0].level, ResultLevel::Warning);
        let evidence = results[0].evidence.as_deref().unwrap();
        assert!(evidence.contains("assembly language"));
        assert!(evidence.contains("stubs.obj"));
    }

    #[test]
    fn unmitigable_architecture_is_out_of_scope() {
        let mut pe = test_support::pe_metadata();
        pe.machine = 0x0200; // IA64
        let image = test_support::pe_image(pe);
        let policy = Policy::default();

        let gate = EnableSpectreMitigations.can_analyze(&test_support::context(&image, &policy));
        assert_eq!(
            gate,
            Applicability::NotApplicableToTarget(
                reasons::NO_SPECTRE_MITIGATIONS_FOR_ARCHITECTURE.to_string()
            )
        );
    }
}
