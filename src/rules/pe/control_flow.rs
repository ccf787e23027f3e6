//! Control flow integrity checks: control flow guard and SafeSEH.

use crate::binary::pe::{
    LoadConfig, PeMetadata, IMAGE_FILE_MACHINE_I386, IMAGE_GUARD_CF_FUNCTION_TABLE_PRESENT,
    IMAGE_GUARD_CF_INSTRUMENTED,
};
use crate::engine::results::RuleResult;
use crate::rules::shared::{self, skip};
use crate::rules::{reasons, AnalysisContext, Applicability, Rule};
use crate::version::ToolVersion;

/// Both guard bits must be present for instrumentation to be considered
/// effective.
const IMAGE_GUARD_CF_CHECKS: u32 =
    IMAGE_GUARD_CF_INSTRUMENTED | IMAGE_GUARD_CF_FUNCTION_TABLE_PRESENT;

/// First toolset able to emit control flow guard metadata.
const CFG_MINIMUM_LINKER_VERSION: ToolVersion = ToolVersion::new(14, 0, 0, 0);

/// BA2008: enable control flow guard.
pub struct EnableControlFlowGuard;

impl EnableControlFlowGuard {
    fn enables_control_flow_guard(&self, pe: &PeMetadata) -> bool {
        if !pe.has_guard_cf_characteristic() {
            return false;
        }
        let Some(config) = &pe.load_config else {
            return false;
        };
        config.has_guard_fields(pe.is_64bit)
            && config.guard_cf_check_function_pointer != 0
            && config.guard_cf_function_table != 0
            && config.guard_flags & IMAGE_GUARD_CF_CHECKS == IMAGE_GUARD_CF_CHECKS
    }
}

impl Rule for EnableControlFlowGuard {
    fn id(&self) -> &'static str {
        "BA2008"
    }

    fn name(&self) -> &'static str {
        "EnableControlFlowGuard"
    }

    fn description(&self) -> &'static str {
        "Binaries should enable the compiler control guard feature (CFG) at build time to \
         prevent attackers from redirecting execution to unexpected, unsafe locations. CFG \
         analyzes and discovers all indirect-call instructions at compilation and link \
         time. It also injects a check that precedes every indirect call in code that \
         might be called at runtime. If the check fails at runtime, Windows closes the \
         program."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let pe = match shared::pe_binary(ctx) {
            Ok(pe) => pe,
            Err(gate) => return gate,
        };
        if pe.is_resource_only() {
            return skip(reasons::RESOURCE_ONLY);
        }
        if pe.is_il_only() {
            return skip(reasons::IL_ONLY_ASSEMBLY);
        }
        if pe.is_mixed_mode() {
            return skip(reasons::MANAGED_INTEROP);
        }
        if pe.is_kernel_mode() && !pe.is_64bit {
            return skip(reasons::KERNEL_MODE_32BIT);
        }
        if pe.is_boot() {
            return skip(reasons::BOOT);
        }
        if pe.linker_version < CFG_MINIMUM_LINKER_VERSION {
            return skip(&format!(
                "image was compiled with an outdated toolset (linker version {}) earlier \
                 than the minimum required ({})",
                pe.linker_version, CFG_MINIMUM_LINKER_VERSION
            ));
        }
        if pe.is_wix_binary() {
            return skip(reasons::WIX);
        }
        Applicability::Applicable
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let name = &ctx.target.file_name;
        let Some(pe) = ctx.target.pe() else {
            return Vec::new();
        };

        if !self.enables_control_flow_guard(pe) {
            return vec![RuleResult::error(format!(
                "'{}' does not enable the control flow guard (CFG) mitigation. To resolve \
                 this issue, pass /guard:cf on both the compiler and linker command lines. \
                 Binaries also require the /DYNAMICBASE linker option in order to enable \
                 CFG.",
                name
            ))];
        }

        vec![RuleResult::pass(format!(
            "'{}' enables the control flow guard mitigation.",
            name
        ))]
    }
}

/// BA2018: x86 binaries that handle structured exceptions must enable
/// SafeSEH.
pub struct EnableSafeSeh;

impl Rule for EnableSafeSeh {
    fn id(&self) -> &'static str {
        "BA2018"
    }

    fn name(&self) -> &'static str {
        "EnableSafeSEH"
    }

    fn description(&self) -> &'static str {
        "X86 binaries should enable the SafeSEH mitigation to minimize exploitable memory \
         corruption issues. SafeSEH makes it more difficult to exploit vulnerabilities \
         that permit overwriting SEH control blocks on the stack, by verifying that the \
         location to which a thrown SEH exception would jump is indeed defined as an \
         exception handler in the source program (and not shellcode)."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let pe = match shared::pe_binary(ctx) {
            Ok(pe) => pe,
            Err(gate) => return gate,
        };
        // SafeSEH only exists on x86; /SafeSEH is invalid when linking for
        // ARM and x64.
        if pe.machine != IMAGE_FILE_MACHINE_I386 {
            return skip(reasons::NOT_32_BIT);
        }
        if pe.is_xbox() {
            return skip(reasons::XBOX);
        }
        if pe.is_resource_only() {
            return skip(reasons::RESOURCE_ONLY);
        }
        Applicability::Applicable
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let name = &ctx.target.file_name;
        let Some(pe) = ctx.target.pe() else {
            return Vec::new();
        };

        // NO_SEH excludes images that never handle SEH exceptions, such as
        // ngen'd managed code, without raising false positives.
        if pe.has_no_seh() {
            return vec![RuleResult::pass(format!(
                "'{}' is an x86 binary that does not use SEH, making it an invalid target \
                 for exploits that attempt to replace SEH jump targets with \
                 attacker-controlled shellcode.",
                name
            ))];
        }

        let failure = |name: &str, kind: &str| {
            RuleResult::error(format!(
                "'{}' is an x86 binary which {}, indicating that it does not enable the \
                 SafeSEH mitigation. SafeSEH makes it more difficult to exploit memory \
                 corruption vulnerabilities that can overwrite SEH control blocks on the \
                 stack, by verifying that the location to which a thrown SEH exception \
                 would jump is indeed defined as an exception handler in the source \
                 program (and not shellcode). To resolve this issue, supply the /SafeSEH \
                 flag on the linker command line. Note that you will need to configure \
                 your build system to supply this flag for x86 builds only, as the \
                 /SafeSEH flag is invalid when linking for ARM and x64.",
                name, kind
            ))
        };

        let Some(config) = &pe.load_config else {
            return vec![failure(name, "does not contain a load configuration table")];
        };

        if config.size < LoadConfig::SEH_FIELDS_LEN {
            return vec![failure(
                name,
                &format!(
                    "contains an unexpectedly small load configuration table (size {})",
                    config.size
                ),
            )];
        }

        if config.se_handler_table == 0 {
            return vec![failure(
                name,
                "has an empty SE handler table in the load configuration table",
            )];
        }

        if config.se_handler_count == 0 {
            return vec![failure(
                name,
                "has zero SE handlers in the load configuration table",
            )];
        }

        vec![RuleResult::pass(format!(
            "'{}' is an x86 binary that enables SafeSEH, a mitigation that verifies SEH \
             exception jump targets are defined as exception handlers in the program (and \
             not shellcode).",
            name
        ))]
    }
}
