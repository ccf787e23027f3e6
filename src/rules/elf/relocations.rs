//! Relocation table hardening: RELRO and eager binding.

use crate::engine::results::RuleResult;
use crate::rules::{shared, AnalysisContext, Applicability, Rule};

/// BA3010: relocation data must be remapped read-only after loading.
pub struct EnableReadOnlyRelocations;

impl Rule for EnableReadOnlyRelocations {
    fn id(&self) -> &'static str {
        "BA3010"
    }

    fn name(&self) -> &'static str {
        "EnableReadOnlyRelocations"
    }

    fn description(&self) -> &'static str {
        "This check ensures that some relocation data is marked as read only after the \
         executable is loaded, and moved below the '.data' section in memory. This \
         prevents them from being overwritten, which can redirect control flow. Use the \
         compiler flags '-Wl,z,relro' to enable this."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        match shared::elf_binary(ctx) {
            Ok(_) => Applicability::Applicable,
            Err(gate) => gate,
        }
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let Some(elf) = ctx.target.elf() else {
            return Vec::new();
        };

        if elf.has_gnu_relro {
            return vec![RuleResult::pass(format!(
                "The GNU_RELRO segment was present, so '{}' is protected.",
                ctx.target.file_name,
            ))];
        }

        vec![RuleResult::error(format!(
            "The GNU_RELRO segment is missing from '{}', so relocation sections will \
             not be marked as read only after the binary is loaded. An attacker can \
             overwrite them to redirect control flow. Ensure you are compiling with \
             the compiler flags '-Wl,z,relro' to address this.",
            ctx.target.file_name,
        ))]
    }
}

/// BA3011: the loader must resolve all imported symbols eagerly.
pub struct EnableBindNow;

impl Rule for EnableBindNow {
    fn id(&self) -> &'static str {
        "BA3011"
    }

    fn name(&self) -> &'static str {
        "EnableBindNow"
    }

    fn description(&self) -> &'static str {
        "This check ensures that some relocation data is marked as read only after the \
         executable is loaded, and moved below the '.data' section in memory. This \
         prevents them from being overwritten, which can redirect control flow. Use the \
         compiler flags '-Wl,z,now' to enable this."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        match shared::elf_binary(ctx) {
            Ok(_) => Applicability::Applicable,
            Err(gate) => gate,
        }
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let Some(elf) = ctx.target.elf() else {
            return Vec::new();
        };

        if elf.bind_now {
            return vec![RuleResult::pass(format!(
                "The BIND_NOW flag was present, so '{}' is protected.",
                ctx.target.file_name,
            ))];
        }

        vec![RuleResult::error(format!(
            "The BIND_NOW flag is missing from '{}', so procedure linkage table \
             entries are resolved lazily and stay writable at run time. An attacker \
             can overwrite them to redirect control flow. Ensure you are compiling \
             with the compiler flags '-Wl,z,now' to address this.",
            ctx.target.file_name,
        ))]
    }
}
