//! Checks for Apple Mach-O binaries.
//!
//! Universal binaries are judged slice by slice; one unhardened architecture
//! fails the whole image.

use crate::engine::results::RuleResult;
use crate::rules::{reasons, shared, AnalysisContext, Applicability, Rule};

/// BA5001: executable slices must carry the MH_PIE header flag.
pub struct EnablePositionIndependentExecutable;

impl Rule for EnablePositionIndependentExecutable {
    fn id(&self) -> &'static str {
        "BA5001"
    }

    fn name(&self) -> &'static str {
        "EnablePositionIndependentExecutable"
    }

    fn description(&self) -> &'static str {
        "A Position Independent Executable (PIE) relocates all of its sections at load \
         time, including the code section, if ASLR is enabled in the kernel (instead \
         of just the stack/heap). This makes ROP-style attacks more difficult. This \
         can be enabled by passing '-f pie' to clang/gcc."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let macho = match shared::macho_binary(ctx) {
            Ok(macho) => macho,
            Err(gate) => return gate,
        };
        if !macho.any_executable() {
            return shared::skip(reasons::MACHO_NOT_ANALYZABLE);
        }
        Applicability::Applicable
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let Some(macho) = ctx.target.macho() else {
            return Vec::new();
        };

        for slice in &macho.slices {
            if slice.is_executable() && !slice.has_pie_flag() {
                return vec![RuleResult::error(format!(
                    "PIE disabled on executable '{}'. This means the code section \
                     will always be loaded to the same address, even if ASLR is \
                     enabled in the kernel. To address this, ensure you are compiling \
                     with '-fpie' when using clang/gcc.",
                    ctx.target.file_name,
                ))];
            }
        }

        vec![RuleResult::pass(format!(
            "PIE enabled on executable '{}'.",
            ctx.target.file_name,
        ))]
    }
}

/// BA5002: no slice may opt in to stack execution.
pub struct DoNotAllowExecutableStack;

impl Rule for DoNotAllowExecutableStack {
    fn id(&self) -> &'static str {
        "BA5002"
    }

    fn name(&self) -> &'static str {
        "DoNotAllowExecutableStack"
    }

    fn description(&self) -> &'static str {
        "This checks if a binary has an executable stack; an executable stack allows \
         attackers to redirect code flow into stack memory, which is an easy place \
         for an attacker to store shellcode. Ensure do not enable flag \
         '--allow_stack_execute'."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let macho = match shared::macho_binary(ctx) {
            Ok(macho) => macho,
            Err(gate) => return gate,
        };
        if !macho.any_executable_or_dylib() {
            return shared::skip(reasons::MACHO_NOT_ANALYZABLE);
        }
        Applicability::Applicable
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let Some(macho) = ctx.target.macho() else {
            return Vec::new();
        };

        let allows_execution = macho
            .slices
            .iter()
            .any(|s| (s.is_executable() || s.is_dylib()) && s.allows_stack_execution());

        if allows_execution {
            return vec![RuleResult::error(format!(
                "Executable stack is allowed on executable '{}'. An attacker can \
                 redirect code flow into stack memory and use it to store shellcode. \
                 Ensure you do not link with the flag '--allow_stack_execute'.",
                ctx.target.file_name,
            ))];
        }

        vec![RuleResult::pass(format!(
            "Executable stack is not allowed on executable '{}'.",
            ctx.target.file_name,
        ))]
    }
}
