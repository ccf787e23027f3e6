//! Load-time hardening checks: PIE, stack executability, stack protector.

use crate::binary::elf::{ET_DYN, ET_EXEC};
use crate::engine::results::RuleResult;
use crate::rules::{shared, AnalysisContext, Applicability, Rule};

/// BA3001: executables must relocate their code section under ASLR.
pub struct EnablePositionIndependentExecutable;

impl Rule for EnablePositionIndependentExecutable {
    fn id(&self) -> &'static str {
        "BA3001"
    }

    fn name(&self) -> &'static str {
        "EnablePositionIndependentExecutable"
    }

    fn description(&self) -> &'static str {
        "A Position Independent Executable (PIE) relocates all of its sections at load \
         time, including the code section, if ASLR is enabled in the Linux kernel \
         (instead of just the stack/heap). This makes ROP-style attacks more difficult. \
         This can be enabled by passing '-f pie' to clang/gcc."
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

        if elf.e_type == ET_EXEC {
            return vec![RuleResult::error(format!(
                "PIE disabled on executable '{}'. This means the code section will \
                 always be loaded to the same address, even if ASLR is enabled in the \
                 Linux kernel. To address this, ensure you are compiling with '-fpie' \
                 when using clang/gcc.",
                ctx.target.file_name,
            ))];
        }

        if elf.e_type == ET_DYN {
            // An executable shared object carries a program header segment;
            // a plain library normally does not.
            if elf.has_program_header_segment {
                return vec![RuleResult::pass(format!(
                    "PIE enabled on executable '{}'.",
                    ctx.target.file_name,
                ))];
            }
            return vec![RuleResult::pass(format!(
                "'{}' is a shared object library rather than an executable, and is \
                 automatically position independent.",
                ctx.target.file_name,
            ))];
        }

        Vec::new()
    }
}

/// BA3002: the GNU_STACK segment must be present and non-executable.
pub struct DoNotMarkStackAsExecutable;

impl Rule for DoNotMarkStackAsExecutable {
    fn id(&self) -> &'static str {
        "BA3002"
    }

    fn name(&self) -> &'static str {
        "DoNotMarkStackAsExecutable"
    }

    fn description(&self) -> &'static str {
        "This checks if a binary has an executable stack; an executable stack allows \
         attackers to redirect code flow into stack memory, which is an easy place for \
         an attacker to store shellcode. Ensure you are compiling with '-z noexecstack' \
         to mark the stack as non-executable."
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

        match elf.is_executable_stack() {
            Some(true) => vec![RuleResult::error(format!(
                "Stack on '{}' is executable, which means that an attacker could use \
                 it as a place to store attack shellcode. Ensure you are compiling \
                 with '-z noexecstack' to mark the stack as non-executable.",
                ctx.target.file_name,
            ))],
            Some(false) => vec![RuleResult::pass(format!(
                "GNU_STACK segment marked as non-executable on '{}'.",
                ctx.target.file_name,
            ))],
            // Without the segment the loader falls back to an executable stack.
            None => vec![RuleResult::error(format!(
                "GNU_STACK segment on '{}' is missing, which means the stack will \
                 likely be loaded as executable. Ensure you are using an up to date \
                 compiler and passing '-z noexecstack' to the compiler.",
                ctx.target.file_name,
            ))],
        }
    }
}

/// Runtime symbols inserted by stack protector codegen.
const STACK_CHECK_SYMBOLS: &[&str] = &["__stack_chk_fail", "__stack_chk_fail_local"];

/// BA3003: functions with large buffers must carry stack cookies.
pub struct EnableStackProtector;

impl Rule for EnableStackProtector {
    fn id(&self) -> &'static str {
        "BA3003"
    }

    fn name(&self) -> &'static str {
        "EnableStackProtector"
    }

    fn description(&self) -> &'static str {
        "The stack protector ensures that all functions that use buffers over a certain \
         size will use a stack cookie (and check it) to prevent stack based buffer \
         overflows, exiting if stack smashing is detected. Use \
         '--fstack-protector-strong' (all buffers of 4 bytes or more) or \
         '--fstack-protector-all' (all functions) to enable this."
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

        if STACK_CHECK_SYMBOLS.iter().any(|sym| elf.has_symbol(sym)) {
            return vec![RuleResult::pass(format!(
                "Stack protector was found on '{}'. However, if you are not compiling \
                 with '--stack-protector-strong', it may provide additional \
                 protections.",
                ctx.target.file_name,
            ))];
        }

        vec![RuleResult::error(format!(
            "The stack protector was not found in '{}'. This may be because \
             '--stack-protector-strong' was not used, or because it was explicitly \
             disabled by '-fno-stack-protectors'.",
            ctx.target.file_name,
        ))]
    }
}
