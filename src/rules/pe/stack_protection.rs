//! Stack protector (/GS) checks.

use crate::binary::debug_info::{ModuleLanguage, MICROSOFT_NATIVE_COMPILER};
use crate::engine::results::RuleResult;
use crate::evidence::TruncatedRecordList;
use crate::rules::{shared, AnalysisContext, Applicability, Rule};

/// BA2011: every native C/C++ module must carry stack protector codegen.
pub struct EnableStackProtection;

impl Rule for EnableStackProtection {
    fn id(&self) -> &'static str {
        "BA2011"
    }

    fn name(&self) -> &'static str {
        "EnableStackProtection"
    }

    fn description(&self) -> &'static str {
        "Binaries should be built with the stack protector buffer security feature (/GS) \
         enabled in order to increase the difficulty of exploiting stack buffer overflow \
         memory corruption vulnerabilities. To resolve this issue, ensure that all modules \
         compiled into the binary are compiled with the stack protector enabled by \
         supplying /GS on the Visual C++ compiler command line."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let pe = match shared::pe_binary(ctx) {
            Ok(pe) => pe,
            Err(gate) => return gate,
        };
        if let Err(gate) = shared::debug_info_can_analyze(pe) {
            return gate;
        }
        shared::stack_protection_can_analyze(pe)
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let debug_info = match shared::require_debug_info(ctx, self.name()) {
            Ok(info) => info,
            Err(result) => return vec![result],
        };

        let max_records = ctx.max_evidence_records();
        let mut no_gs_modules = TruncatedRecordList::with_max_records(max_records);
        let mut unknown_language_modules = TruncatedRecordList::with_max_records(max_records);

        for module in &debug_info.modules {
            // Detection applies to output of the Microsoft native compiler only.
            if module.compiler_name != MICROSOFT_NATIVE_COMPILER {
                continue;
            }

            if module.language == ModuleLanguage::Unknown {
                if module.contributes_to_executable_section {
                    unknown_language_modules.add(module.record());
                }
                continue;
            }

            if !matches!(module.language, ModuleLanguage::C | ModuleLanguage::Cxx) {
                continue;
            }

            if !module.has_security_checks && module.has_functions {
                no_gs_modules.add(module.record());
            }
        }

        if unknown_language_modules.is_empty() && no_gs_modules.is_empty() {
            return vec![RuleResult::pass(format!(
                "'{}' is a C or C++ binary built with the stack protector buffer security \
                 feature enabled for all modules, making it more difficult for an attacker \
                 to exploit stack buffer overflow memory corruption vulnerabilities.",
                ctx.target.file_name,
            ))];
        }

        let mut results = Vec::new();

        if !unknown_language_modules.is_empty() {
            results.push(
                RuleResult::error(format!(
                    "'{}' contains code from unknown language, preventing a comprehensive \
                     analysis of the stack protector buffer security features. The \
                     language could not be identified for the following modules:",
                    ctx.target.file_name,
                ))
                .with_evidence(unknown_language_modules.create_sorted_object_list()),
            );
        }

        if !no_gs_modules.is_empty() {
            results.push(
                RuleResult::error(format!(
                    "'{}' is a C or C++ binary built with the stack protector buffer \
                     security feature disabled in one or more modules. The stack \
                     protector (/GS) is a security feature of the compiler which makes \
                     it more difficult to exploit stack buffer overflow memory \
                     corruption vulnerabilities. To resolve this issue, ensure that \
                     your code is compiled with the stack protector enabled by \
                     supplying /GS on the Visual C++ compiler command line. The \
                     affected modules were:",
                    ctx.target.file_name,
                ))
                .with_evidence(no_gs_modules.create_truncated_object_list()),
            );
        }

        results
    }
}

/// BA2014: no individual function may opt out of the stack protector via
/// `__declspec(safebuffers)`, outside the approved set.
pub struct DoNotDisableStackProtectionForFunctions;

impl Rule for DoNotDisableStackProtectionForFunctions {
    fn id(&self) -> &'static str {
        "BA2014"
    }

    fn name(&self) -> &'static str {
        "DoNotDisableStackProtectionForFunctions"
    }

    fn description(&self) -> &'static str {
        "Application code should not disable stack protection for individual functions. \
         The stack protector (/GS) is a security feature of the Windows native compiler \
         which makes it more difficult to exploit stack buffer overflow memory corruption \
         vulnerabilities. Disabling the stack protector, even on a function-by-function \
         basis, can compromise the security of code. To resolve this issue, remove \
         occurrences of __declspec(safebuffers) from your code. If the additional code \
         inserted by the stack protector has been shown in profiling to cause a \
         significant performance problem for your application, attempt to move stack \
         buffer modifications out of the hot path of execution to allow the compiler to \
         avoid inserting stack protector checks in these locations rather than disabling \
         the stack protector altogether."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let pe = match shared::pe_binary(ctx) {
            Ok(pe) => pe,
            Err(gate) => return gate,
        };
        if let Err(gate) = shared::debug_info_can_analyze(pe) {
            return gate;
        }
        shared::stack_protection_can_analyze(pe)
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let debug_info = match shared::require_debug_info(ctx, self.name()) {
            Ok(info) => info,
            Err(result) => return vec![result],
        };

        let approved = &ctx.policy.rules.stack_protection.approved_functions;

        let names: Vec<&str> = debug_info
            .safe_buffers_functions
            .iter()
            .map(String::as_str)
            // The cookie setup function necessarily runs before protection
            // exists, so it is always exempt.
            .filter(|name| *name != "__security_init_cookie" && !approved.contains(*name))
            .collect();

        if !names.is_empty() {
            return vec![RuleResult::error(format!(
                "'{}' is a C or C++ binary built with function(s) ({}) that disable the \
                 stack protector. The stack protector (/GS) is a security feature of the \
                 compiler which makes it more difficult to exploit stack buffer overflow \
                 memory corruption vulnerabilities. Disabling the stack protector, even \
                 on a function-by-function basis, is disallowed by SDL policy. To resolve \
                 this issue, remove occurrences of __declspec(safebuffers) from your \
                 code. If the additional code inserted by the stack protector has been \
                 shown in profiling to cause a significant performance problem for your \
                 application, attempt to move stack buffer modifications out of the hot \
                 path of execution to allow the compiler to avoid inserting stack \
                 protector checks in these locations rather than disabling the stack \
                 protector altogether.",
                ctx.target.file_name,
                names.join(";"),
            ))];
        }

        vec![RuleResult::pass(format!(
            "'{}' is a C or C++ binary built with the stack protector buffer security \
             feature enabled which does not disable protection for any individual \
             functions (via __declspec(safebuffers), making it more difficult for an \
             attacker to exploit stack buffer overflow memory corruption \
             vulnerabilities.",
            ctx.target.file_name,
        ))]
    }
}
