//! Data execution prevention checks: section permissions and the NXCompat
//! opt-in.

use crate::binary::pe::PAGE_SIZE;
use crate::engine::results::RuleResult;
use crate::rules::shared::{self, skip};
use crate::rules::{reasons, AnalysisContext, Applicability, Rule};

/// BA2010: the imports section must not live in executable memory.
pub struct DoNotMarkImportsSectionAsExecutable;

impl Rule for DoNotMarkImportsSectionAsExecutable {
    fn id(&self) -> &'static str {
        "BA2010"
    }

    fn name(&self) -> &'static str {
        "DoNotMarkImportsSectionAsExecutable"
    }

    fn description(&self) -> &'static str {
        "PE sections should not be marked as both writable and executable. Because the \
         loader will always mark the imports section as writable, it is therefore \
         important to mark this section as non-executable. To resolve this issue, ensure \
         that your program does not mark the imports section executable. Look for uses of \
         /SECTION or /MERGE on the linker command line, or #pragma segment in source code, \
         which change the imports section to be executable, or which merge the \".rdata\" \
         segment into an executable section."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let pe = match shared::pe_binary(ctx) {
            Ok(pe) => pe,
            Err(gate) => return gate,
        };
        if pe.is_kernel_mode() {
            return skip(reasons::KERNEL_MODE);
        }
        if pe.is_il_only() {
            return skip(reasons::IL_ONLY_ASSEMBLY);
        }
        Applicability::Applicable
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let name = &ctx.target.file_name;
        let Some(pe) = ctx.target.pe() else {
            return Vec::new();
        };

        let import_table = pe.directories.import_table;
        let executable_import_section = if import_table.is_present() {
            pe.sections.iter().find(|section| {
                section.is_executable()
                    && section.virtual_address <= import_table.rva
                    && section.virtual_address + section.size_of_raw_data
                        >= import_table.rva + import_table.size
            })
        } else {
            None
        };

        if executable_import_section.is_some() {
            return vec![RuleResult::error(format!(
                "'{}' has the imports section marked executable. Because the loader will \
                 always mark the imports section as writable, it is important to mark this \
                 section as non-executable, so that an attacker cannot place shellcode here. \
                 To resolve this issue, ensure that your program does not mark the imports \
                 section as executable. Look for uses of /SECTION or /MERGE on the linker \
                 command line, or #pragma segment in source code, which change the imports \
                 section to be executable, or which merge the \".rdata\" segment into an \
                 executable section.",
                name
            ))];
        }

        vec![RuleResult::pass(format!(
            "'{}' does not have an imports section that is marked as executable, helping \
             to prevent the exploitation of code vulnerabilities.",
            name
        ))]
    }
}

/// BA2016: images must declare data execution prevention support.
pub struct MarkImageAsNxCompatible;

impl Rule for MarkImageAsNxCompatible {
    fn id(&self) -> &'static str {
        "BA2016"
    }

    fn name(&self) -> &'static str {
        "MarkImageAsNXCompatible"
    }

    fn description(&self) -> &'static str {
        "Binaries should be marked as NX compatible to help prevent execution of code \
         stored in data segments. The NXCompat bit, also known as \"Data Execution \
         Prevention\" (DEP) or \"Execute Disable\" (XD), triggers a processor security \
         feature that allows a program to mark a piece of memory as non-executable."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let pe = match shared::pe_binary(ctx) {
            Ok(pe) => pe,
            Err(gate) => return gate,
        };
        // NX is implied on 64-bit Windows.
        if pe.is_64bit {
            return skip(reasons::IS_64_BIT);
        }
        if pe.is_kernel_mode() {
            return skip(reasons::KERNEL_MODE);
        }
        if pe.is_xbox() {
            return skip(reasons::XBOX);
        }
        if pe.is_resource_only() {
            return skip(reasons::RESOURCE_ONLY);
        }
        if pe.is_wince_pre7() {
            return skip(reasons::WINDOWS_CE_PRE_7);
        }
        if pe.is_boot() {
            return skip(reasons::BOOT);
        }
        Applicability::Applicable
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let name = &ctx.target.file_name;
        let Some(pe) = ctx.target.pe() else {
            return Vec::new();
        };

        if !pe.has_nx_compat() {
            return vec![RuleResult::error(format!(
                "'{}' is not marked NX compatible. The NXCompat bit, also known as \"Data \
                 Execution Prevention\" (DEP) or \"Execute Disable\" (XD), is a processor \
                 feature that allows a program to mark a piece of memory as non-executable. \
                 This helps mitigate memory corruption vulnerabilities by preventing an \
                 attacker from supplying direct shellcode in their exploit, because the \
                 exploit comes in the form of input data to the exploited program on a data \
                 segment, rather than on an executable code segment. To resolve this issue, \
                 ensure that your tool chain is configured to mark your binaries as NX \
                 compatible, e.g. by passing /NXCOMPAT to the C/C++ linker.",
                name
            ))];
        }

        vec![RuleResult::pass(format!(
            "'{}' is marked as NX compatible.",
            name
        ))]
    }
}

/// BA2019: no section may be both writable and shared across processes.
pub struct DoNotMarkWritableSectionsAsShared;

impl Rule for DoNotMarkWritableSectionsAsShared {
    fn id(&self) -> &'static str {
        "BA2019"
    }

    fn name(&self) -> &'static str {
        "DoNotMarkWritableSectionsAsShared"
    }

    fn description(&self) -> &'static str {
        "Code or data sections should not be marked as both shared and writable. Because \
         these sections are shared across processes, this condition might permit a process \
         with low privilege to alter memory in a higher privilege process. If you do not \
         actually require that a section be both writable and shared, remove one or both \
         of these attributes (by modifying your .DEF file, the appropriate linker /section \
         switch arguments, etc.). If you must share common data across processes (for \
         inter-process communication or other purposes) use CreateFileMapping with proper \
         security attributes or an actual IPC mechanism instead (COM, named pipes, LPC, \
         etc.)."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let pe = match shared::pe_binary(ctx) {
            Ok(pe) => pe,
            Err(gate) => return gate,
        };
        if pe.is_xbox() {
            return skip(reasons::XBOX);
        }
        Applicability::Applicable
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let name = &ctx.target.file_name;
        let Some(pe) = ctx.target.pe() else {
            return Vec::new();
        };

        let bad_sections: Vec<&str> = pe
            .sections
            .iter()
            .filter(|s| s.is_writable() && s.is_shared())
            .map(|s| s.name.as_str())
            .collect();

        if bad_sections.is_empty() {
            return vec![RuleResult::pass(format!(
                "Image '{}' contains no data or code sections marked as both shared and \
                 writable, helping to prevent the exploitation of code vulnerabilities.",
                name
            ))];
        }

        vec![RuleResult::error(format!(
            "'{}' contains PE section(s) ({}) that are both writable and shared. Writable \
             and shared sections permit a process with low privilege to alter memory in a \
             higher privilege process, and should be replaced with a proper inter-process \
             communication mechanism. To resolve this issue, configure your tools to not \
             emit memory sections that are writable and shared, for example by removing \
             the attributes in your .DEF file or the linker /section switch arguments.",
            name,
            bad_sections.join(";")
        ))]
    }
}

/// BA2021: no section may be both writable and executable, and section
/// alignment must not fall below the page size.
pub struct DoNotMarkWritableSectionsAsExecutable;

impl Rule for DoNotMarkWritableSectionsAsExecutable {
    fn id(&self) -> &'static str {
        "BA2021"
    }

    fn name(&self) -> &'static str {
        "DoNotMarkWritableSectionsAsExecutable"
    }

    fn description(&self) -> &'static str {
        "PE sections should not be marked as both writable and executable. This condition \
         makes it easier for an attacker to exploit memory corruption vulnerabilities, as \
         it may provide an attacker executable location(s) to inject shellcode. To resolve \
         this issue, configure your tools to not emit memory sections that are writable \
         and executable."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let pe = match shared::pe_binary(ctx) {
            Ok(pe) => pe,
            Err(gate) => return gate,
        };
        if pe.is_kernel_mode() {
            return skip(reasons::KERNEL_MODE);
        }
        Applicability::Applicable
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let name = &ctx.target.file_name;
        let Some(pe) = ctx.target.pe() else {
            return Vec::new();
        };

        // Sub-page alignment forces the loader to merge protection flags
        // across neighboring sections, defeating the per-section analysis.
        if pe.section_alignment < PAGE_SIZE {
            return vec![RuleResult::error(format!(
                "'{}' has a section alignment (0x{:x}) that is less than its page size \
                 (0x{:x}). This may reduce the granularity with which memory protections \
                 can be applied and invalidates this check.",
                name, pe.section_alignment, PAGE_SIZE
            ))];
        }

        let bad_sections: Vec<&str> = pe
            .sections
            .iter()
            .filter(|s| s.is_writable() && s.is_executable())
            .map(|s| s.name.as_str())
            .collect();

        if bad_sections.is_empty() {
            return vec![RuleResult::pass(format!(
                "'{}' contains no data or code sections marked as both writable and \
                 executable, helping to prevent the exploitation of code vulnerabilities.",
                name
            ))];
        }

        vec![RuleResult::error(format!(
            "'{}' contains PE section(s) ({}) that are both writable and executable. \
             Writable and executable memory segments make it easier for an attacker to \
             exploit memory corruption vulnerabilities, because it may give an attacker \
             executable location(s) to inject shellcode. To resolve this issue, configure \
             your tools to not emit memory sections that are writable and executable. For \
             example, look for uses of /SECTION on the linker command line for C and C++ \
             programs, or #pragma section in C and C++ source code, which mark a section \
             with both attributes. Enabling incremental linking via the /INCREMENTAL \
             argument (the default for Microsoft Visual Studio debug build) can also \
             result in a writable and executable section named 'textbss'. For this case, \
             disable incremental linking (or analyze an alternate build configuration \
             that disables this feature) to resolve the problem.",
            name,
            bad_sections.join(";")
        ))]
    }
}
