//! The built-in hardening checks.
//!
//! Each check is a [`Rule`]: a stateless object that first judges whether a
//! target is in scope via [`Rule::can_analyze`], then renders one or more
//! verdicts via [`Rule::analyze`]. Checks never write output themselves; the
//! engine owns logging, isolation, and runtime condition tracking.

use crate::binary::TargetImage;
use crate::config::Policy;
use crate::engine::results::RuleResult;

pub mod elf;
pub mod macho;
pub mod pe;
mod shared;

/// Whether a rule applies to a given target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applicability {
    Applicable,
    /// Out of scope, with the metadata condition that excludes it.
    NotApplicableToTarget(String),
    /// Applicability itself could not be decided.
    Error(String),
}

/// Everything a rule may consult while judging one target.
pub struct AnalysisContext<'a> {
    pub target: &'a TargetImage,
    pub policy: &'a Policy,
}

impl AnalysisContext<'_> {
    pub fn max_evidence_records(&self) -> usize {
        self.policy.engine.max_evidence_records
    }
}

/// A single hardening check.
///
/// Implementations are registered once at startup and shared across worker
/// threads, so they hold no per-target state.
pub trait Rule: Send + Sync {
    /// Stable identifier, `BA` followed by four digits.
    fn id(&self) -> &'static str;

    /// PascalCase short name, stable across releases.
    fn name(&self) -> &'static str;

    /// One-paragraph summary of what the check verifies and how to fix a
    /// failing image.
    fn description(&self) -> &'static str;

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability;

    /// Renders verdicts for an applicable target. Must produce at least one
    /// result; an empty vector is reported by the engine as an internal
    /// error.
    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult>;
}

/// Metadata conditions that exclude a target from one or more checks. The
/// engine quotes these verbatim in not-applicable results, so the wording is
/// part of the output contract.
pub mod reasons {
    pub const NOT_A_PE: &str = "image is not a portable executable";
    pub const NOT_AN_ELF: &str = "image is not an ELF binary";
    pub const NOT_A_MACHO: &str = "image is not a Mach-O binary";
    pub const IL_ONLY_ASSEMBLY: &str = "image is an ILOnly managed assembly";
    pub const IL_LIBRARY: &str = "image is an IL library assembly";
    pub const RESOURCE_ONLY: &str = "image is a resource-only binary";
    pub const MANAGED_INTEROP: &str = "image is a managed interop assembly";
    pub const KERNEL_MODE: &str = "image is a kernel-mode binary";
    pub const KERNEL_MODE_32BIT: &str = "image is a 32-bit kernel-mode binary";
    pub const XBOX: &str = "image is an XBox binary";
    pub const BOOT: &str = "image is a boot binary";
    pub const DOTNET_NATIVE: &str = "image is a .NET native binary";
    pub const NATIVE_UWP: &str = "image is a native Universal Windows Platform binary";
    pub const WIX: &str = "image is a WIX binary";
    pub const NOT_BUILT_WITH_MSVC: &str = "image is not built with MSVC tools";
    pub const NOT_32_BIT: &str = "image is not a 32-bit binary";
    pub const NOT_64_BIT: &str = "image is not a 64-bit binary";
    pub const IS_64_BIT: &str = "image is a 64-bit binary";
    pub const LIKELY_32BIT_PROCESS: &str = "image likely loads as a 32-bit process";
    pub const NOT_AN_EXE: &str = "image is not an executable";
    pub const DOTNET_CORE_ENTRY: &str = "image is a .NET Core entry point";
    pub const DOTNET_CORE_BOOTSTRAP: &str = "image is a .NET Core bootstrap executable";
    pub const WINDOWS_CE_PRE_7: &str = "image is a pre-version-7 Windows CE binary";
    pub const NO_SPECTRE_MITIGATIONS_FOR_ARCHITECTURE: &str =
        "image architecture provides no Spectre mitigations";
    pub const NOT_SIGNED: &str = "image is not signed";
    pub const ELF_CORE_NONE_OBJECT: &str = "ELF file type is core, none, or object";
    pub const ELF_NOT_GCC: &str = "ELF binary was not compiled with GCC";
    pub const MACHO_NOT_ANALYZABLE: &str =
        "Mach-O is not an executable, dynamic library, or object file";
}

/// Every shipping rule, in registration order. The registry re-sorts by id,
/// so ordering here is cosmetic.
pub fn built_in_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(pe::aslr::LoadImageAboveFourGigabyteAddress),
        Box::new(pe::toolchain::BuildWithSecureTools),
        Box::new(pe::toolchain::EnableCriticalCompilerWarnings),
        Box::new(pe::control_flow::EnableControlFlowGuard),
        Box::new(pe::aslr::EnableAddressSpaceLayoutRandomization),
        Box::new(pe::data_exec::DoNotMarkImportsSectionAsExecutable),
        Box::new(pe::stack_protection::EnableStackProtection),
        Box::new(pe::stack_protection::DoNotDisableStackProtectionForFunctions),
        Box::new(pe::aslr::EnableHighEntropyVirtualAddresses),
        Box::new(pe::data_exec::MarkImageAsNxCompatible),
        Box::new(pe::control_flow::EnableSafeSeh),
        Box::new(pe::data_exec::DoNotMarkWritableSectionsAsShared),
        Box::new(pe::data_exec::DoNotMarkWritableSectionsAsExecutable),
        Box::new(pe::signing::SignSecurely),
        Box::new(pe::spectre::EnableSpectreMitigations),
        Box::new(elf::hardening::EnablePositionIndependentExecutable),
        Box::new(elf::hardening::DoNotMarkStackAsExecutable),
        Box::new(elf::hardening::EnableStackProtector),
        Box::new(elf::relocations::EnableReadOnlyRelocations),
        Box::new(elf::relocations::EnableBindNow),
        Box::new(elf::fortify::UseCheckedFunctionsWithGcc),
        Box::new(macho::EnablePositionIndependentExecutable),
        Box::new(macho::DoNotAllowExecutableStack),
    ]
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    use crate::binary::elf::{ElfCompiler, ElfCompilerKind, ElfMetadata, ET_DYN};
    use crate::binary::macho::MachOMetadata;
    use crate::binary::pe::{
        Directories, PeMetadata, SectionInfo, IMAGE_FILE_MACHINE_I386, IMAGE_SCN_MEM_EXECUTE,
    };
    use crate::binary::{FormatMetadata, TargetImage};
    use crate::config::Policy;
    use crate::version::ToolVersion;

    use super::AnalysisContext;

    pub fn context<'a>(image: &'a TargetImage, policy: &'a Policy) -> AnalysisContext<'a> {
        AnalysisContext {
            target: image,
            policy,
        }
    }

    /// A minimal native 32-bit user-mode executable.
    pub fn pe_metadata() -> PeMetadata {
        PeMetadata {
            machine: IMAGE_FILE_MACHINE_I386,
            coff_characteristics: 0,
            dll_characteristics: 0,
            subsystem: 2, // IMAGE_SUBSYSTEM_WINDOWS_GUI
            subsystem_version: ToolVersion::new(6, 0, 0, 0),
            linker_version: ToolVersion::new(14, 0, 0, 0),
            is_64bit: false,
            is_dll: false,
            image_base: 0x40_0000,
            section_alignment: 0x1000,
            sections: vec![SectionInfo {
                name: ".text".to_string(),
                virtual_address: 0x1000,
                virtual_size: 0x800,
                size_of_raw_data: 0x800,
                pointer_to_raw_data: 0x400,
                characteristics: IMAGE_SCN_MEM_EXECUTE,
            }],
            imports: vec!["KERNEL32.dll".to_string()],
            directories: Directories::default(),
            cor_flags: None,
            load_config: None,
            pdb_path: None,
        }
    }

    /// A 64-bit dynamic ELF executable built purely with GCC.
    pub fn elf_metadata() -> ElfMetadata {
        ElfMetadata {
            e_type: ET_DYN,
            machine: 62, // EM_X86_64
            is_64bit: true,
            has_gnu_relro: false,
            has_program_header_segment: true,
            gnu_stack_flags: Some(0x6), // PF_R | PF_W
            bind_now: false,
            symbols: Vec::new(),
            compilers: vec![ElfCompiler {
                kind: ElfCompilerKind::Gcc,
                description: "GCC: (GNU) 12.2.0".to_string(),
            }],
        }
    }

    pub fn pe_image(pe: PeMetadata) -> TargetImage {
        image(FormatMetadata::Pe(pe), "app.exe")
    }

    pub fn elf_image(elf: ElfMetadata) -> TargetImage {
        image(FormatMetadata::Elf(elf), "app")
    }

    pub fn macho_image(macho: MachOMetadata) -> TargetImage {
        image(FormatMetadata::MachO(macho), "app")
    }

    fn image(format: FormatMetadata, name: &str) -> TargetImage {
        TargetImage {
            path: PathBuf::from(name),
            file_name: name.to_string(),
            size_bytes: 4096,
            sha256: "0".repeat(64),
            format,
            debug_info: None,
            debug_info_error: None,
            signature: None,
            signature_error: None,
        }
    }
}
