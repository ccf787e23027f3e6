//! Address space layout randomization checks.

use crate::engine::results::RuleResult;
use crate::rules::shared::{self, skip};
use crate::rules::{reasons, AnalysisContext, Applicability, Rule};

/// BA2001: 64-bit images should declare a preferred base address above the
/// 4GB boundary, keeping the largest possible relocation range available to
/// the loader.
pub struct LoadImageAboveFourGigabyteAddress;

impl Rule for LoadImageAboveFourGigabyteAddress {
    fn id(&self) -> &'static str {
        "BA2001"
    }

    fn name(&self) -> &'static str {
        "LoadImageAboveFourGigabyteAddress"
    }

    fn description(&self) -> &'static str {
        "64-bit images should have a preferred base address above the 4GB boundary. \
         Base addresses below 4GB reduce the effectiveness of address space layout \
         randomization by shrinking the pool of addresses the loader can rebase to."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let pe = match shared::pe_binary(ctx) {
            Ok(pe) => pe,
            Err(gate) => return gate,
        };
        if !pe.is_64bit {
            return skip(reasons::NOT_64_BIT);
        }
        if pe.is_il_only() {
            return skip(reasons::IL_ONLY_ASSEMBLY);
        }
        if pe.is_kernel_mode() {
            return skip(reasons::KERNEL_MODE);
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

        if pe.image_base <= 0xFFFF_FFFF {
            return vec![RuleResult::error(format!(
                "'{}' is a 64-bit image with a preferred base address below the 4GB boundary. \
                 Having a preferred base address below this boundary triggers a compatibility \
                 mode in Address Space Layout Randomization (ASLR) on recent versions of \
                 Windows that reduces the number of locations to which ASLR may relocate the \
                 binary. To resolve this issue, either use the default preferred base address \
                 by removing any uses of /baseaddress from compiler command lines, or /BASE \
                 from linker command lines, or configure your program to start at a base \
                 address above 4GB when compiled for 64 bit platforms.",
                name
            ))];
        }

        vec![RuleResult::pass(format!(
            "'{}' is a 64-bit image with a preferred base address above the 4GB boundary, \
             leaving the full address range available to Address Space Layout Randomization.",
            name
        ))]
    }
}

/// BA2009: images should opt in to dynamic rebasing and keep their
/// relocation data.
pub struct EnableAddressSpaceLayoutRandomization;

impl Rule for EnableAddressSpaceLayoutRandomization {
    fn id(&self) -> &'static str {
        "BA2009"
    }

    fn name(&self) -> &'static str {
        "EnableAddressSpaceLayoutRandomization"
    }

    fn description(&self) -> &'static str {
        "Binaries should be marked as DYNAMICBASE to be eligible for relocation by Address \
         Space Layout Randomization (ASLR). ASLR is an important mitigation that makes it \
         more difficult for an attacker to return to well-known locations in memory in \
         order to subvert program execution."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let pe = match shared::pe_binary(ctx) {
            Ok(pe) => pe,
            Err(gate) => return gate,
        };
        if pe.is_kernel_mode() {
            return skip(reasons::KERNEL_MODE);
        }
        if pe.is_xbox() {
            return skip(reasons::XBOX);
        }
        // ASLR only became a machine-wide setting on CE 7.
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

        if !pe.has_dynamic_base() {
            return vec![RuleResult::error(format!(
                "'{}' is not marked as DYNAMICBASE. This means Address Space Layout \
                 Randomization, an exploit mitigation that makes it more difficult for an \
                 attacker to locate binaries in memory, is not enabled for this image. To \
                 resolve this issue, configure your tools to build with this feature enabled \
                 by supplying /DYNAMICBASE to the linker command line.",
                name
            ))];
        }

        if pe.relocs_stripped() {
            return vec![RuleResult::error(format!(
                "'{}' is marked as DYNAMICBASE but relocation data has been stripped from \
                 the image, preventing address space layout randomization.",
                name
            ))];
        }

        // On CE 7 and later ASLR is machine-wide; an image is only eligible
        // for rebasing if a populated relocation section survived the link.
        if pe.subsystem == crate::binary::pe::IMAGE_SUBSYSTEM_WINDOWS_CE_GUI {
            let reloc_present = pe
                .sections
                .iter()
                .any(|s| s.name.eq_ignore_ascii_case(".reloc") && s.size_of_raw_data > 0);
            if !reloc_present {
                return vec![RuleResult::error(format!(
                    "'{}' is a Windows CE image but does not contain any relocation data, \
                     preventing address space layout randomization.",
                    name
                ))];
            }
        }

        vec![RuleResult::pass(format!(
            "'{}' is properly compiled to enable address space layout randomization.",
            name
        ))]
    }
}

/// BA2015: 64-bit processes should enable high entropy ASLR.
pub struct EnableHighEntropyVirtualAddresses;

impl Rule for EnableHighEntropyVirtualAddresses {
    fn id(&self) -> &'static str {
        "BA2015"
    }

    fn name(&self) -> &'static str {
        "EnableHighEntropyVirtualAddresses"
    }

    fn description(&self) -> &'static str {
        "Binaries should be marked as high entropy Address Space Layout Randomization \
         (ASLR) compatible. High entropy allows ASLR to be more effective in mitigating \
         memory corruption vulnerabilities. To resolve this issue, configure your tools to \
         build with this feature enabled and then recompile your binary."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let pe = match shared::pe_binary(ctx) {
            Ok(pe) => pe,
            Err(gate) => return gate,
        };
        if pe.is_kernel_mode() {
            return skip(reasons::KERNEL_MODE);
        }
        // High entropy requires a 64-bit address space at runtime. Managed
        // images that merely prefer 32 bits still get one on a 64-bit host.
        if !pe.is_64bit && (!pe.is_managed() || pe.requires_32bit()) {
            return skip(reasons::LIKELY_32BIT_PROCESS);
        }
        if !pe.is_exe() {
            return skip(reasons::NOT_AN_EXE);
        }
        if pe.is_dotnet_core_bootstrap_exe() {
            return skip(reasons::DOTNET_CORE_ENTRY);
        }
        Applicability::Applicable
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let name = &ctx.target.file_name;
        let Some(pe) = ctx.target.pe() else {
            return Vec::new();
        };

        let high_entropy_va = pe.has_high_entropy_va();
        // /LARGEADDRESSAWARE is necessary for HIGH_ENTROPY_VA to have effect.
        let large_address_aware = pe.is_large_address_aware();

        if !high_entropy_va && !large_address_aware {
            return vec![RuleResult::error(format!(
                "'{}' does not declare itself as high entropy ASLR compatible. High entropy \
                 allows Address Space Layout Randomization to be more effective in mitigating \
                 memory corruption vulnerabilities. To resolve this issue, configure your tool \
                 chain to mark the program high entropy compatible; e.g. by supplying \
                 /HIGHENTROPYVA as well as /LARGEADDRESSAWARE to the C or C++ linker command \
                 line.",
                name
            ))];
        }

        if !high_entropy_va {
            return vec![RuleResult::error(format!(
                "'{}' does not declare itself as high entropy ASLR compatible. High entropy \
                 allows Address Space Layout Randomization to be more effective in mitigating \
                 memory corruption vulnerabilities. To resolve this issue, configure your tool \
                 chain to mark the program high entropy compatible; e.g. by supplying \
                 /HIGHENTROPYVA to the C or C++ linker command line. (This image was \
                 determined to have been properly compiled as /LARGEADDRESSAWARE.)",
                name
            ))];
        }

        if !large_address_aware {
            return vec![RuleResult::error(format!(
                "'{}' does not declare itself as high entropy ASLR compatible. High entropy \
                 allows Address Space Layout Randomization to be more effective in mitigating \
                 memory corruption vulnerabilities. To resolve this issue, configure your tool \
                 chain to mark the program high entropy compatible by supplying \
                 /LARGEADDRESSAWARE to the C or C++ linker command line. (This image was \
                 determined to have been properly compiled as /HIGHENTROPYVA.)",
                name
            ))];
        }

        vec![RuleResult::pass(format!(
            "'{}' is high entropy ASLR compatible.",
            name
        ))]
    }
}
