//! Gates and formatting helpers shared between rules.

use std::collections::BTreeMap;

use crate::binary::debug_info::{DebugInfo, ObjectModule};
use crate::binary::elf::ElfMetadata;
use crate::binary::macho::MachOMetadata;
use crate::binary::pe::PeMetadata;
use crate::engine::results::RuleResult;
use crate::rules::{reasons, AnalysisContext, Applicability};

/// Shorthand for the not-applicable verdict every gate produces.
pub fn skip(reason: &str) -> Applicability {
    Applicability::NotApplicableToTarget(reason.to_string())
}

/// Format gate for Windows checks.
pub fn pe_binary<'c>(ctx: &'c AnalysisContext) -> Result<&'c PeMetadata, Applicability> {
    ctx.target.pe().ok_or_else(|| skip(reasons::NOT_A_PE))
}

/// Format gate for ELF checks, including the shared file-type exclusion:
/// core dumps, typeless images, and relocatable objects are never analyzed.
pub fn elf_binary<'c>(ctx: &'c AnalysisContext) -> Result<&'c ElfMetadata, Applicability> {
    let elf = ctx.target.elf().ok_or_else(|| skip(reasons::NOT_AN_ELF))?;
    if elf.is_core_none_or_object() {
        return Err(skip(reasons::ELF_CORE_NONE_OBJECT));
    }
    Ok(elf)
}

/// Format gate for Mach-O checks.
pub fn macho_binary<'c>(ctx: &'c AnalysisContext) -> Result<&'c MachOMetadata, Applicability> {
    ctx.target.macho().ok_or_else(|| skip(reasons::NOT_A_MACHO))
}

/// Extra exclusions shared by every check that consumes debug information:
/// installers, IL libraries, and generated .NET hosts have no native build
/// provenance worth judging.
pub fn debug_info_can_analyze(pe: &PeMetadata) -> Result<(), Applicability> {
    if pe.is_wix_binary() {
        return Err(skip(reasons::WIX));
    }
    if pe.is_il_library() {
        return Err(skip(reasons::IL_LIBRARY));
    }
    if pe.is_dotnet_core_bootstrap_exe() {
        return Err(skip(reasons::DOTNET_CORE_BOOTSTRAP));
    }
    Ok(())
}

/// Scope gate shared by the stack protection checks.
pub fn stack_protection_can_analyze(pe: &PeMetadata) -> Applicability {
    if pe.is_resource_only() {
        return skip(reasons::RESOURCE_ONLY);
    }
    if pe.is_il_only() {
        return skip(reasons::IL_ONLY_ASSEMBLY);
    }
    if pe.is_xbox() {
        return skip(reasons::XBOX);
    }
    // .NET native images are cross-compiled MSIL; their supporting native
    // runtime ships separately with protection enabled.
    if pe.is_dotnet_native() {
        return skip(reasons::DOTNET_NATIVE);
    }
    if pe.is_boot() {
        return skip(reasons::BOOT);
    }
    Applicability::Applicable
}

/// Resolves the debug-info sidecar for a check that cannot proceed without
/// it. The error carries the single terminal result the check reports.
pub fn require_debug_info<'c>(
    ctx: &'c AnalysisContext,
    rule_name: &str,
) -> Result<&'c DebugInfo, RuleResult> {
    if let Some(detail) = &ctx.target.debug_info_error {
        return Err(RuleResult::error(format!(
            "Image '{}' was not evaluated for check '{}' as an error occurred loading its \
             debug information: '{}'",
            ctx.target.file_name, rule_name, detail
        )));
    }
    match &ctx.target.debug_info {
        Some(info) => Ok(info),
        None => Err(RuleResult::error(format!(
            "Image '{}' was not evaluated for check '{}' as an error occurred loading its \
             debug information: 'no sidecar was found at {}'",
            ctx.target.file_name,
            rule_name,
            DebugInfo::sidecar_path(&ctx.target.path).display()
        ))),
    }
}

/// Renders modules grouped by contributing library:
/// `widget.lib: a.obj, b.obj`, loose objects bare, groups joined by `; `.
pub fn coalesce_by_library<'m>(modules: impl IntoIterator<Item = &'m ObjectModule>) -> String {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for module in modules {
        let library = module
            .library
            .as_deref()
            .map(file_name_of)
            .unwrap_or_default();
        groups
            .entry(library.to_string())
            .or_default()
            .push(file_name_of(&module.object).to_string());
    }

    let mut rendered = Vec::with_capacity(groups.len());
    for (library, mut objects) in groups {
        objects.sort();
        objects.dedup();
        if library.is_empty() {
            rendered.extend(objects);
        } else if objects.len() == 1 && objects[0] == library {
            // An object linked directly, without an archive, names itself as
            // its library.
            rendered.extend(objects);
        } else {
            rendered.push(format!("{}: {}", library, objects.join(", ")));
        }
    }
    rendered.join("; ")
}

/// Renders modules grouped by the toolchain that produced them:
/// `Microsoft (R) Optimizing Compiler:cxx:19.0.24210.0 (a.obj, b.obj)`.
pub fn coalesce_by_compiler<'m>(modules: impl IntoIterator<Item = &'m ObjectModule>) -> String {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for module in modules {
        let key = format!(
            "{}:{}:{}",
            module.compiler_name, module.language, module.back_end_version
        );
        groups
            .entry(key)
            .or_default()
            .push(file_name_of(&module.object).to_string());
    }

    let mut rendered = Vec::with_capacity(groups.len());
    for (compiler, mut objects) in groups {
        objects.sort();
        objects.dedup();
        rendered.push(format!("{} ({})", compiler, objects.join(", ")));
    }
    rendered.join("; ")
}

pub fn file_name_of(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::debug_info::ModuleLanguage;
    use crate::version::ToolVersion;

    fn module(object: &str, library: Option<&str>) -> ObjectModule {
        ObjectModule {
            object: object.to_string(),
            library: library.map(String::from),
            language: ModuleLanguage::Cxx,
            compiler_name: "Microsoft (R) Optimizing Compiler".to_string(),
            front_end_version: ToolVersion::new(19, 0, 24210, 0),
            back_end_version: ToolVersion::new(19, 0, 24210, 0),
            command_line: String::new(),
            has_security_checks: false,
            has_functions: true,
            contributes_to_executable_section: true,
        }
    }

    #[test]
    fn library_groups_are_sorted_and_merged() {
        let modules = vec![
            module("zeta.obj", Some("d:\\lib\\widget.lib")),
            module("alpha.obj", Some("widget.lib")),
            module("loose.obj", None),
        ];
        assert_eq!(
            coalesce_by_library(&modules),
            "loose.obj; widget.lib: alpha.obj, zeta.obj"
        );
    }

    #[test]
    fn object_linked_directly_is_not_its_own_group() {
        // A module linked without an archive reports its object path in both
        // fields.
        let modules = vec![module("main.obj", Some("main.obj"))];
        assert_eq!(coalesce_by_library(&modules), "main.obj");
    }

    #[test]
    fn compiler_groups_carry_language_and_version() {
        let mut newer = module("b.obj", None);
        newer.back_end_version = ToolVersion::new(19, 16, 27034, 0);
        let modules = vec![module("a.obj", None), newer];
        assert_eq!(
            coalesce_by_compiler(&modules),
            "Microsoft (R) Optimizing Compiler:cxx:19.0.24210.0 (a.obj); \
             Microsoft (R) Optimizing Compiler:cxx:19.16.27034.0 (b.obj)"
        );
    }
}
