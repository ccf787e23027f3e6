//! Build provenance sidecars.
//!
//! Native Windows images record per-module compiler details in their debug
//! database. This tool consumes that data from a JSON sidecar written at
//! build time next to the analysis target (`<target>.dbginfo.json`), so
//! scans run anywhere the binary does.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::evidence::CompilandRecord;
use crate::version::ToolVersion;

/// Source language of an object module, as the linker recorded it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ModuleLanguage {
    C,
    Cxx,
    Fortran,
    Masm,
    Pascal,
    Basic,
    Cobol,
    Link,
    Cvtres,
    Cvtpgd,
    CSharp,
    VisualBasic,
    Ilasm,
    Java,
    JScript,
    Msil,
    Hlsl,
    Unknown,
}

impl fmt::Display for ModuleLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleLanguage::C => "c",
            ModuleLanguage::Cxx => "cxx",
            ModuleLanguage::Fortran => "fortran",
            ModuleLanguage::Masm => "masm",
            ModuleLanguage::Pascal => "pascal",
            ModuleLanguage::Basic => "basic",
            ModuleLanguage::Cobol => "cobol",
            ModuleLanguage::Link => "link",
            ModuleLanguage::Cvtres => "cvtres",
            ModuleLanguage::Cvtpgd => "cvtpgd",
            ModuleLanguage::CSharp => "csharp",
            ModuleLanguage::VisualBasic => "visualbasic",
            ModuleLanguage::Ilasm => "ilasm",
            ModuleLanguage::Java => "java",
            ModuleLanguage::JScript => "jscript",
            ModuleLanguage::Msil => "msil",
            ModuleLanguage::Hlsl => "hlsl",
            ModuleLanguage::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// The compiler name string the Microsoft native toolchain stamps into
/// debug info.
pub const MICROSOFT_NATIVE_COMPILER: &str = "Microsoft (R) Optimizing Compiler";

fn default_true() -> bool {
    true
}

/// One object module contribution, with the compiler provenance the
/// hardening rules examine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectModule {
    pub object: String,
    #[serde(default)]
    pub library: Option<String>,
    pub language: ModuleLanguage,
    #[serde(default)]
    pub compiler_name: String,
    #[serde(default)]
    pub front_end_version: ToolVersion,
    #[serde(default)]
    pub back_end_version: ToolVersion,
    #[serde(default)]
    pub command_line: String,
    /// Stack protection (/GS) was observed in this module's codegen.
    #[serde(default)]
    pub has_security_checks: bool,
    /// The module contains at least one function.
    #[serde(default = "default_true")]
    pub has_functions: bool,
    /// The module contributed code to an executable section.
    #[serde(default)]
    pub contributes_to_executable_section: bool,
}

impl ObjectModule {
    /// Detection for several rules applies only to C/C++ built by the
    /// Microsoft native compiler.
    pub fn is_microsoft_native_compiler(&self) -> bool {
        matches!(self.language, ModuleLanguage::C | ModuleLanguage::Cxx)
            && self.compiler_name == MICROSOFT_NATIVE_COMPILER
    }

    /// The toolchain version to compare against policy: front or back end,
    /// whichever is older.
    pub fn minimum_tool_version(&self) -> ToolVersion {
        self.front_end_version.min(self.back_end_version)
    }

    pub fn record(&self) -> CompilandRecord {
        CompilandRecord::sanitized(&self.object, self.library.as_deref(), None)
    }

    pub fn record_with_suffix(&self, suffix: &str) -> CompilandRecord {
        CompilandRecord::sanitized(&self.object, self.library.as_deref(), Some(suffix.to_string()))
    }

    /// Allow-list key: `<library file name>,<language>`, lowercased.
    pub fn allow_list_key(&self) -> Option<String> {
        let library = self.library.as_deref()?;
        if library.is_empty() {
            return None;
        }
        let file_name = library
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(library);
        Some(format!("{},{}", file_name, self.language).to_lowercase())
    }

    pub fn command_line(&self) -> CommandLine<'_> {
        CommandLine::new(&self.command_line)
    }
}

/// Per-target debug information sidecar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugInfo {
    #[serde(default)]
    pub modules: Vec<ObjectModule>,
    /// Undecorated names of native functions annotated
    /// `__declspec(safebuffers)`.
    #[serde(default)]
    pub safe_buffers_functions: Vec<String>,
}

impl DebugInfo {
    pub fn sidecar_path(target: &Path) -> PathBuf {
        let mut name = target.as_os_str().to_owned();
        name.push(".dbginfo.json");
        PathBuf::from(name)
    }

    /// Loads the sidecar for `target`. A missing file is `Ok(None)`; an
    /// unreadable or malformed one is an error the caller surfaces through
    /// the rules that needed it.
    pub fn load_for_target(target: &Path) -> anyhow::Result<Option<DebugInfo>> {
        let path = Self::sidecar_path(target);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let info: DebugInfo = serde_json::from_str(&raw)
            .with_context(|| format!("malformed debug info in {}", path.display()))?;
        Ok(Some(info))
    }
}

/// State of a compiler switch on a recorded command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    NotFound,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOfPrecedence {
    FirstWins,
    LastWins,
}

/// Parsed view over a module's compiler command line.
#[derive(Debug, Clone, Copy)]
pub struct CommandLine<'a> {
    raw: &'a str,
}

impl<'a> CommandLine<'a> {
    pub fn new(raw: &'a str) -> Self {
        CommandLine { raw }
    }

    fn options(&self) -> impl Iterator<Item = &'a str> {
        self.raw
            .split_whitespace()
            .filter(|tok| tok.len() >= 2 && (tok.starts_with('/') || tok.starts_with('-')))
            .map(|tok| tok.trim_start_matches(['/', '-']))
    }

    /// Effective /Wn warning level, last writer wins. /Wall maps to 4 and a
    /// bare /w silences everything.
    pub fn warning_level(&self) -> u32 {
        let mut level = 0;
        for opt in self.options() {
            match opt {
                "W0" | "W1" | "W2" | "W3" | "W4" => {
                    level = u32::from(opt.as_bytes()[1] - b'0');
                }
                "Wall" => level = 4,
                "w" => level = 0,
                _ => {}
            }
        }
        level
    }

    /// Warning ids suppressed via /wdNNNN, sorted and deduplicated.
    pub fn explicitly_disabled_warnings(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .options()
            .filter_map(|opt| opt.strip_prefix("wd"))
            .filter_map(|digits| digits.parse().ok())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Resolves the state of a switch family against optional overriding
    /// switches. Names match whole or with a trailing `-` for explicit
    /// disable; a bare stem prefix is ignored.
    pub fn switch_state(
        &self,
        switch_names: &[&str],
        override_names: &[&str],
        default_state: SwitchState,
        precedence: OrderOfPrecedence,
    ) -> SwitchState {
        let mut switches = SwitchState::NotFound;
        let mut overrides = SwitchState::NotFound;

        for arg in self.options() {
            for name in switch_names {
                if let Some(rest) = arg.strip_prefix(name) {
                    if rest.is_empty() {
                        switches = SwitchState::Enabled;
                        overrides = SwitchState::Disabled;
                    } else if rest.starts_with('-') {
                        switches = SwitchState::Disabled;
                    }
                }
            }
            for name in override_names {
                if let Some(rest) = arg.strip_prefix(name) {
                    if rest.is_empty() {
                        overrides = SwitchState::Enabled;
                        switches = SwitchState::Disabled;
                    } else if rest.starts_with('-') {
                        overrides = SwitchState::Disabled;
                    }
                }
            }
            if precedence == OrderOfPrecedence::FirstWins
                && switches != SwitchState::NotFound
                && overrides != SwitchState::NotFound
            {
                break;
            }
        }

        if switches == SwitchState::NotFound {
            if overrides == SwitchState::Enabled {
                SwitchState::Disabled
            } else {
                default_state
            }
        } else {
            switches
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_level_is_last_writer_wins() {
        assert_eq!(CommandLine::new("/W3 /W1").warning_level(), 1);
        assert_eq!(CommandLine::new("-W1 -W4").warning_level(), 4);
        assert_eq!(CommandLine::new("/Wall").warning_level(), 4);
        assert_eq!(CommandLine::new("/W4 /w").warning_level(), 0);
        assert_eq!(CommandLine::new("/c /Zi").warning_level(), 0);
    }

    #[test]
    fn disabled_warnings_are_collected_sorted() {
        let cl = CommandLine::new("/W3 /wd4244 /wd4018 /wd4244 /DWIN32");
        assert_eq!(cl.explicitly_disabled_warnings(), vec![4018, 4244]);
    }

    #[test]
    fn switch_state_honors_trailing_minus() {
        let cl = CommandLine::new("/Qspectre-");
        let state = cl.switch_state(
            &["Qspectre", "guardspecload"],
            &[],
            SwitchState::Disabled,
            OrderOfPrecedence::LastWins,
        );
        assert_eq!(state, SwitchState::Disabled);

        let single = cl.switch_state(&["Qspectre"], &[], SwitchState::NotFound, OrderOfPrecedence::LastWins);
        assert_eq!(single, SwitchState::Disabled);

        let absent = CommandLine::new("/O2").switch_state(
            &["Qspectre"],
            &[],
            SwitchState::NotFound,
            OrderOfPrecedence::LastWins,
        );
        assert_eq!(absent, SwitchState::NotFound);
    }

    #[test]
    fn od_defaults_on_until_an_optimize_switch_overrides() {
        let optimize: &[&str] = &["O1", "O2", "Ox", "Og"];

        let bare = CommandLine::new("/Zi /c");
        assert_eq!(
            bare.switch_state(&["Od"], optimize, SwitchState::Enabled, OrderOfPrecedence::LastWins),
            SwitchState::Enabled
        );

        let optimized = CommandLine::new("/Od /O2");
        assert_eq!(
            optimized.switch_state(&["Od"], optimize, SwitchState::Enabled, OrderOfPrecedence::LastWins),
            SwitchState::Disabled
        );

        let reverted = CommandLine::new("/O2 /Od");
        assert_eq!(
            reverted.switch_state(&["Od"], optimize, SwitchState::Enabled, OrderOfPrecedence::LastWins),
            SwitchState::Enabled
        );
    }

    #[test]
    fn stem_matches_do_not_flip_state() {
        // /Odd is not /Od
        let cl = CommandLine::new("/Odd");
        assert_eq!(
            cl.switch_state(&["Od"], &[], SwitchState::NotFound, OrderOfPrecedence::LastWins),
            SwitchState::NotFound
        );
    }

    #[test]
    fn allow_list_key_uses_library_basename_and_language() {
        let module = ObjectModule {
            object: "d:\\build\\obj\\frob.obj".to_string(),
            library: Some("D:\\Build\\Lib\\Widget.LIB".to_string()),
            language: ModuleLanguage::Cxx,
            compiler_name: MICROSOFT_NATIVE_COMPILER.to_string(),
            front_end_version: ToolVersion::new(19, 0, 0, 0),
            back_end_version: ToolVersion::new(19, 0, 0, 0),
            command_line: String::new(),
            has_security_checks: true,
            has_functions: true,
            contributes_to_executable_section: true,
        };
        assert_eq!(module.allow_list_key().as_deref(), Some("widget.lib,cxx"));
    }

    #[test]
    fn sidecar_round_trips_through_json() {
        let raw = r#"{
            "modules": [{
                "object": "main.obj",
                "language": "cxx",
                "compiler_name": "Microsoft (R) Optimizing Compiler",
                "front_end_version": "19.16.27034.0",
                "back_end_version": "19.16.27034.0",
                "command_line": "/W3 /O2 /Qspectre",
                "has_security_checks": true
            }],
            "safe_buffers_functions": ["FastCopy"]
        }"#;
        let info: DebugInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.modules.len(), 1);
        let module = &info.modules[0];
        assert!(module.is_microsoft_native_compiler());
        assert!(module.has_functions);
        assert!(!module.contributes_to_executable_section);
        assert_eq!(
            module.minimum_tool_version(),
            ToolVersion::new(19, 16, 27034, 0)
        );
        assert_eq!(info.safe_buffers_functions, vec!["FastCopy".to_string()]);
    }
}
