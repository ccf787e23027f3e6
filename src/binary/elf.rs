//! ELF metadata extraction.

use anyhow::Context;
use goblin::elf::dynamic::{DF_1_NOW, DF_BIND_NOW, DT_BIND_NOW, DT_FLAGS, DT_FLAGS_1};
use goblin::elf::program_header::{PF_X, PT_GNU_RELRO, PT_GNU_STACK, PT_PHDR};
use goblin::elf::section_header::SHT_NOBITS;
use goblin::elf::sym::{STT_FUNC, STT_OBJECT};
use goblin::elf::Elf;

pub use goblin::elf::header::{ET_CORE, ET_DYN, ET_EXEC, ET_NONE, ET_REL};

/// Toolchain family recovered from one `.comment` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfCompilerKind {
    Unknown,
    Clang,
    Gcc,
    Rust,
}

#[derive(Debug, Clone)]
pub struct ElfCompiler {
    pub kind: ElfCompilerKind,
    pub description: String,
}

impl ElfCompiler {
    fn from_description(description: &str) -> Self {
        let kind = if description.starts_with("GCC:") && description.len() > 4 {
            ElfCompilerKind::Gcc
        } else if description.contains("clang version") {
            ElfCompilerKind::Clang
        } else if description.contains("rustc") {
            ElfCompilerKind::Rust
        } else {
            ElfCompilerKind::Unknown
        };
        ElfCompiler {
            kind,
            description: description.to_string(),
        }
    }
}

/// Owned, pre-digested ELF metadata.
#[derive(Debug, Clone)]
pub struct ElfMetadata {
    pub e_type: u16,
    pub machine: u16,
    pub is_64bit: bool,
    pub has_gnu_relro: bool,
    /// Shared objects that are really executables carry a PT_PHDR segment;
    /// plain libraries normally do not.
    pub has_program_header_segment: bool,
    /// Flags of the PT_GNU_STACK segment, if one exists.
    pub gnu_stack_flags: Option<u32>,
    pub bind_now: bool,
    /// Names of function and object symbols from both symbol tables.
    pub symbols: Vec<String>,
    /// Toolchain records from the `.comment` section. Binaries without one
    /// get a single unknown entry.
    pub compilers: Vec<ElfCompiler>,
}

impl ElfMetadata {
    pub fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        let elf = Elf::parse(bytes).context("malformed ELF image")?;

        let has_gnu_relro = elf
            .program_headers
            .iter()
            .any(|ph| ph.p_type == PT_GNU_RELRO);

        let has_program_header_segment =
            elf.program_headers.iter().any(|ph| ph.p_type == PT_PHDR);

        let gnu_stack_flags = elf
            .program_headers
            .iter()
            .find(|ph| ph.p_type == PT_GNU_STACK)
            .map(|ph| ph.p_flags);

        let bind_now = elf
            .dynamic
            .as_ref()
            .map(|dynamic| {
                dynamic.dyns.iter().any(|entry| {
                    entry.d_tag == DT_BIND_NOW
                        || (entry.d_tag == DT_FLAGS && entry.d_val & DF_BIND_NOW != 0)
                        || (entry.d_tag == DT_FLAGS_1 && entry.d_val & DF_1_NOW != 0)
                })
            })
            .unwrap_or(false);

        let mut symbols = Vec::new();
        for sym in elf.syms.iter() {
            if sym.st_type() == STT_FUNC || sym.st_type() == STT_OBJECT {
                if let Some(name) = elf.strtab.get_at(sym.st_name) {
                    if !name.is_empty() {
                        symbols.push(name.to_string());
                    }
                }
            }
        }
        for sym in elf.dynsyms.iter() {
            if sym.st_type() == STT_FUNC || sym.st_type() == STT_OBJECT {
                if let Some(name) = elf.dynstrtab.get_at(sym.st_name) {
                    if !name.is_empty() {
                        symbols.push(name.to_string());
                    }
                }
            }
        }

        let compilers = read_comment_section(bytes, &elf);

        Ok(ElfMetadata {
            e_type: elf.header.e_type,
            machine: elf.header.e_machine,
            is_64bit: elf.is_64,
            has_gnu_relro,
            has_program_header_segment,
            gnu_stack_flags,
            bind_now,
            symbols,
            compilers,
        })
    }

    /// Core dumps, object files, and typeless images carry no runtime
    /// hardening surface.
    pub fn is_core_none_or_object(&self) -> bool {
        matches!(self.e_type, ET_CORE | ET_NONE | ET_REL)
    }

    pub fn is_executable_stack(&self) -> Option<bool> {
        self.gnu_stack_flags.map(|flags| flags & PF_X != 0)
    }

    pub fn has_symbol(&self, name: &str) -> bool {
        self.symbols.iter().any(|s| s == name)
    }

    /// Whether every `.comment` entry names GCC. A standard clang link pulls
    /// in GCC-built objects and reads as both, so any non-GCC entry means a
    /// non-GCC toolchain touched the binary.
    pub fn built_exclusively_with_gcc(&self) -> bool {
        !self
            .compilers
            .iter()
            .any(|c| c.kind != ElfCompilerKind::Gcc)
    }
}

fn read_comment_section(bytes: &[u8], elf: &Elf) -> Vec<ElfCompiler> {
    for sh in &elf.section_headers {
        if elf.shdr_strtab.get_at(sh.sh_name) != Some(".comment") || sh.sh_type == SHT_NOBITS {
            continue;
        }
        let start = sh.sh_offset as usize;
        let end = start.saturating_add(sh.sh_size as usize);
        if start >= bytes.len() || end > bytes.len() || start >= end {
            break;
        }
        let entries: Vec<ElfCompiler> = bytes[start..end]
            .split(|&b| b == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| ElfCompiler::from_description(&String::from_utf8_lossy(chunk)))
            .collect();
        if !entries.is_empty() {
            return entries;
        }
        break;
    }
    vec![ElfCompiler::from_description("")]
}
