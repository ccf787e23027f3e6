//! Mach-O metadata extraction.
//!
//! Fat binaries are flattened into per-architecture slices. The rules walk
//! every slice, since a universal binary is only as hardened as its weakest
//! architecture.

use anyhow::{anyhow, Context};
use goblin::mach::{Mach, MachO, SingleArch};

// Mach header file types.
pub const MH_OBJECT: u32 = 0x1;
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_DYLINKER: u32 = 0x7;
pub const MH_BUNDLE: u32 = 0x8;
pub const MH_DSYM: u32 = 0xa;

// Mach header flags.
pub const MH_ALLOW_STACK_EXECUTION: u32 = 0x20000;
pub const MH_PIE: u32 = 0x20_0000;

// CPU types.
pub const CPU_TYPE_X86: u32 = 7;
pub const CPU_TYPE_ARM: u32 = 12;
pub const CPU_TYPE_POWERPC: u32 = 18;
pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;
pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;
pub const CPU_TYPE_POWERPC64: u32 = 0x0100_0012;

/// One architecture slice of a Mach-O image.
#[derive(Debug, Clone)]
pub struct MachOSlice {
    pub filetype: u32,
    pub flags: u32,
    pub cputype: u32,
}

impl MachOSlice {
    fn from_macho(macho: &MachO) -> Self {
        MachOSlice {
            filetype: macho.header.filetype,
            flags: macho.header.flags,
            cputype: macho.header.cputype,
        }
    }

    pub fn is_executable(&self) -> bool {
        self.filetype == MH_EXECUTE
    }

    pub fn is_dylib(&self) -> bool {
        self.filetype == MH_DYLIB
    }

    pub fn has_pie_flag(&self) -> bool {
        self.flags & MH_PIE != 0
    }

    pub fn allows_stack_execution(&self) -> bool {
        self.flags & MH_ALLOW_STACK_EXECUTION != 0
    }

    pub fn arch_name(&self) -> &'static str {
        match self.cputype {
            CPU_TYPE_X86 => "x86",
            CPU_TYPE_X86_64 => "x86_64",
            CPU_TYPE_ARM => "arm",
            CPU_TYPE_ARM64 => "arm64",
            CPU_TYPE_POWERPC => "powerpc",
            CPU_TYPE_POWERPC64 => "powerpc64",
            _ => "unknown",
        }
    }
}

/// Owned, pre-digested Mach-O metadata.
#[derive(Debug, Clone)]
pub struct MachOMetadata {
    pub slices: Vec<MachOSlice>,
    pub is_fat: bool,
}

impl MachOMetadata {
    pub fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        match Mach::parse(bytes).context("malformed Mach-O image")? {
            Mach::Binary(macho) => Ok(MachOMetadata {
                slices: vec![MachOSlice::from_macho(&macho)],
                is_fat: false,
            }),
            Mach::Fat(multi) => {
                let mut slices = Vec::new();
                for entry in &multi {
                    match entry {
                        Ok(SingleArch::MachO(macho)) => slices.push(MachOSlice::from_macho(&macho)),
                        // Static archive slices carry no load-time flags.
                        Ok(SingleArch::Archive(_)) => continue,
                        Err(err) => {
                            tracing::debug!("skipping unreadable fat slice: {}", err);
                        }
                    }
                }
                if slices.is_empty() {
                    return Err(anyhow!("fat Mach-O contains no loadable slices"));
                }
                Ok(MachOMetadata {
                    slices,
                    is_fat: true,
                })
            }
        }
    }

    pub fn any_executable(&self) -> bool {
        self.slices.iter().any(|s| s.is_executable())
    }

    pub fn any_executable_or_dylib(&self) -> bool {
        self.slices.iter().any(|s| s.is_executable() || s.is_dylib())
    }
}
