//! Binary metadata loading.
//!
//! [`TargetImage`] is the per-target view every rule analyzes: the parsed
//! format metadata plus the optional debug-info and signature sidecars. One
//! image is loaded per target, lives for the duration of that target's rule
//! evaluation, and is dropped afterwards.

pub mod debug_info;
pub mod elf;
pub mod macho;
pub mod pe;
pub mod signing;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};

use self::debug_info::DebugInfo;
use self::elf::ElfMetadata;
use self::macho::MachOMetadata;
use self::pe::PeMetadata;
use self::signing::{SignatureVerdict, SignatureVerifier};

/// Parsed format-specific metadata for one target.
#[derive(Debug)]
pub enum FormatMetadata {
    Pe(PeMetadata),
    Elf(ElfMetadata),
    MachO(MachOMetadata),
}

impl FormatMetadata {
    pub fn name(&self) -> &'static str {
        match self {
            FormatMetadata::Pe(_) => "PE",
            FormatMetadata::Elf(_) => "ELF",
            FormatMetadata::MachO(_) => "Mach-O",
        }
    }
}

/// Everything the rules need to know about one analysis target.
#[derive(Debug)]
pub struct TargetImage {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub format: FormatMetadata,
    pub debug_info: Option<DebugInfo>,
    pub debug_info_error: Option<String>,
    pub signature: Option<SignatureVerdict>,
    pub signature_error: Option<String>,
}

impl TargetImage {
    /// Reads and parses a target. A hard error here means the file could not
    /// be recognized as a PE, ELF, or Mach-O image; sidecar problems are
    /// recorded on the image instead so individual rules can report them.
    pub fn load(path: &Path, verifier: &dyn SignatureVerifier) -> anyhow::Result<TargetImage> {
        let contents = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        tracing::debug!("loaded {} ({} bytes)", path.display(), contents.len());

        let format = Self::parse_format(path, &contents)?;
        let sha256 = hex::encode(Sha256::digest(&contents));

        let mut debug_info = None;
        let mut debug_info_error = None;
        match DebugInfo::load_for_target(path) {
            Ok(info) => debug_info = info,
            Err(err) => {
                tracing::warn!("debug info unavailable for {}: {err:#}", path.display());
                debug_info_error = Some(format!("{err:#}"));
            }
        }

        let mut signature = None;
        let mut signature_error = None;
        match verifier.verify(path) {
            Ok(verdict) => signature = verdict,
            Err(err) => {
                tracing::warn!(
                    "signature verification failed for {}: {err:#}",
                    path.display()
                );
                signature_error = Some(format!("{err:#}"));
            }
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(TargetImage {
            path: path.to_owned(),
            file_name,
            size_bytes: contents.len() as u64,
            sha256,
            format,
            debug_info,
            debug_info_error,
            signature,
            signature_error,
        })
    }

    fn parse_format(path: &Path, contents: &[u8]) -> anyhow::Result<FormatMetadata> {
        if contents.len() < 4 {
            bail!(
                "{} is too small ({} bytes) to be an executable image",
                path.display(),
                contents.len()
            );
        }
        match &contents[0..4] {
            [0x7f, b'E', b'L', b'F'] => {
                tracing::debug!("ELF magic detected in {}", path.display());
                Ok(FormatMetadata::Elf(ElfMetadata::parse(contents)?))
            }
            [b'M', b'Z', _, _] => {
                tracing::debug!("PE magic detected in {}", path.display());
                Ok(FormatMetadata::Pe(PeMetadata::parse(contents)?))
            }
            [0xfe, 0xed, 0xfa, 0xce]
            | [0xce, 0xfa, 0xed, 0xfe]
            | [0xfe, 0xed, 0xfa, 0xcf]
            | [0xcf, 0xfa, 0xed, 0xfe]
            | [0xca, 0xfe, 0xba, 0xbe]
            | [0xbe, 0xba, 0xfe, 0xca] => {
                tracing::debug!("Mach-O magic detected in {}", path.display());
                Ok(FormatMetadata::MachO(MachOMetadata::parse(contents)?))
            }
            magic => bail!(
                "{} has unrecognized magic bytes {:02x?}",
                path.display(),
                magic
            ),
        }
    }

    pub fn pe(&self) -> Option<&PeMetadata> {
        match &self.format {
            FormatMetadata::Pe(pe) => Some(pe),
            _ => None,
        }
    }

    pub fn elf(&self) -> Option<&ElfMetadata> {
        match &self.format {
            FormatMetadata::Elf(elf) => Some(elf),
            _ => None,
        }
    }

    pub fn macho(&self) -> Option<&MachOMetadata> {
        match &self.format {
            FormatMetadata::MachO(macho) => Some(macho),
            _ => None,
        }
    }
}
