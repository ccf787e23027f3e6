//! Target discovery.
//!
//! Directories are filtered to likely binaries: Windows images by extension,
//! ELF and Mach-O images by magic bytes since they usually ship without an
//! extension. Explicitly named files are always scanned.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

const SCANNABLE_EXTENSIONS: &[&str] = &["dll", "exe", "sys"];

pub fn expand_targets(paths: &[PathBuf], recurse: bool) -> Result<Vec<PathBuf>> {
    let mut targets = Vec::new();
    for path in paths {
        if path.is_dir() {
            collect_from_directory(path, recurse, &mut targets)?;
        } else {
            targets.push(path.clone());
        }
    }
    targets.sort();
    targets.dedup();
    Ok(targets)
}

fn collect_from_directory(dir: &Path, recurse: bool, targets: &mut Vec<PathBuf>) -> Result<()> {
    let mut walker = WalkDir::new(dir).follow_links(false);
    if !recurse {
        walker = walker.max_depth(1);
    }
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if is_candidate(entry.path()) {
            targets.push(entry.path().to_owned());
        }
    }
    Ok(())
}

fn is_candidate(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => SCANNABLE_EXTENSIONS
            .iter()
            .any(|s| ext.eq_ignore_ascii_case(s)),
        None => sniffs_as_executable(path),
    }
}

fn sniffs_as_executable(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() {
        return false;
    }
    matches!(
        &magic,
        [0x7f, b'E', b'L', b'F']
            | [0xfe, 0xed, 0xfa, 0xce]
            | [0xce, 0xfa, 0xed, 0xfe]
            | [0xfe, 0xed, 0xfa, 0xcf]
            | [0xcf, 0xfa, 0xed, 0xfe]
            | [0xca, 0xfe, 0xba, 0xbe]
            | [0xbe, 0xba, 0xfe, 0xca]
    )
}
