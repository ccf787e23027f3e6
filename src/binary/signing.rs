//! Code-signing verdicts.
//!
//! Authenticode verification requires platform trust APIs, so the engine
//! consumes a narrow verdict instead: signed or not, chain validity, and the
//! digest algorithm names. The default verifier reads a `<target>.sig.json`
//! sidecar produced by the signing pipeline.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Verdict from a signature verification collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureVerdict {
    pub signed: bool,
    #[serde(default)]
    pub valid: bool,
    /// Digest algorithm names used by the signature, e.g. "sha256".
    #[serde(default)]
    pub algorithms: Vec<String>,
    #[serde(default)]
    pub validation_error: Option<String>,
}

/// Classification of a signature digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmStrength {
    Strong,
    Weak,
    Unrecognized,
}

/// Collision-prone digests that signing policy rejects.
const WEAK_ALGORITHMS: &[&str] = &["md2", "md4", "md5", "sha1", "sha-1"];

const STRONG_ALGORITHMS: &[&str] = &["sha256", "sha384", "sha512"];

pub fn classify_algorithm(name: &str) -> AlgorithmStrength {
    let normalized = name.to_ascii_lowercase();
    if WEAK_ALGORITHMS.iter().any(|w| normalized.starts_with(w)) {
        return AlgorithmStrength::Weak;
    }
    if STRONG_ALGORITHMS.iter().any(|s| normalized.starts_with(s)) {
        return AlgorithmStrength::Strong;
    }
    AlgorithmStrength::Unrecognized
}

/// Produces signature verdicts for analysis targets.
///
/// The provider only needs to be valid for the duration of one target's
/// analysis; implementations own whatever platform state they need and
/// release it on drop.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, target: &Path) -> anyhow::Result<Option<SignatureVerdict>>;
}

/// Default verifier: reads the `<target>.sig.json` sidecar.
#[derive(Debug, Default)]
pub struct SidecarSignatureVerifier;

impl SidecarSignatureVerifier {
    pub fn sidecar_path(target: &Path) -> PathBuf {
        let mut name = target.as_os_str().to_owned();
        name.push(".sig.json");
        PathBuf::from(name)
    }
}

impl SignatureVerifier for SidecarSignatureVerifier {
    fn verify(&self, target: &Path) -> anyhow::Result<Option<SignatureVerdict>> {
        let path = Self::sidecar_path(target);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let verdict: SignatureVerdict = serde_json::from_str(&raw)
            .with_context(|| format!("malformed signature verdict in {}", path.display()))?;
        Ok(Some(verdict))
    }
}
