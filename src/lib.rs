//! Static analysis of compiled binaries for build-time security mitigations.
//!
//! binward inspects PE, ELF, and Mach-O images and reports whether each was
//! built with the hardening features its platform offers: ASLR and DEP
//! settings, stack protection, control flow guard, Spectre mitigations,
//! RELRO, fortified libc calls, and so on. Checks read image metadata only;
//! nothing is executed.
//!
//! The library surface is small: build a [`RuleRegistry`], pick a
//! [`Policy`], and hand targets to [`AnalysisEngine::run`]. Results stream
//! to a [`engine::results::ResultSink`]; the returned [`ScanSummary`]
//! carries the aggregate tally and the runtime condition bitset that
//! becomes the process exit status.

pub mod binary;
pub mod cli;
pub mod config;
pub mod engine;
pub mod evidence;
pub mod rules;
pub mod version;

pub use binary::TargetImage;
pub use config::Policy;
pub use engine::registry::RuleRegistry;
pub use engine::{AnalysisEngine, ScanSummary};
