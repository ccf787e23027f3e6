//! Checks for Linux ELF binaries.

pub mod fortify;
pub mod hardening;
pub mod relocations;
