//! Checks for Windows portable executables.

pub mod aslr;
pub mod control_flow;
pub mod data_exec;
pub mod signing;
pub mod spectre;
pub mod stack_protection;
pub mod toolchain;
