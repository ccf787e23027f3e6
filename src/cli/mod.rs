//! Command-line driver.

mod analyze;
mod discover;

pub use analyze::{AnalyzeArgs, OutputFormat};

use anyhow::Result;
use clap::Subcommand;

use crate::config::Policy;
use crate::engine::registry::RuleRegistry;

#[derive(Subcommand)]
pub enum Commands {
    /// Scan binaries for missing compiler and linker mitigations.
    Analyze(AnalyzeArgs),
    /// List every registered rule with its description.
    Rules,
    /// Print the default policy as JSON, ready to edit and pass to --policy.
    ExportPolicy,
}

/// Runs one subcommand and returns the process exit code.
pub fn handle_command(command: Commands) -> Result<i32> {
    match command {
        Commands::Analyze(args) => analyze::run(args),
        Commands::Rules => {
            list_rules()?;
            Ok(0)
        }
        Commands::ExportPolicy => {
            println!("{}", Policy::default().to_pretty_json()?);
            Ok(0)
        }
    }
}

fn list_rules() -> Result<()> {
    let registry = RuleRegistry::built_in()?;
    for rule in registry.rules() {
        println!("{}.{}", rule.id(), rule.name());
        println!("    {}", rule.description());
        println!();
    }
    Ok(())
}
