use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use binward::cli::{self, Commands};

#[derive(Parser)]
#[command(name = "binward", version)]
#[command(about = "Checks PE, ELF, and Mach-O binaries for compiler and linker mitigations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit debug-level diagnostics (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = cli::handle_command(cli.command)?;
    std::process::exit(code)
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "binward=debug" } else { "binward=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
