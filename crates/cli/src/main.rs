mod commands {
    pub mod check;
    pub mod run;
    pub mod version;

    pub const DEFAULT_CONFIG: &str = "/etc/map646.conf";
}
mod route;

use clap::{Parser, Subcommand};
use commands::{check, run, version};

#[derive(Parser)]
#[command(name = "map646")]
#[command(about = "Stateless IPv4/IPv6 address translator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate packets on a tun interface
    Run(run::RunArgs),

    /// Load a configuration and print the mapping table
    Check(check::CheckArgs),

    /// Show version information
    Version(version::VersionArgs),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = dispatch().await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn dispatch() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run::run(args).await,
        Commands::Check(args) => check::run(args),
        Commands::Version(args) => {
            version::run(args);
            Ok(())
        }
    }
}
