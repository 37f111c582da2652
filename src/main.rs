use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use tonekit::dispatch::BackendResolver;
use tonekit::settings::{GenerationDefaults, resolve_generation};
use tonekit::{Dispatcher, EventLog, Settings};

#[derive(Debug, Parser)]
#[command(name = "tonekit")]
#[command(about = "Controlled generation and session event log tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show which generation backend and model would be used.
    Probe,
    /// Aggregate the session event log.
    Report {
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();
    match cli.command {
        Commands::Probe => {
            let dispatcher = Dispatcher::new(settings.backends.clone());
            let none = GenerationDefaults::default();
            let eff = resolve_generation(&settings.generation, &none, &none);
            match dispatcher.select_backend().await {
                Some(backend) => println!("{} {}", backend.kind, backend.resolve_model(&eff.model)),
                None => anyhow::bail!(tonekit::GenerationError::NoBackendAvailable),
            }
        }
        Commands::Report { output } => {
            let log = EventLog::from_settings(&settings);
            let report = tonekit::analytics::export_analytics(&log, output.as_deref()).await?;
            if output.is_none() {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
    }
    Ok(())
}
