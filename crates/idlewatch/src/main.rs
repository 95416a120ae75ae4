//! idlewatch - idle detection and lifecycle control for compute instances
//!
//! `fleet` runs the central detector with the admin API, `agent` runs the
//! on-instance loop, and `probe` prints one local sample for the remote
//! command channel.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use idlewatch::config::AppConfig;
use idlewatch::runtime::{self, AgentOptions};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "idlewatch", version, about = "Idle detection and lifecycle control")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "IDLEWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Mode {
    /// Evaluate every running instance on a fixed schedule
    Fleet,
    /// Evaluate this instance from local metrics
    Agent {
        #[arg(long, env = "IDLEWATCH_INSTANCE_ID")]
        instance_id: String,
        /// Run one trigger and exit
        #[arg(long)]
        once: bool,
        /// Do not serve health and metrics
        #[arg(long)]
        no_api: bool,
    },
    /// Print one local metric sample as JSON
    Probe {
        #[arg(long, default_value = "local")]
        instance_id: String,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Mode::Probe { instance_id } = &cli.command {
        let sample = runtime::probe(instance_id).await?;
        println!("{}", serde_json::to_string(&sample)?);
        return Ok(());
    }

    init_tracing(cli.log_format);
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Mode::Fleet => runtime::run_fleet(config).await,
        Mode::Agent {
            instance_id,
            once,
            no_api,
        } => {
            runtime::run_agent(
                config,
                AgentOptions {
                    instance_id,
                    once,
                    serve_api: !no_api,
                },
            )
            .await
        }
        Mode::Probe { .. } => Ok(()),
    }
}
