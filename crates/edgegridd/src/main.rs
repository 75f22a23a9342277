//! edgegridd — the edgegrid regional controller.
//!
//! # Usage
//!
//! ```text
//! edgegridd run --config /etc/edgegrid/controller.toml --demo-cloudlet operator/edge1
//! edgegridd default-config > controller.toml
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use edgegrid_core::{CloudletKey, ControllerConfig};
use edgegridd::ControlPlane;
use tracing::info;

#[derive(Parser)]
#[command(name = "edgegridd", about = "edgegrid regional controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until interrupted.
    Run {
        /// Configuration file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Overrides `data_dir` from the configuration.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Attach an in-process agent to this cloudlet (`org/name`).
        #[arg(long)]
        demo_cloudlet: Option<String>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Print the default configuration.
    DefaultConfig,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_cloudlet(s: &str) -> anyhow::Result<CloudletKey> {
    let (org, name) = s
        .split_once('/')
        .with_context(|| format!("cloudlet {s:?} is not org/name"))?;
    Ok(CloudletKey::new(org, name))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::DefaultConfig => {
            print!("{}", ControllerConfig::default().to_toml_string()?);
            Ok(())
        }
        Command::Run {
            config,
            data_dir,
            demo_cloudlet,
            log_json,
        } => {
            init_tracing(log_json);
            let mut cfg = match &config {
                Some(path) => ControllerConfig::from_file(path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => ControllerConfig::default(),
            };
            if let Some(dir) = data_dir {
                cfg.data_dir = dir;
            }
            run(cfg, demo_cloudlet).await
        }
    }
}

async fn run(cfg: ControllerConfig, demo_cloudlet: Option<String>) -> anyhow::Result<()> {
    info!(region = cfg.region, data_dir = ?cfg.data_dir, "edgegridd starting");
    let mut plane = ControlPlane::open(&cfg, &cfg.data_dir).await?;
    if let Some(cloudlet) = demo_cloudlet {
        plane.start_demo(parse_cloudlet(&cloudlet)?).await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    plane.shutdown().await;
    Ok(())
}
