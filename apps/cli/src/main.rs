use std::path::PathBuf;

use clap::Parser;
use fbagent_core::{Agent, AgentConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Device-side fastboot flashing agent", long_about = None)]
struct Args {
    /// Path to the agent configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scratch buffer size in bytes (0 picks one from free memory)
    #[arg(long)]
    scratch_size: Option<usize>,

    /// TCP port used when no USB function is available
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Install script to run before serving hosts
    #[arg(long)]
    script: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> anyhow::Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::load_from_file(path)?,
        None => AgentConfig::default(),
    };
    if let Some(size) = args.scratch_size {
        config.scratch_size = size;
    }
    if let Some(port) = args.tcp_port {
        config.tcp_port = port;
    }
    if let Some(script) = &args.script {
        config.script_path = Some(script.clone());
    }
    Ok(config)
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting fastboot agent...");

    let agent = match load_config(&args).and_then(Agent::new) {
        Ok(agent) => agent,
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    agent.run();
}
