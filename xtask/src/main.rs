use anyhow::Result;
use clap::{Parser, Subcommand};
use fbagent_core::AgentConfig;
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the agent workspace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build,
    /// Run the agent, forwarding any extra arguments
    Run {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Run the workspace tests
    Test,
    /// Write a configuration file holding the defaults
    DefaultConfig {
        #[arg(default_value = "fbagent.toml")]
        path: PathBuf,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building workspace...");
            cargo(&["build", "--workspace"], "Build")?;
        }
        Commands::Run { args } => {
            println!("Running agent...");
            let mut full = vec!["run", "-p", "fbagent-cli", "--"];
            full.extend(args.iter().map(String::as_str));
            cargo(&full, "Run")?;
        }
        Commands::Test => {
            println!("Testing workspace...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::DefaultConfig { path } => {
            AgentConfig::default().save_to_file(path)?;
            println!("Wrote {}", path.display());
        }
    }

    Ok(())
}
