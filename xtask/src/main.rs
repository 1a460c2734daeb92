use anyhow::Result;
use clap::{Parser, Subcommand};
use dmk_core::DmkConfig;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run every test of the workspace
    Test,
    /// Run the CLI flow against the simulated devices
    Demo {
        /// Lock and unlock the device during the demo
        #[arg(long)]
        simulate_lock: bool,
    },
    /// Print the default kit configuration
    Config,
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build", "--workspace"], "Build")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::Demo { simulate_lock } => {
            println!("Running demo...");
            let mut args = vec!["run", "-p", "dmk-cli", "--", "run"];
            if *simulate_lock {
                args.push("--simulate-lock");
            }
            cargo(&args, "Demo")?;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&DmkConfig::default())?);
        }
    }

    Ok(())
}
