//! Command Runner CLI

use anyhow::Context;
use clap::Parser;
use command_runner::{init_logging, CommandRunner, RunnerConfig, RunnerError};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "droppy-run", version = command_runner::VERSION)]
#[command(about = "Run a quick command in your login shell", long_about = None)]
struct Cli {
    /// Timeout (seconds)
    #[arg(long)]
    timeout: Option<u64>,

    /// Output ceiling (bytes)
    #[arg(long)]
    max_output: Option<usize>,

    /// YAML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Command line to run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    let mut config = RunnerConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(timeout) = cli.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(max_output) = cli.max_output {
        config.max_output_bytes = max_output;
    }
    config.validate()?;

    let runner = CommandRunner::new(config);
    let request = runner.request(cli.command.join(" "));

    match runner.execute(&request).await {
        Ok(result) => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if !result.output_text.is_empty() {
                println!("{}", result.output_text);
            }
            Ok(())
        }
        Err(RunnerError::EmptyCommand) => {
            eprintln!("Usage: droppy-run [OPTIONS] <command...>");
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
