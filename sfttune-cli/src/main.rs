//! sfttune CLI: run and inspect quantized LoRA fine-tuning pipelines.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// sfttune: supervised LoRA fine-tuning over 4-bit quantized models
#[derive(Parser, Debug)]
#[command(name = "sfttune", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Run the full pipeline: dataset, model preparation, fine-tuning, verification
    Run {
        /// Training dataset (JSON Lines or a JSON array); prompted for when omitted
        #[arg(short, long)]
        dataset: Option<PathBuf>,

        /// Base model identifier, overriding the configuration
        #[arg(short, long)]
        model: Option<String>,

        /// Stop after the adapter is persisted
        #[arg(long)]
        skip_verify: bool,
    },
    /// Reload a persisted adapter and run the generation probes
    Verify {
        /// Adapter directory (defaults to the configured source)
        #[arg(short, long)]
        adapter: Option<PathBuf>,

        /// Which persisted copy to reload
        #[arg(long, value_enum)]
        source: Option<SourceArg>,
    },
    /// Inspect training datasets
    Dataset {
        #[command(subcommand)]
        action: DatasetAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manage the model hub access token
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
    /// Report the Python environment the backend runs in
    Env {
        /// Install missing packages with pip
        #[arg(long)]
        install: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SourceArg {
    Primary,
    Mirror,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum DatasetAction {
    /// Parse and validate a dataset without loading a model
    Check {
        /// Dataset file
        path: PathBuf,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum AuthAction {
    /// Store a hub access token in the OS keyring
    Login,
    /// Show where the hub token would be read from
    Status,
    /// Remove the stored hub token
    Logout,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "sfttune", "sfttune")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "sfttune.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from([
            "sfttune",
            "run",
            "--dataset",
            "train.jsonl",
            "--model",
            "google/gemma-2-2b-it",
            "--skip-verify",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run {
                dataset,
                model,
                skip_verify,
            } => {
                assert_eq!(dataset, Some(PathBuf::from("train.jsonl")));
                assert_eq!(model.as_deref(), Some("google/gemma-2-2b-it"));
                assert!(skip_verify);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_verify_source() {
        let cli = Cli::parse_from(["sfttune", "--quiet", "verify", "--source", "mirror"]);
        assert!(cli.quiet);
        assert!(matches!(
            cli.command,
            Commands::Verify {
                adapter: None,
                source: Some(SourceArg::Mirror)
            }
        ));
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["sfttune"]).is_err());
    }
}
