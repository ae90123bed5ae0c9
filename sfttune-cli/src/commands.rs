//! Subcommand handlers for the sfttune CLI.

use crate::{AuthAction, Commands, ConfigAction, DatasetAction, SourceArg};
use sfttune_core::config::{
    self, ArtifactSource, ModelConfig, PipelineConfig, VerificationConfig,
};
use sfttune_core::credentials::{
    CredentialError, CredentialStore, DEFAULT_HUB, KeyringCredentialStore, TokenSource,
    resolve_hub_token,
};
use sfttune_core::{PythonBackend, PythonRuntime, acquire_dataset, pipeline};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

impl From<SourceArg> for ArtifactSource {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Primary => ArtifactSource::Primary,
            SourceArg::Mirror => ArtifactSource::Mirror,
        }
    }
}

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            dataset,
            model,
            skip_verify,
        } => handle_run(workspace, config_path, dataset, model, skip_verify).await,
        Commands::Verify { adapter, source } => {
            handle_verify(workspace, config_path, adapter, source).await
        }
        Commands::Dataset { action } => handle_dataset(action, workspace, config_path).await,
        Commands::Config { action } => handle_config(action, workspace, config_path),
        Commands::Auth { action } => {
            let store = KeyringCredentialStore::new();
            handle_auth(action, workspace, config_path, &store)
        }
        Commands::Env { install } => handle_env(workspace, config_path, install).await,
    }
}

/// Load configuration and anchor its relative paths at the workspace.
fn load(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let config = config::load_config(Some(workspace), config_path)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    Ok(anchor(config, workspace))
}

fn anchor(config: PipelineConfig, workspace: &Path) -> PipelineConfig {
    let mut training = config.training.clone();
    training.output_dir = resolve_path(workspace, &training.output_dir);
    let mut mirror = config.mirror.clone();
    mirror.dir = mirror.dir.map(|d| resolve_path(workspace, &d));
    PipelineConfig {
        training,
        mirror,
        ..config
    }
}

fn resolve_path(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

fn build_backend(
    config: &PipelineConfig,
    workspace: &Path,
    store: &dyn CredentialStore,
) -> PythonBackend {
    let mut runtime = PythonRuntime::from_config(&config.runtime, workspace.to_path_buf());
    match resolve_hub_token(&config.hub, store, |name| std::env::var(name).ok()) {
        Some(token) => {
            debug!(source = ?token.source, "Hub token resolved");
            runtime = runtime.with_env("HF_TOKEN", token.expose());
        }
        None => warn!(
            "No hub access token found; gated models will fail to load. Run `sfttune auth login`."
        ),
    }
    PythonBackend::new(runtime)
}

fn prompt_dataset_path() -> anyhow::Result<PathBuf> {
    let input: String = dialoguer::Input::new()
        .with_prompt("Path to the training dataset (.jsonl or .json)")
        .interact_text()?;
    Ok(PathBuf::from(input.trim()))
}

async fn handle_run(
    workspace: &Path,
    config_path: Option<&Path>,
    dataset: Option<PathBuf>,
    model: Option<String>,
    skip_verify: bool,
) -> anyhow::Result<()> {
    let base = load(workspace, config_path)?;
    let model = ModelConfig {
        model_id: model.unwrap_or_else(|| base.model.model_id.clone()),
        ..base.model.clone()
    };
    let verification = VerificationConfig {
        enabled: base.verification.enabled && !skip_verify,
        ..base.verification.clone()
    };
    let config = PipelineConfig {
        model,
        verification,
        ..base
    };

    let dataset = match dataset {
        Some(path) => path,
        None => prompt_dataset_path()?,
    };
    let dataset = resolve_path(workspace, &dataset);

    let backend = build_backend(&config, workspace, &KeyringCredentialStore::new());
    let outcome = pipeline::run(&backend, &config, &dataset).await?;

    println!(
        "Trained on {} records ({:?}); {} steps, final loss {:.4}",
        outcome.dataset.dataset.len(),
        outcome.dataset.strategy,
        outcome.fine_tune.report.global_steps,
        outcome.fine_tune.report.training_loss
    );
    println!("Adapter: {}", outcome.fine_tune.artifact.path().display());
    if let Some(mirror) = &outcome.mirror {
        println!("Mirror:  {}", mirror.path().display());
    }
    if let Some(report) = &outcome.verification {
        print_probes(&report.probes);
    }
    Ok(())
}

async fn handle_verify(
    workspace: &Path,
    config_path: Option<&Path>,
    adapter: Option<PathBuf>,
    source: Option<SourceArg>,
) -> anyhow::Result<()> {
    let base = load(workspace, config_path)?;
    let verification = VerificationConfig {
        source: source.map(Into::into).unwrap_or(base.verification.source),
        ..base.verification.clone()
    };
    let config = PipelineConfig {
        verification,
        ..base
    };

    let artifact_dir = match adapter {
        Some(dir) => resolve_path(workspace, &dir),
        None => config.verification_artifact_dir()?,
    };
    let backend = build_backend(&config, workspace, &KeyringCredentialStore::new());
    let report = pipeline::verify(&backend, &config, &artifact_dir).await?;
    print_probes(&report.probes);
    println!(
        "\nTranscript written to {}",
        config.verification_report_path().display()
    );
    Ok(())
}

fn print_probes(probes: &[pipeline::ProbeResult]) {
    for (i, probe) in probes.iter().enumerate() {
        println!("\n--- Probe {} ---", i + 1);
        println!("Prompt: {}", probe.prompt);
        println!("{}", probe.generated_text);
    }
}

async fn handle_dataset(
    action: DatasetAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        DatasetAction::Check { path } => {
            let config = load(workspace, config_path)?;
            let path = resolve_path(workspace, &path);
            let acquired = acquire_dataset(&path, &config.sft.dataset_text_field).await?;
            println!("Dataset: {}", acquired.source.display());
            println!("  Format:  {:?}", acquired.strategy);
            println!("  Records: {}", acquired.dataset.len());
            println!("  Columns: {}", acquired.dataset.column_names().join(", "));
            Ok(())
        }
    }
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = config::workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let toml_str = toml::to_string_pretty(&PipelineConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = config::load_config(Some(workspace), config_path)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

fn handle_auth(
    action: AuthAction,
    workspace: &Path,
    config_path: Option<&Path>,
    store: &dyn CredentialStore,
) -> anyhow::Result<()> {
    match action {
        AuthAction::Login => {
            let token: String = dialoguer::Password::new()
                .with_prompt("Hugging Face access token")
                .interact()?;
            store_token(store, &token)?;
            println!("Token stored in the OS keyring.");
            Ok(())
        }
        AuthAction::Status => {
            let config = load(workspace, config_path)?;
            println!("{}", token_status(&config, store, |name| std::env::var(name).ok()));
            Ok(())
        }
        AuthAction::Logout => {
            match store.delete_token(DEFAULT_HUB) {
                Ok(()) => println!("Stored token removed."),
                Err(CredentialError::NotFound { .. }) => println!("No stored token."),
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }
    }
}

fn store_token(store: &dyn CredentialStore, token: &str) -> anyhow::Result<()> {
    let token = token.trim();
    if token.is_empty() {
        anyhow::bail!("Token is empty");
    }
    store.store_token(DEFAULT_HUB, token)?;
    Ok(())
}

fn token_status<F>(config: &PipelineConfig, store: &dyn CredentialStore, env_lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match resolve_hub_token(&config.hub, store, env_lookup).map(|t| t.source) {
        Some(TokenSource::Environment) => {
            format!("Hub token: from environment variable {}", config.hub.token_env)
        }
        Some(TokenSource::Keyring) => "Hub token: from OS keyring".to_string(),
        None => "Hub token: not configured".to_string(),
    }
}

async fn handle_env(
    workspace: &Path,
    config_path: Option<&Path>,
    install: bool,
) -> anyhow::Result<()> {
    let config = load(workspace, config_path)?;
    let runtime = PythonRuntime::from_config(&config.runtime, workspace.to_path_buf());

    let info = PythonRuntime::detect().await?;
    println!("Python:  {} ({})", info.version, runtime.python_cmd().display());
    if let Some(venv) = &info.venv_path {
        println!("Venv:    {}", venv.display());
    }
    println!("pip:     {}", if info.has_pip { "yes" } else { "no" });

    let versions = runtime
        .package_versions(&config.runtime.required_packages)
        .await;
    let mut missing = Vec::new();
    println!("\nPackages:");
    for (name, version) in &versions {
        match version {
            Some(v) => println!("  {name:<14} {v}"),
            None => {
                println!("  {name:<14} missing");
                missing.push(name.clone());
            }
        }
    }

    if missing.is_empty() {
        return Ok(());
    }
    if install {
        runtime.ensure_packages(&missing).await?;
        println!("\nInstalled: {}", missing.join(", "));
    } else {
        println!("\nRun `sfttune env --install` to install the missing packages.");
    }
    Ok(())
}
