//! Configuration records for a fine-tuning run.
//!
//! Uses `figment` for layered configuration: defaults -> user config -> workspace config
//! -> explicit file -> environment. Configuration is loaded from
//! `~/.config/sfttune/config.toml` and/or `.sfttune/config.toml` in the workspace.
//!
//! Every record is assembled once and then only borrowed. Changing a hyperparameter
//! means building a new record (`TrainingConfig { learning_rate: 1e-4, ..base }`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TuneError};

/// Name of the subdirectory of `output_dir` that receives the trained adapter.
pub const FINAL_ADAPTER_DIR: &str = "final_adapter";

/// Everything a pipeline run needs, assembled before any stage executes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub quantization: QuantizationConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub sft: SftConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub hub: HubConfig,
}

impl PipelineConfig {
    /// Directory the fine-tuning stage persists the adapter into.
    pub fn adapter_dir(&self) -> PathBuf {
        self.training.output_dir.join(FINAL_ADAPTER_DIR)
    }

    /// Where the verification pass writes its probe transcript.
    pub fn verification_report_path(&self) -> PathBuf {
        self.training
            .output_dir
            .join(&self.verification.report_file)
    }

    /// Resolve the artifact directory the verification pass should read from.
    pub fn verification_artifact_dir(&self) -> Result<PathBuf> {
        match self.verification.source {
            ArtifactSource::Primary => Ok(self.adapter_dir()),
            ArtifactSource::Mirror => self.mirror.dir.clone().ok_or_else(|| {
                TuneError::Config(
                    "verification.source = \"mirror\" requires mirror.dir to be set".to_string(),
                )
            }),
        }
    }
}

/// Base model selection and load-time adjustments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hub identifier or local path of the pretrained causal LM.
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Device placement strategy handed to the loader.
    #[serde(default)]
    pub device_placement: DevicePlacement,
    /// Tensor-parallel compatibility setting forced on the loaded model config.
    #[serde(default = "default_pretraining_tp")]
    pub pretraining_tp: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            device_placement: DevicePlacement::default(),
            pretraining_tp: default_pretraining_tp(),
        }
    }
}

fn default_model_id() -> String {
    "google/gemma-2-9b-it".to_string()
}

fn default_pretraining_tp() -> Option<u32> {
    Some(1)
}

/// How model weights are spread across devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePlacement {
    /// Let the loader distribute layers across the available accelerators.
    #[default]
    Auto,
    Cuda,
    Cpu,
}

impl DevicePlacement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Cuda => "cuda",
            Self::Cpu => "cpu",
        }
    }
}

/// Low-rank adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Rank of the update matrices.
    #[serde(default = "default_rank")]
    pub rank: u32,
    /// Scaling factor applied to the adapter output.
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    /// Module names the adapter is injected into, in first-seen order without repeats.
    #[serde(
        default = "default_target_modules",
        deserialize_with = "deserialize_module_set"
    )]
    pub target_modules: Vec<String>,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default)]
    pub bias: BiasMode,
    #[serde(default)]
    pub task_type: TaskType,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            rank: default_rank(),
            alpha: default_alpha(),
            target_modules: default_target_modules(),
            dropout: default_dropout(),
            bias: BiasMode::default(),
            task_type: TaskType::default(),
        }
    }
}

impl AdapterConfig {
    /// Replace the target module list, collapsing repeats.
    pub fn with_target_modules<I, S>(self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target_modules: ordered_set(modules.into_iter().map(Into::into)),
            ..self
        }
    }
}

fn default_rank() -> u32 {
    16
}

fn default_alpha() -> f32 {
    32.0
}

fn default_dropout() -> f32 {
    0.05
}

fn default_target_modules() -> Vec<String> {
    [
        "q_proj",
        "k_proj",
        "v_proj",
        "o_proj",
        "gate_proj",
        "up_proj",
        "down_proj",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn ordered_set(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn deserialize_module_set<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    Ok(ordered_set(raw.into_iter()))
}

/// Which bias parameters the adapter trains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasMode {
    #[default]
    None,
    All,
    LoraOnly,
}

/// Adapter task type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    CausalLm,
    Seq2SeqLm,
    SeqCls,
    TokenCls,
}

/// Load-time weight quantization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    #[serde(default = "default_true")]
    pub load_in_4bit: bool,
    #[serde(default)]
    pub quant_type: QuantType,
    #[serde(default)]
    pub compute_dtype: ComputeDtype,
    #[serde(default)]
    pub double_quant: bool,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            load_in_4bit: true,
            quant_type: QuantType::default(),
            compute_dtype: ComputeDtype::default(),
            double_quant: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantType {
    #[default]
    Nf4,
    Fp4,
}

/// Numeric precision used for matmuls over quantized weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeDtype {
    Float16,
    #[default]
    Bfloat16,
    Float32,
}

/// Trainer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Directory for checkpoints, logs and the final adapter.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_epochs")]
    pub num_train_epochs: f64,
    #[serde(default = "default_one")]
    pub per_device_train_batch_size: u32,
    #[serde(default = "default_accumulation")]
    pub gradient_accumulation_steps: u32,
    #[serde(default = "default_optim")]
    pub optim: String,
    /// Checkpoint interval in optimizer steps.
    #[serde(default = "default_save_steps")]
    pub save_steps: u32,
    /// Metric log interval in optimizer steps.
    #[serde(default = "default_logging_steps")]
    pub logging_steps: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub fp16: bool,
    #[serde(default = "default_true")]
    pub bf16: bool,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    /// Step bound. When unset the epoch count governs.
    #[serde(default)]
    pub max_steps: Option<u64>,
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,
    #[serde(default)]
    pub lr_scheduler_type: SchedulerType,
    #[serde(default = "default_true")]
    pub group_by_length: bool,
    #[serde(default = "default_report_to")]
    pub report_to: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            num_train_epochs: default_epochs(),
            per_device_train_batch_size: default_one(),
            gradient_accumulation_steps: default_accumulation(),
            optim: default_optim(),
            save_steps: default_save_steps(),
            logging_steps: default_logging_steps(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            fp16: false,
            bf16: true,
            max_grad_norm: default_max_grad_norm(),
            max_steps: None,
            warmup_ratio: default_warmup_ratio(),
            lr_scheduler_type: SchedulerType::default(),
            group_by_length: true,
            report_to: default_report_to(),
            seed: default_seed(),
        }
    }
}

impl TrainingConfig {
    /// Samples contributing to one optimizer step on a single device.
    pub fn effective_batch_size(&self) -> u32 {
        self.per_device_train_batch_size
            .saturating_mul(self.gradient_accumulation_steps)
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./gemma2-finetuned-results")
}

fn default_epochs() -> f64 {
    1.0
}

fn default_one() -> u32 {
    1
}

fn default_accumulation() -> u32 {
    4
}

fn default_optim() -> String {
    "paged_adamw_8bit".to_string()
}

fn default_save_steps() -> u32 {
    50
}

fn default_logging_steps() -> u32 {
    10
}

fn default_learning_rate() -> f64 {
    2e-4
}

fn default_weight_decay() -> f64 {
    0.001
}

fn default_max_grad_norm() -> f64 {
    0.3
}

fn default_warmup_ratio() -> f64 {
    0.03
}

fn default_report_to() -> String {
    "tensorboard".to_string()
}

fn default_seed() -> u64 {
    42
}

/// Learning-rate schedule shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    Linear,
    #[default]
    Cosine,
    CosineWithRestarts,
    Polynomial,
    Constant,
    ConstantWithWarmup,
}

/// Supervised fine-tuning trainer options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftConfig {
    #[serde(default = "default_text_field")]
    pub dataset_text_field: String,
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: u32,
    /// Pack several short sequences into one training example.
    #[serde(default)]
    pub packing: bool,
}

impl Default for SftConfig {
    fn default() -> Self {
        Self {
            dataset_text_field: default_text_field(),
            max_seq_length: default_max_seq_length(),
            packing: false,
        }
    }
}

fn default_text_field() -> String {
    crate::dataset::TEXT_FIELD.to_string()
}

fn default_max_seq_length() -> u32 {
    512
}

/// Decoding settings for verification probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,
    /// Greedy decoding when false, which keeps probe output reproducible.
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            do_sample: false,
            temperature: None,
            top_p: None,
            repetition_penalty: None,
        }
    }
}

fn default_max_new_tokens() -> u32 {
    100
}

/// Which persisted copy of the adapter the verification pass reloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    /// `<output_dir>/final_adapter`.
    #[default]
    Primary,
    /// The mirror directory.
    Mirror,
}

/// Post-training generation probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub source: ArtifactSource,
    #[serde(default = "default_prompts")]
    pub prompts: Vec<String>,
    #[serde(default)]
    pub generation: GenerationConfig,
    /// File name, relative to `output_dir`, for the probe transcript.
    #[serde(default = "default_report_file")]
    pub report_file: String,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: ArtifactSource::default(),
            prompts: default_prompts(),
            generation: GenerationConfig::default(),
            report_file: default_report_file(),
        }
    }
}

fn default_prompts() -> Vec<String> {
    vec!["Generate a short news snippet about a recent event.".to_string()]
}

fn default_report_file() -> String {
    "verification.json".to_string()
}

/// Secondary durable copy of the adapter artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// How the Python helper process is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Path to Python executable (`python3` if not set).
    #[serde(default)]
    pub python_path: Option<PathBuf>,
    /// Virtual environment whose interpreter takes precedence.
    #[serde(default)]
    pub venv_path: Option<PathBuf>,
    /// Upper bound per helper invocation. Unset means wait indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_required_packages")]
    pub required_packages: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            python_path: None,
            venv_path: None,
            timeout_secs: None,
            required_packages: default_required_packages(),
        }
    }
}

fn default_required_packages() -> Vec<String> {
    [
        "torch",
        "transformers",
        "datasets",
        "peft",
        "accelerate",
        "bitsandbytes",
        "trl",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Model hub access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Environment variable consulted first for the access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
        }
    }
}

fn default_token_env() -> String {
    "HF_TOKEN".to_string()
}

fn default_true() -> bool {
    true
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `SFTTUNE_`, nested keys split on `__`)
/// 2. Explicit config file (`--config`)
/// 3. Workspace-local config (`.sfttune/config.toml`)
/// 4. User config (`~/.config/sfttune/config.toml`)
/// 5. Built-in defaults
pub fn load_config(workspace: Option<&Path>, explicit: Option<&Path>) -> Result<PipelineConfig> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(TuneError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    // SFTTUNE_TRAINING__LEARNING_RATE, SFTTUNE_MODEL__MODEL_ID, etc.
    figment = figment.merge(Env::prefixed("SFTTUNE_").split("__"));

    figment.extract().map_err(|e| TuneError::Config(e.to_string()))
}

/// `<workspace>/.sfttune/config.toml`.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".sfttune").join("config.toml")
}

/// `~/.config/sfttune/config.toml` (platform equivalent).
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "sfttune", "sfttune")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
