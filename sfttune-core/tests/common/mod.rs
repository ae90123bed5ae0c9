//! Deterministic in-process backend for pipeline tests.
//!
//! "Training" derives a weight fingerprint from the dataset and writes it to disk;
//! generation reads the fingerprint back from the attached adapter directory, so any
//! output observed in verification must have gone through the filesystem.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sfttune_core::artifact::{ADAPTER_CONFIG_FILE, AdapterArtifact};
use sfttune_core::config::{
    AdapterConfig, DevicePlacement, GenerationConfig, PipelineConfig, QuantizationConfig,
};
use sfttune_core::error::{Result, TuneError};
use sfttune_core::metrics::{StepLog, TrainingMetrics, TrainingReport};
use sfttune_core::provider::{
    AdapterProvider, AttachedAdapter, Backend, ChatMessage, GenerationProvider, ModelHandle,
    ModelProvider, PaddingSide, TextGenerator, TokenizerHandle, TrainableModel, TrainingInputs,
    TrainingProvider,
};

pub const WEIGHTS_FILE: &str = "adapter_model.safetensors";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Shared record of provider calls, in order.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub struct FakeBackend {
    pub calls: CallLog,
    pub eos_token: Option<String>,
    pub pad_token: Option<String>,
    pub final_loss: f64,
    pub observed_batch: Mutex<Option<u32>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            eos_token: Some("<eos>".to_string()),
            pad_token: None,
            final_loss: 1.25,
            observed_batch: Mutex::new(None),
        }
    }
}

impl FakeBackend {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, name: &str) -> bool {
        self.calls().iter().any(|c| c == name)
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }
}

#[async_trait]
impl ModelProvider for FakeBackend {
    async fn load_model(
        &self,
        model_id: &str,
        quantization: &QuantizationConfig,
        placement: DevicePlacement,
    ) -> Result<ModelHandle> {
        self.record("load_model");
        if model_id.is_empty() {
            return Err(TuneError::model("empty model id"));
        }
        Ok(ModelHandle::new(model_id, quantization, placement))
    }

    async fn load_tokenizer(&self, source: &str) -> Result<TokenizerHandle> {
        self.record("load_tokenizer");
        let saved = Path::new(source).join(TOKENIZER_FILE);
        if saved.is_file() {
            let content = std::fs::read_to_string(saved)?;
            let tokenizer: TokenizerHandle = serde_json::from_str(&content)?;
            return Ok(TokenizerHandle {
                source: source.to_string(),
                ..tokenizer
            });
        }
        Ok(TokenizerHandle {
            source: source.to_string(),
            eos_token: self.eos_token.clone(),
            pad_token: self.pad_token.clone(),
            padding_side: PaddingSide::Left,
            has_chat_template: true,
        })
    }
}

#[async_trait]
impl AdapterProvider for FakeBackend {
    async fn attach_adapter(
        &self,
        model: ModelHandle,
        adapter: &AdapterConfig,
    ) -> Result<TrainableModel> {
        self.record("attach_adapter");
        Ok(TrainableModel::new(model, adapter))
    }

    async fn load_adapter(&self, mut model: ModelHandle, artifact: &Path) -> Result<ModelHandle> {
        self.record("load_adapter");
        let artifact = AdapterArtifact::open(artifact)?;
        model.adapter = Some(AttachedAdapter {
            path: artifact.path().to_path_buf(),
            merged: false,
        });
        Ok(model)
    }
}

/// Weight fingerprint a run over `texts` produces.
pub fn fingerprint<'a>(texts: impl Iterator<Item = &'a str>) -> String {
    let mut sum: u64 = 0;
    let mut count = 0;
    for text in texts {
        count += 1;
        for b in text.bytes() {
            sum = sum.wrapping_mul(31).wrapping_add(u64::from(b));
        }
    }
    format!("w{count}-{sum:x}")
}

#[async_trait]
impl TrainingProvider for FakeBackend {
    async fn run_training(
        &self,
        model: &mut TrainableModel,
        inputs: TrainingInputs<'_>,
    ) -> Result<TrainingReport> {
        self.record("run_training");
        assert!(!model.base.use_cache, "training must run with the cache off");

        let effective = inputs.training.effective_batch_size();
        *self.observed_batch.lock().unwrap() = Some(effective);

        let field = inputs.sft.dataset_text_field.as_str();
        let weights = fingerprint(
            (0..inputs.dataset.len()).filter_map(|i| inputs.dataset.text(i, field)),
        );

        let staging = inputs.training.output_dir.join(".staging");
        std::fs::create_dir_all(&staging)?;
        std::fs::write(
            staging.join(ADAPTER_CONFIG_FILE),
            serde_json::to_vec(&json!({
                "r": model.adapter.rank,
                "lora_alpha": model.adapter.alpha,
                "target_modules": model.adapter.target_modules,
            }))?,
        )?;
        std::fs::write(staging.join(WEIGHTS_FILE), &weights)?;
        std::fs::write(
            staging.join(TOKENIZER_FILE),
            serde_json::to_vec(inputs.tokenizer)?,
        )?;
        model.staged_weights = Some(staging);

        let mut metrics = TrainingMetrics::default();
        metrics.record_step(StepLog {
            step: 1,
            loss: self.final_loss,
            learning_rate: Some(inputs.training.learning_rate),
            grad_norm: None,
        });
        Ok(TrainingReport {
            global_steps: 1,
            training_loss: self.final_loss,
            effective_batch_size: effective,
            runtime_secs: 0.0,
            metrics,
        })
    }

    async fn persist(&self, model: &TrainableModel, dir: &Path) -> Result<()> {
        self.record("persist");
        let staged = model
            .staged_weights
            .as_ref()
            .ok_or_else(|| TuneError::training("nothing staged"))?;
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        AdapterArtifact::open(staged)?.mirror_to(dir)?;
        std::fs::remove_dir_all(staged)?;
        Ok(())
    }
}

pub struct FakeGenerator {
    weights: String,
    max_new_tokens: u32,
    calls: CallLog,
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn render_chat(&mut self, messages: &[ChatMessage]) -> Result<String> {
        let mut out = String::new();
        for m in messages {
            let role = serde_json::to_value(m.role)?;
            out.push_str(&format!("<{}>{}", role.as_str().unwrap_or("?"), m.content));
        }
        out.push_str("<model>");
        Ok(out)
    }

    async fn generate(&mut self, prompt: &str) -> Result<String> {
        Ok(format!(
            "{} [{}; max {}]",
            prompt.len(),
            self.weights,
            self.max_new_tokens
        ))
    }

    async fn close(&mut self) -> Result<()> {
        self.calls.lock().unwrap().push("close_generator".to_string());
        Ok(())
    }
}

#[async_trait]
impl GenerationProvider for FakeBackend {
    async fn text_generator(
        &self,
        model: &ModelHandle,
        _tokenizer: &TokenizerHandle,
        generation: &GenerationConfig,
    ) -> Result<Box<dyn TextGenerator>> {
        self.record("text_generator");
        let weights = match &model.adapter {
            Some(adapter) => std::fs::read_to_string(adapter.path.join(WEIGHTS_FILE))?,
            None => "base".to_string(),
        };
        Ok(Box::new(FakeGenerator {
            weights,
            max_new_tokens: generation.max_new_tokens,
            calls: self.calls.clone(),
        }))
    }
}

impl Backend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }
}

/// Config writing everything under `root`.
pub fn config_in(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.training.output_dir = root.join("results");
    config
}

/// Write `content` to `<root>/<name>` and return the path.
pub fn write_dataset(root: &Path, name: &str, content: &str) -> PathBuf {
    let path = root.join(name);
    std::fs::write(&path, content).unwrap();
    path
}
