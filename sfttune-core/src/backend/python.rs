//! Python-backed provider.
//!
//! Handles on the Rust side only describe model state; every call ships that description
//! to the embedded helper, which materializes it with transformers, peft and trl.
//! Training writes into a staging directory under `output_dir` that [`persist`] later
//! moves into place, and generation runs in a worker that keeps the model resident.
//!
//! [`persist`]: TrainingProvider::persist

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::artifact::AdapterArtifact;
use crate::config::{AdapterConfig, DevicePlacement, GenerationConfig, QuantizationConfig};
use crate::error::{Result, TuneError};
use crate::metrics::{TrainingMetrics, TrainingReport, deserialize_reported_f64};
use crate::provider::{
    AdapterProvider, AttachedAdapter, Backend, ChatMessage, GenerationProvider, ModelHandle,
    ModelProvider, PaddingSide, TextGenerator, TokenizerHandle, TrainableModel, TrainingInputs,
    TrainingProvider,
};
use crate::runtime::{PythonRuntime, PythonWorker};

const HELPER: &str = include_str!("../../python/sfttune_helper.py");

/// File name of the JSON-Lines copy of the dataset handed to the trainer.
const TRAIN_FILE: &str = "sfttune_train.jsonl";

/// Provider that drives a Python interpreter with the Hugging Face stack installed.
#[derive(Clone)]
pub struct PythonBackend {
    runtime: PythonRuntime,
}

impl PythonBackend {
    pub fn new(runtime: PythonRuntime) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &PythonRuntime {
        &self.runtime
    }

    async fn call<T: DeserializeOwned>(&self, op: &str, request: &Value) -> Result<T> {
        let result = self.runtime.run_script(HELPER, &[op], request).await?;
        serde_json::from_value(result)
            .map_err(|e| TuneError::python(format!("unexpected '{op}' result: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    model_type: Option<String>,
    architecture: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenizerInfo {
    eos_token: Option<String>,
    pad_token: Option<String>,
    padding_side: Option<String>,
    #[serde(default)]
    has_chat_template: bool,
}

impl TrainResult {
    fn into_report(self) -> TrainingReport {
        TrainingReport {
            global_steps: self.global_steps,
            training_loss: self.training_loss,
            effective_batch_size: self.effective_batch_size,
            runtime_secs: self.runtime_secs,
            metrics: TrainingMetrics::from_log_history(&self.log_history),
        }
    }
}

impl TokenizerInfo {
    fn into_handle(self, source: String) -> TokenizerHandle {
        let padding_side = match self.padding_side.as_deref() {
            Some("left") => PaddingSide::Left,
            _ => PaddingSide::Right,
        };
        TokenizerHandle {
            source,
            eos_token: self.eos_token,
            pad_token: self.pad_token,
            padding_side,
            has_chat_template: self.has_chat_template,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TrainResult {
    global_steps: u64,
    #[serde(deserialize_with = "deserialize_reported_f64")]
    training_loss: f64,
    effective_batch_size: u32,
    #[serde(default, deserialize_with = "deserialize_reported_f64")]
    runtime_secs: f64,
    #[serde(default)]
    log_history: Vec<Value>,
}

/// Local directories are sent as absolute paths; the helper runs in the workspace.
fn resolve_source(source: &str) -> Result<String> {
    let path = Path::new(source);
    if path.exists() {
        Ok(std::path::absolute(path)?.to_string_lossy().into_owned())
    } else {
        Ok(source.to_string())
    }
}

#[async_trait]
impl ModelProvider for PythonBackend {
    async fn load_model(
        &self,
        model_id: &str,
        quantization: &QuantizationConfig,
        placement: DevicePlacement,
    ) -> Result<ModelHandle> {
        let model_id = resolve_source(model_id)?;
        let info: ModelInfo = self
            .call("inspect-model", &json!({ "model_id": model_id }))
            .await
            .map_err(|e| TuneError::model(format!("cannot load model '{model_id}': {e}")))?;

        let mut handle = ModelHandle::new(model_id, quantization, placement);
        handle.architecture = info.architecture.or(info.model_type);
        info!(
            model = %handle.model_id,
            architecture = ?handle.architecture,
            four_bit = quantization.load_in_4bit,
            placement = placement.as_str(),
            "Base model resolved"
        );
        Ok(handle)
    }

    async fn load_tokenizer(&self, source: &str) -> Result<TokenizerHandle> {
        let source = resolve_source(source)?;
        let info: TokenizerInfo = self
            .call("inspect-tokenizer", &json!({ "source": source }))
            .await
            .map_err(|e| TuneError::model(format!("cannot load tokenizer '{source}': {e}")))?;
        Ok(info.into_handle(source))
    }
}

#[async_trait]
impl AdapterProvider for PythonBackend {
    async fn attach_adapter(
        &self,
        model: ModelHandle,
        adapter: &AdapterConfig,
    ) -> Result<TrainableModel> {
        if model.adapter.is_some() {
            return Err(TuneError::model(format!(
                "model '{}' already carries an adapter",
                model.model_id
            )));
        }
        debug!(
            rank = adapter.rank,
            alpha = adapter.alpha,
            targets = ?adapter.target_modules,
            "Adapter injection deferred to the training helper"
        );
        Ok(TrainableModel::new(model, adapter))
    }

    async fn load_adapter(&self, mut model: ModelHandle, artifact: &Path) -> Result<ModelHandle> {
        if model.adapter.is_some() {
            return Err(TuneError::model(format!(
                "model '{}' already carries an adapter",
                model.model_id
            )));
        }
        let artifact = AdapterArtifact::open(std::path::absolute(artifact)?)?;
        model.adapter = Some(AttachedAdapter {
            path: artifact.path().to_path_buf(),
            merged: false,
        });
        Ok(model)
    }
}

#[async_trait]
impl TrainingProvider for PythonBackend {
    async fn run_training(
        &self,
        model: &mut TrainableModel,
        inputs: TrainingInputs<'_>,
    ) -> Result<TrainingReport> {
        let output_dir = std::path::absolute(&inputs.training.output_dir)?;
        tokio::fs::create_dir_all(&output_dir).await?;

        let dataset_path = output_dir.join(TRAIN_FILE);
        inputs.dataset.write_jsonl(&dataset_path).await?;

        let staging = output_dir.join(format!(".staging-{}", model.base.load_id.simple()));
        if staging.exists() {
            tokio::fs::remove_dir_all(&staging).await?;
        }

        let training = crate::config::TrainingConfig {
            output_dir: output_dir.clone(),
            ..inputs.training.clone()
        };
        let request = json!({
            "model": model,
            "tokenizer": inputs.tokenizer,
            "training": training,
            "sft": inputs.sft,
            "dataset_path": dataset_path,
            "staging_dir": staging,
        });

        info!(
            records = inputs.dataset.len(),
            output_dir = %output_dir.display(),
            "Starting training helper"
        );
        let outcome = self.call::<TrainResult>("train", &request).await;
        if let Err(e) = tokio::fs::remove_file(&dataset_path).await {
            debug!(
                error = %e,
                path = %dataset_path.display(),
                "Training copy of the dataset not removed"
            );
        }

        match outcome {
            Ok(result) => {
                model.staged_weights = Some(staging);
                Ok(result.into_report())
            }
            Err(e) => {
                remove_staging(&staging).await;
                Err(TuneError::training(e.to_string()))
            }
        }
    }

    async fn persist(&self, model: &TrainableModel, dir: &Path) -> Result<()> {
        let staged = model
            .staged_weights
            .as_deref()
            .ok_or_else(|| TuneError::training("no trained adapter weights to persist"))?;
        // Fails early if the helper did not write an adapter.
        let staged_artifact = AdapterArtifact::open(staged)?;

        if dir.exists() {
            tokio::fs::remove_dir_all(dir).await?;
        }
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Err(e) = tokio::fs::rename(staged, dir).await {
            warn!(error = %e, "Rename failed, copying staged adapter instead");
            staged_artifact.mirror_to(dir)?;
            tokio::fs::remove_dir_all(staged).await?;
        }
        debug!(dir = %dir.display(), "Adapter and tokenizer persisted");
        Ok(())
    }
}

async fn remove_staging(staging: &Path) {
    if !staging.exists() {
        return;
    }
    if let Err(e) = tokio::fs::remove_dir_all(staging).await {
        warn!(error = %e, dir = %staging.display(), "Staged adapter not removed");
    }
}

/// Generator backed by a resident `serve-generation` helper.
struct PythonGenerator {
    worker: Option<PythonWorker>,
}

impl PythonGenerator {
    fn worker(&mut self) -> Result<&mut PythonWorker> {
        self.worker
            .as_mut()
            .ok_or_else(|| TuneError::inference("generator already closed"))
    }
}

#[async_trait]
impl TextGenerator for PythonGenerator {
    async fn render_chat(&mut self, messages: &[ChatMessage]) -> Result<String> {
        let reply = self
            .worker()?
            .request(&json!({ "op": "render", "messages": messages }))
            .await?;
        reply
            .get("prompt")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| TuneError::inference("render reply carried no prompt"))
    }

    async fn generate(&mut self, prompt: &str) -> Result<String> {
        let reply = self
            .worker()?
            .request(&json!({ "op": "generate", "prompt": prompt }))
            .await?;
        reply
            .get("text")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| TuneError::inference("generate reply carried no text"))
    }

    async fn close(&mut self) -> Result<()> {
        match self.worker.take() {
            Some(worker) => worker.shutdown().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl GenerationProvider for PythonBackend {
    async fn text_generator(
        &self,
        model: &ModelHandle,
        tokenizer: &TokenizerHandle,
        generation: &GenerationConfig,
    ) -> Result<Box<dyn TextGenerator>> {
        let request = json!({
            "model": model,
            "tokenizer": tokenizer,
            "generation": generation,
        });
        let worker = self
            .runtime
            .spawn_worker(HELPER, &["serve-generation"], &request)
            .await
            .map_err(|e| TuneError::inference(format!("generation worker failed to start: {e}")))?;
        info!(
            model = %model.model_id,
            adapter = ?model.adapter.as_ref().map(|a| &a.path),
            "Generation worker ready"
        );
        Ok(Box::new(PythonGenerator {
            worker: Some(worker),
        }))
    }
}

impl Backend for PythonBackend {
    fn name(&self) -> &str {
        "python"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ADAPTER_CONFIG_FILE;
    use crate::config::{RuntimeConfig, SftConfig, TrainingConfig};
    use crate::dataset::Dataset;
    use pretty_assertions::assert_eq;

    fn backend(dir: &Path) -> PythonBackend {
        PythonBackend::new(PythonRuntime::new(dir.to_path_buf()))
    }

    fn staged_model(staging: &Path) -> TrainableModel {
        std::fs::create_dir_all(staging).unwrap();
        std::fs::write(staging.join(ADAPTER_CONFIG_FILE), r#"{"r": 16}"#).unwrap();
        std::fs::write(staging.join("adapter_model.safetensors"), b"delta").unwrap();
        let base = ModelHandle::new(
            "google/gemma-2-9b-it",
            &QuantizationConfig::default(),
            DevicePlacement::Auto,
        );
        TrainableModel {
            staged_weights: Some(staging.to_path_buf()),
            ..TrainableModel::new(base, &AdapterConfig::default())
        }
    }

    fn tokenizer() -> TokenizerHandle {
        TokenizerInfo {
            eos_token: Some("<eos>".into()),
            pad_token: None,
            padding_side: Some("left".into()),
            has_chat_template: true,
        }
        .into_handle("google/gemma-2-9b-it".into())
    }

    #[test]
    fn test_tokenizer_info_into_handle() {
        let tok = tokenizer();
        assert_eq!(tok.padding_side, PaddingSide::Left);
        assert_eq!(tok.eos_token.as_deref(), Some("<eos>"));
        assert!(tok.pad_token.is_none());
    }

    #[test]
    fn test_remote_source_is_untouched() {
        assert_eq!(
            resolve_source("google/gemma-2-9b-it").unwrap(),
            "google/gemma-2-9b-it"
        );
    }

    #[tokio::test]
    async fn test_persist_replaces_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("final_adapter");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("stale.bin"), b"old").unwrap();

        let model = staged_model(&dir.path().join(".staging-1"));
        backend(dir.path())
            .persist(&model, &out)
            .await
            .unwrap();

        let artifact = AdapterArtifact::open(&out).unwrap();
        assert!(!out.join("stale.bin").exists());
        assert!(artifact.weights_file().is_some());
        assert!(!dir.path().join(".staging-1").exists());
    }

    #[tokio::test]
    async fn test_persist_without_training_fails() {
        let dir = tempfile::tempdir().unwrap();
        let base = ModelHandle::new("m", &QuantizationConfig::default(), DevicePlacement::Cpu);
        let model = TrainableModel::new(base, &AdapterConfig::default());
        let err = backend(dir.path())
            .persist(&model, &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::Training(_)));
    }

    #[tokio::test]
    async fn test_load_adapter_attaches_unmerged() {
        let dir = tempfile::tempdir().unwrap();
        let model = staged_model(&dir.path().join("artifact"));
        let backend = backend(dir.path());

        let base = ModelHandle::new("m", &QuantizationConfig::default(), DevicePlacement::Cpu);
        let loaded = backend
            .load_adapter(base, &dir.path().join("artifact"))
            .await
            .unwrap();
        let attached = loaded.adapter.clone().unwrap();
        assert!(!attached.merged);
        assert!(attached.path.is_absolute());

        assert!(backend.load_adapter(loaded, &dir.path().join("artifact")).await.is_err());
        assert!(model.staged_weights.is_some());
    }

    #[tokio::test]
    async fn test_load_adapter_rejects_non_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let base = ModelHandle::new("m", &QuantizationConfig::default(), DevicePlacement::Cpu);
        let err = backend(dir.path())
            .load_adapter(base, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::Artifact(_)));
    }

    #[test]
    fn test_non_finite_training_loss_reaches_convergence_check() {
        let result: TrainResult = serde_json::from_value(json!({
            "global_steps": 12,
            "training_loss": "nan",
            "effective_batch_size": 4,
            "runtime_secs": 3.5,
            "log_history": [{"loss": 1.2, "step": 1, "grad_norm": "inf"}],
        }))
        .unwrap();
        let report = result.into_report();
        assert!(report.training_loss.is_nan());
        assert_eq!(report.metrics.steps[0].grad_norm, Some(f64::INFINITY));
        assert!(matches!(
            report.ensure_converged(),
            Err(TuneError::Training(_))
        ));
    }

    #[test]
    fn test_infinite_grad_norm_is_not_fatal() {
        let result: TrainResult = serde_json::from_value(json!({
            "global_steps": 2,
            "training_loss": 1.1,
            "effective_batch_size": 4,
            "log_history": [
                {"loss": 1.2, "step": 1, "grad_norm": "inf"},
                {"loss": 1.0, "step": 2, "grad_norm": 0.7},
            ],
        }))
        .unwrap();
        let report = result.into_report();
        assert_eq!(report.runtime_secs, 0.0);
        assert!(report.ensure_converged().is_ok());
    }

    #[tokio::test]
    async fn test_helper_reply_encodes_non_finite_floats() {
        if PythonRuntime::detect().await.is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let runtime = PythonRuntime::new(dir.path().to_path_buf());
        // Load the helper as a module so its entry point stays idle.
        let script = "import json, sys\n\
            req = json.load(sys.stdin)\n\
            ns = {'__name__': 'sfttune_helper'}\n\
            exec(req['helper'], ns)\n\
            ns['reply'](True, {'global_steps': 3, 'training_loss': float('nan'), \
            'effective_batch_size': 4, 'runtime_secs': 2.0, \
            'log_history': [{'loss': 1.2, 'step': 1, 'grad_norm': float('inf')}]})";
        let result = runtime
            .run_script(script, &[], &json!({ "helper": HELPER }))
            .await
            .unwrap();

        let report = serde_json::from_value::<TrainResult>(result)
            .unwrap()
            .into_report();
        assert_eq!(report.metrics.steps[0].grad_norm, Some(f64::INFINITY));
        assert!(matches!(
            report.ensure_converged(),
            Err(TuneError::Training(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_training_leaves_no_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = PythonRuntime::from_config(
            &RuntimeConfig {
                python_path: Some(dir.path().join("no-such-python")),
                ..RuntimeConfig::default()
            },
            dir.path().to_path_buf(),
        );
        let backend = PythonBackend::new(runtime);

        let mut record = serde_json::Map::new();
        record.insert("text".into(), json!("hello"));
        let dataset = Dataset::from_records(vec![record], "text").unwrap();
        let output_dir = dir.path().join("results");
        let training = TrainingConfig {
            output_dir: output_dir.clone(),
            ..TrainingConfig::default()
        };
        let base = ModelHandle::new("m", &QuantizationConfig::default(), DevicePlacement::Cpu);
        let mut model = TrainableModel::new(base, &AdapterConfig::default());
        let tok = tokenizer();

        let err = backend
            .run_training(
                &mut model,
                TrainingInputs {
                    tokenizer: &tok,
                    dataset: &dataset,
                    training: &training,
                    sft: &SftConfig::default(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::Training(_)));
        assert!(model.staged_weights.is_none());
        let leftovers: Vec<_> = std::fs::read_dir(&output_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
    }
}
