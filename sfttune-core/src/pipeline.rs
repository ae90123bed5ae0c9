//! The fine-tuning pipeline controller.
//!
//! Stages run strictly in order and hand their outputs to the next stage by value:
//! dataset acquisition, model preparation, fine-tuning, an optional mirror copy, and
//! the verification pass. The training and verification model/tokenizer pairs are
//! separate loads; the only thing the two halves share is the adapter directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::artifact::{AdapterArtifact, RunManifest, atomic_write_json};
use crate::config::{MirrorConfig, ModelConfig, PipelineConfig, QuantizationConfig};
use crate::dataset::{AcquiredDataset, Dataset, acquire_dataset};
use crate::error::{Result, TuneError};
use crate::metrics::TrainingReport;
use crate::provider::{
    Backend, ChatMessage, ModelHandle, PaddingSide, TextGenerator, TokenizerHandle,
    TrainingInputs,
};

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DatasetAcquisition,
    ModelPreparation,
    FineTuning,
    Mirror,
    Verification,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DatasetAcquisition => "dataset_acquisition",
            Self::ModelPreparation => "model_preparation",
            Self::FineTuning => "fine_tuning",
            Self::Mirror => "mirror",
            Self::Verification => "verification",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base model and tokenizer ready for training.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedModel {
    pub model: ModelHandle,
    pub tokenizer: TokenizerHandle,
}

/// What fine-tuning leaves behind.
#[derive(Debug, Clone)]
pub struct FineTuneOutcome {
    pub artifact: AdapterArtifact,
    pub report: TrainingReport,
    pub manifest: RunManifest,
}

/// One verification probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub prompt: String,
    /// The prompt after chat-template rendering.
    pub rendered_prompt: String,
    pub generated_text: String,
}

/// Transcript of a verification pass. Informational only; nothing is scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub artifact: PathBuf,
    pub base_model: String,
    pub generated_at: DateTime<Utc>,
    pub probes: Vec<ProbeResult>,
}

/// Result of a full pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub dataset: AcquiredDataset,
    pub fine_tune: FineTuneOutcome,
    pub mirror: Option<AdapterArtifact>,
    pub verification: Option<VerificationReport>,
}

/// Load the quantized base model and its tokenizer, then apply the training-time
/// adjustments: cache off, tensor-parallel setting, pad token, right padding.
#[instrument(skip_all, fields(stage = %Stage::ModelPreparation, model = %model_config.model_id))]
pub async fn prepare_model<B: Backend + ?Sized>(
    backend: &B,
    model_config: &ModelConfig,
    quantization: &QuantizationConfig,
) -> Result<PreparedModel> {
    let mut model = backend
        .load_model(
            &model_config.model_id,
            quantization,
            model_config.device_placement,
        )
        .await?;
    model.disable_cache();
    model.set_pretraining_tp(model_config.pretraining_tp);

    let mut tokenizer = backend.load_tokenizer(&model_config.model_id).await?;
    if tokenizer.ensure_pad_token()? {
        info!(pad = ?tokenizer.pad_token, "Pad token defaulted to end-of-sequence token");
    }
    tokenizer.set_padding_side(PaddingSide::Right);

    info!(
        use_cache = model.use_cache,
        pretraining_tp = ?model.pretraining_tp,
        "Model prepared"
    );
    Ok(PreparedModel { model, tokenizer })
}

/// Train the adapter and persist it to `<output_dir>/final_adapter`.
///
/// Consumes the training handles; nothing trained here is reused by verification.
#[instrument(skip_all, fields(stage = %Stage::FineTuning))]
pub async fn fine_tune<B: Backend + ?Sized>(
    backend: &B,
    prepared: PreparedModel,
    dataset: &Dataset,
    config: &PipelineConfig,
) -> Result<FineTuneOutcome> {
    let started_at = Utc::now();
    let PreparedModel { model, tokenizer } = prepared;
    let base_model = model.model_id.clone();

    let mut trainable = backend.attach_adapter(model, &config.adapter).await?;
    info!(
        rank = config.adapter.rank,
        alpha = config.adapter.alpha,
        targets = config.adapter.target_modules.len(),
        effective_batch = config.training.effective_batch_size(),
        max_steps = ?config.training.max_steps,
        epochs = config.training.num_train_epochs,
        "Adapter attached, training"
    );

    let inputs = TrainingInputs {
        tokenizer: &tokenizer,
        dataset,
        training: &config.training,
        sft: &config.sft,
    };
    let report = backend.run_training(&mut trainable, inputs).await?;
    if let Err(e) = report.ensure_converged() {
        if let Err(discard) = backend.discard(&mut trainable).await {
            warn!(error = %discard, "Staged weights of the rejected run not removed");
        }
        return Err(e);
    }
    if report.effective_batch_size != config.training.effective_batch_size() {
        warn!(
            configured = config.training.effective_batch_size(),
            observed = report.effective_batch_size,
            "Trainer used a different effective batch size (multiple devices?)"
        );
    }

    let dir = config.adapter_dir();
    backend.persist(&trainable, &dir).await?;
    let artifact = AdapterArtifact::open(&dir)?;

    let manifest = RunManifest {
        run_id: Uuid::new_v4(),
        base_model,
        backend: backend.name().to_string(),
        dataset_records: dataset.len(),
        effective_batch_size: report.effective_batch_size,
        global_steps: report.global_steps,
        training_loss: report.training_loss,
        started_at,
        finished_at: Utc::now(),
        files: artifact.digests()?,
    };
    artifact.write_manifest(&manifest)?;

    info!(
        dir = %dir.display(),
        steps = report.global_steps,
        loss = report.training_loss,
        "Adapter persisted"
    );
    Ok(FineTuneOutcome {
        artifact,
        report,
        manifest,
    })
}

/// Copy the artifact to the mirror directory, if one is configured.
#[instrument(skip_all, fields(stage = %Stage::Mirror))]
pub fn mirror_artifact(
    artifact: &AdapterArtifact,
    mirror: &MirrorConfig,
) -> Result<Option<AdapterArtifact>> {
    match &mirror.dir {
        Some(dir) => artifact.mirror_to(dir).map(Some),
        None => Ok(None),
    }
}

/// Reload everything from the artifact directory and run the generation probes.
///
/// The base model is loaded fresh under the configured quantization and the adapter is
/// attached unmerged. The transcript is written to the configured report path.
#[instrument(skip_all, fields(stage = %Stage::Verification, artifact = %artifact_dir.display()))]
pub async fn verify<B: Backend + ?Sized>(
    backend: &B,
    config: &PipelineConfig,
    artifact_dir: &Path,
) -> Result<VerificationReport> {
    let artifact = AdapterArtifact::open(artifact_dir)?;
    if let Some(manifest) = artifact.read_manifest()? {
        let changed = manifest.verify_against(&artifact)?;
        if !changed.is_empty() {
            return Err(TuneError::artifact(format!(
                "adapter files changed since training: {}",
                changed.join(", ")
            )));
        }
    }

    let base = backend
        .load_model(
            &config.model.model_id,
            &config.quantization,
            config.model.device_placement,
        )
        .await?;
    let model = backend.load_adapter(base, artifact.path()).await?;

    let source = artifact.path().to_string_lossy();
    let mut tokenizer = backend.load_tokenizer(&source).await?;
    tokenizer.ensure_pad_token()?;
    if !tokenizer.has_chat_template {
        warn!("Tokenizer has no chat template; rendering may fail");
    }

    let mut generator = backend
        .text_generator(&model, &tokenizer, &config.verification.generation)
        .await?;
    let probes = run_probes(generator.as_mut(), &config.verification.prompts).await;
    let closed = generator.close().await;
    let probes = probes?;
    closed?;

    let report = VerificationReport {
        artifact: artifact.path().to_path_buf(),
        base_model: config.model.model_id.clone(),
        generated_at: Utc::now(),
        probes,
    };
    let report_path = config.verification_report_path();
    atomic_write_json(&report_path, &report)?;
    info!(
        probes = report.probes.len(),
        report = %report_path.display(),
        "Verification complete"
    );
    Ok(report)
}

async fn run_probes(
    generator: &mut dyn TextGenerator,
    prompts: &[String],
) -> Result<Vec<ProbeResult>> {
    let mut probes = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        let rendered = generator
            .render_chat(&[ChatMessage::user(prompt.as_str())])
            .await?;
        let generated = generator.generate(&rendered).await?;
        info!(prompt = %prompt, output = %generated, "Probe");
        probes.push(ProbeResult {
            prompt: prompt.clone(),
            rendered_prompt: rendered,
            generated_text: generated,
        });
    }
    Ok(probes)
}

/// Run every stage against the dataset at `dataset_path`.
///
/// The dataset is acquired and validated before any model is loaded. Verification runs
/// only when `config.verification.enabled` is set.
pub async fn run<B: Backend + ?Sized>(
    backend: &B,
    config: &PipelineConfig,
    dataset_path: &Path,
) -> Result<PipelineOutcome> {
    info!(
        backend = backend.name(),
        stage = %Stage::DatasetAcquisition,
        path = %dataset_path.display(),
        "Pipeline started"
    );
    let dataset = acquire_dataset(dataset_path, &config.sft.dataset_text_field).await?;

    let prepared = prepare_model(backend, &config.model, &config.quantization).await?;
    let fine_tune = fine_tune(backend, prepared, &dataset.dataset, config).await?;
    let mirror = mirror_artifact(&fine_tune.artifact, &config.mirror)?;

    let verification = if config.verification.enabled {
        let artifact_dir = config.verification_artifact_dir()?;
        Some(verify(backend, config, &artifact_dir).await?)
    } else {
        info!("Verification disabled");
        None
    };

    Ok(PipelineOutcome {
        dataset,
        fine_tune,
        mirror,
        verification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::ModelPreparation.to_string(), "model_preparation");
        assert_eq!(
            serde_json::to_string(&Stage::FineTuning).unwrap(),
            "\"fine_tuning\""
        );
    }

    #[test]
    fn test_mirror_skipped_without_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("adapter_config.json"), "{}").unwrap();
        let artifact = AdapterArtifact::open(dir.path()).unwrap();
        assert!(
            mirror_artifact(&artifact, &MirrorConfig::default())
                .unwrap()
                .is_none()
        );
    }
}
