//! Provider traits and the handles that flow between pipeline stages.
//!
//! Providers own everything heavy: weights, quantization, adapter math, the training
//! loop and sampling. The pipeline only sees handles describing the state a provider
//! has loaded, and threads them explicitly from stage to stage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::{
    AdapterConfig, DevicePlacement, GenerationConfig, QuantizationConfig, SftConfig,
    TrainingConfig,
};
use crate::dataset::Dataset;
use crate::error::{Result, TuneError};
use crate::metrics::TrainingReport;

/// An adapter attached to a model handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedAdapter {
    pub path: PathBuf,
    /// Merged adapters are folded into the base weights and cannot be swapped out.
    pub merged: bool,
}

/// A loaded (possibly quantized) causal LM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHandle {
    /// Distinguishes independent loads of the same identifier.
    pub load_id: Uuid,
    pub model_id: String,
    pub quantization: QuantizationConfig,
    pub placement: DevicePlacement,
    pub use_cache: bool,
    pub pretraining_tp: Option<u32>,
    pub architecture: Option<String>,
    pub adapter: Option<AttachedAdapter>,
}

impl ModelHandle {
    pub fn new(
        model_id: impl Into<String>,
        quantization: &QuantizationConfig,
        placement: DevicePlacement,
    ) -> Self {
        Self {
            load_id: Uuid::new_v4(),
            model_id: model_id.into(),
            quantization: quantization.clone(),
            placement,
            use_cache: true,
            pretraining_tp: None,
            architecture: None,
            adapter: None,
        }
    }

    /// Turn off the key/value cache; it conflicts with gradient computation.
    pub fn disable_cache(&mut self) {
        self.use_cache = false;
    }

    pub fn set_pretraining_tp(&mut self, tp: Option<u32>) {
        self.pretraining_tp = tp;
    }
}

/// Which side sequences are padded on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingSide {
    Left,
    #[default]
    Right,
}

/// A loaded tokenizer's special-token state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizerHandle {
    /// Identifier or directory the tokenizer was loaded from.
    pub source: String,
    pub eos_token: Option<String>,
    pub pad_token: Option<String>,
    pub padding_side: PaddingSide,
    pub has_chat_template: bool,
}

impl TokenizerHandle {
    /// Default the pad token to the end-of-sequence token when unset.
    ///
    /// Returns `true` when the pad token was filled in.
    pub fn ensure_pad_token(&mut self) -> Result<bool> {
        if self.pad_token.is_some() {
            return Ok(false);
        }
        let eos = self.eos_token.clone().ok_or_else(|| {
            TuneError::model(format!(
                "tokenizer '{}' defines neither a pad token nor an end-of-sequence token",
                self.source
            ))
        })?;
        self.pad_token = Some(eos);
        Ok(true)
    }

    pub fn set_padding_side(&mut self, side: PaddingSide) {
        self.padding_side = side;
    }
}

/// A base model with an adapter injected for training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainableModel {
    pub base: ModelHandle,
    pub adapter: AdapterConfig,
    /// Backend-owned location of trained weights awaiting persistence, if any.
    pub staged_weights: Option<PathBuf>,
}

impl TrainableModel {
    pub fn new(base: ModelHandle, adapter: &AdapterConfig) -> Self {
        Self {
            base,
            adapter: adapter.clone(),
            staged_weights: None,
        }
    }

    /// The base model with the freshly trained, not yet persisted adapter attached.
    pub fn trained_handle(&self) -> Option<ModelHandle> {
        let path = self.staged_weights.clone()?;
        Some(ModelHandle {
            adapter: Some(AttachedAdapter {
                path,
                merged: false,
            }),
            ..self.base.clone()
        })
    }
}

/// Everything the training procedure reads besides the model.
#[derive(Debug, Clone, Copy)]
pub struct TrainingInputs<'a> {
    pub tokenizer: &'a TokenizerHandle,
    pub dataset: &'a Dataset,
    pub training: &'a TrainingConfig,
    pub sft: &'a SftConfig,
}

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Loads base models and tokenizers by identifier.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn load_model(
        &self,
        model_id: &str,
        quantization: &QuantizationConfig,
        placement: DevicePlacement,
    ) -> Result<ModelHandle>;

    /// `source` is a hub identifier or a local directory such as an adapter artifact.
    async fn load_tokenizer(&self, source: &str) -> Result<TokenizerHandle>;
}

/// Injects and loads low-rank adapters.
#[async_trait]
pub trait AdapterProvider: Send + Sync {
    /// Inject a fresh adapter; base weights stay frozen.
    async fn attach_adapter(
        &self,
        model: ModelHandle,
        adapter: &AdapterConfig,
    ) -> Result<TrainableModel>;

    /// Attach a persisted adapter without merging it into the base weights.
    async fn load_adapter(&self, model: ModelHandle, artifact: &Path) -> Result<ModelHandle>;
}

/// Runs the supervised fine-tuning loop and persists its result.
#[async_trait]
pub trait TrainingProvider: Send + Sync {
    async fn run_training(
        &self,
        model: &mut TrainableModel,
        inputs: TrainingInputs<'_>,
    ) -> Result<TrainingReport>;

    /// Move the trained adapter weights and the tokenizer files saved with them into
    /// `dir`, replacing its contents.
    async fn persist(&self, model: &TrainableModel, dir: &Path) -> Result<()>;

    /// Drop the staged weights of a run that will not be persisted.
    async fn discard(&self, model: &mut TrainableModel) -> Result<()> {
        if let Some(staged) = model.staged_weights.take()
            && staged.exists()
        {
            tokio::fs::remove_dir_all(&staged).await?;
        }
        Ok(())
    }
}

/// A text-generation capability bound to one model and tokenizer.
#[async_trait]
pub trait TextGenerator: Send {
    /// Render messages through the tokenizer's chat template, appending the
    /// generation marker. The result is text, not token ids.
    async fn render_chat(&mut self, messages: &[ChatMessage]) -> Result<String>;

    async fn generate(&mut self, prompt: &str) -> Result<String>;

    /// Release the generator's resources.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds text generators.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn text_generator(
        &self,
        model: &ModelHandle,
        tokenizer: &TokenizerHandle,
        generation: &GenerationConfig,
    ) -> Result<Box<dyn TextGenerator>>;
}

/// A provider of every capability the pipeline consumes.
pub trait Backend: ModelProvider + AdapterProvider + TrainingProvider + GenerationProvider {
    fn name(&self) -> &str;
}
