//! # sfttune-core: Quantized LoRA Fine-Tuning Pipeline
//!
//! This crate drives supervised fine-tuning of a causal language model with a low-rank
//! adapter over 4-bit quantized base weights, then proves the saved adapter by reloading
//! it from disk and generating from it.
//!
//! ## Pipeline
//!
//! 1. **Configuration**: immutable records layered from defaults, files and environment
//! 2. **Dataset acquisition**: JSON Lines first, single JSON array as fallback
//! 3. **Model preparation**: quantized load, cache off, pad token and padding side
//! 4. **Fine-tuning**: adapter training and persistence to `final_adapter/`
//! 5. **Verification**: fresh reload, unmerged adapter, chat-template probes
//!
//! Model, adapter, training and generation work happens behind the traits in
//! [`provider`]; [`backend::PythonBackend`] implements them over the Hugging Face stack.

// Foundation
pub mod config;
pub mod error;
pub mod runtime;

// Inputs and credentials
pub mod credentials;
pub mod dataset;

// Providers
pub mod backend;
pub mod provider;

// Outputs
pub mod artifact;
pub mod metrics;

// Controller
pub mod pipeline;

// Re-exports
pub use artifact::{AdapterArtifact, RunManifest};
pub use backend::PythonBackend;
pub use config::{PipelineConfig, load_config};
pub use dataset::{AcquiredDataset, Dataset, ParseOutcome, acquire_dataset, parse_dataset};
pub use error::{Result, TuneError};
pub use pipeline::{
    FineTuneOutcome, PipelineOutcome, PreparedModel, ProbeResult, Stage, VerificationReport,
};
pub use provider::Backend;
pub use runtime::PythonRuntime;
