//! Training metrics reported back from a fine-tuning run.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Result, TuneError};

/// Read a float the helper reported. JSON has no NaN or infinity, so those arrive as
/// the strings `"nan"`, `"inf"` and `"-inf"`.
pub fn reported_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.as_str() {
            "nan" => Some(f64::NAN),
            "inf" => Some(f64::INFINITY),
            "-inf" => Some(f64::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

/// Serde adapter for [`reported_f64`].
pub fn deserialize_reported_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    reported_f64(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected a number, found {value}")))
}

/// One logged training step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub step: u64,
    pub loss: f64,
    #[serde(default)]
    pub learning_rate: Option<f64>,
    #[serde(default)]
    pub grad_norm: Option<f64>,
}

/// Loss curve and summary for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub steps: Vec<StepLog>,
    pub best_step: Option<u64>,
    pub best_loss: Option<f64>,
}

impl TrainingMetrics {
    pub fn record_step(&mut self, log: StepLog) {
        let improved = match self.best_loss {
            None => log.loss.is_finite(),
            Some(best) => log.loss < best,
        };
        if improved {
            self.best_loss = Some(log.loss);
            self.best_step = Some(log.step);
        }
        self.steps.push(log);
    }

    /// Build from a trainer `log_history`: entries carrying `loss` and `step` are
    /// training logs, the rest (eval, final summary) are ignored.
    pub fn from_log_history(history: &[Value]) -> Self {
        let mut metrics = Self::default();
        for entry in history {
            let (Some(loss), Some(step)) = (
                entry.get("loss").and_then(reported_f64),
                entry.get("step").and_then(Value::as_u64),
            ) else {
                continue;
            };
            metrics.record_step(StepLog {
                step,
                loss,
                learning_rate: entry.get("learning_rate").and_then(reported_f64),
                grad_norm: entry.get("grad_norm").and_then(reported_f64),
            });
        }
        metrics
    }

    pub fn last_loss(&self) -> Option<f64> {
        self.steps.last().map(|s| s.loss)
    }
}

/// Outcome of the training procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub global_steps: u64,
    pub training_loss: f64,
    /// Per-device batch × accumulation steps as seen by the trainer.
    pub effective_batch_size: u32,
    pub runtime_secs: f64,
    #[serde(default)]
    pub metrics: TrainingMetrics,
}

impl TrainingReport {
    /// Reject runs whose loss diverged to NaN or infinity.
    pub fn ensure_converged(&self) -> Result<()> {
        if !self.training_loss.is_finite() {
            return Err(TuneError::training(format!(
                "training loss diverged to {} after {} steps",
                self.training_loss, self.global_steps
            )));
        }
        if let Some(step) = self.metrics.steps.iter().find(|s| !s.loss.is_finite()) {
            return Err(TuneError::training(format!(
                "non-finite loss logged at step {}",
                step.step
            )));
        }
        Ok(())
    }
}
