//! One optimization (or evaluation) step with failure containment.

use model::Mode;
use serde::Deserialize;

use crate::backend::Backend;
use crate::config::to_runtime_error;
use crate::data::Batch;
use crate::logging::Logger;
use crate::TrainingError;

#[derive(Debug, Clone, Deserialize)]
pub struct UpdaterSettings {
    /// Global gradient-norm clipping threshold; 0 disables clipping.
    #[serde(default = "default_clip_grad_norm")]
    pub clip_grad_norm: f64,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            clip_grad_norm: default_clip_grad_norm(),
        }
    }
}

fn default_clip_grad_norm() -> f64 {
    5.0
}

/// Drives a single forward/backward/update cycle per batch.
///
/// Runtime failures inside a step (typically memory exhaustion on oversized
/// batches) are contained: the batch is reported, partial gradients are
/// cleared, and the step yields a zero loss so training continues. A ±inf
/// loss is likewise coerced to zero with a warning. NaN is intentionally not
/// coerced; it signals a different failure class and stays visible.
pub struct Updater {
    clip_grad_norm: f64,
    steps: usize,
}

impl Updater {
    pub fn new(settings: UpdaterSettings) -> Self {
        Self {
            clip_grad_norm: settings.clip_grad_norm,
            steps: 0,
        }
    }

    /// Number of batches processed so far, skipped ones included.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Executes one step and returns the batch loss. Never propagates
    /// per-batch failures; every batch contributes a value.
    pub fn step<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        batch: &Batch,
        mode: Mode,
        logger: &mut Logger,
    ) -> f64 {
        let mut loss_val = match self.run_step(backend, batch, mode) {
            Ok(value) => value,
            Err(err) => {
                let max_label_num = batch.ys.iter().map(Vec::len).max().unwrap_or(0);
                logger.warn(&format!(
                    "skipping mini-batch (max_label_num: {}, batch: {}): {}",
                    max_label_num,
                    batch.ys.len(),
                    err
                ));
                backend.zero_grad();
                0.0
            }
        };

        if loss_val == f64::INFINITY || loss_val == f64::NEG_INFINITY {
            logger.warn("received an inf loss, setting loss value to 0");
            loss_val = 0.0;
        }

        self.steps += 1;
        if mode.is_train() {
            logger.log_training_step(self.steps, loss_val);
        }
        loss_val
    }

    fn run_step<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        batch: &Batch,
        mode: Mode,
    ) -> Result<f64, TrainingError> {
        if mode.is_train() {
            backend.zero_grad();
        }

        let loss = backend.forward(&batch.ys, mode)?;
        let loss_val = loss.to_vec0::<f32>().map_err(to_runtime_error)? as f64;

        if mode.is_train() {
            backend.backward(&loss)?;
            // Drop the loss before the update so no graph history survives
            // the step.
            drop(loss);
            if self.clip_grad_norm > 0.0 {
                backend.clip_grad_norm(self.clip_grad_norm)?;
            }
            backend.optimizer_step()?;
        }

        Ok(loss_val)
    }
}
