//! Tensor/autograd capability boundary for the training step.
//!
//! The update logic talks to this trait only; the concrete backend is chosen
//! at composition time rather than by runtime string dispatch.

use candle_core::{backprop::GradStore, DType, Tensor};
use model::{Mode, RnnLm};

use crate::config::to_runtime_error;
use crate::optimizer::{AdamW, OptimizerSettings};
use crate::TrainingError;

/// Forward/backward/clip/step/zero-grad capabilities required by the
/// [`Updater`](crate::updater::Updater).
pub trait Backend {
    /// Computes the scalar loss tensor for a batch of label sequences.
    fn forward(&mut self, ys: &[Vec<u32>], mode: Mode) -> Result<Tensor, TrainingError>;

    /// Accumulates gradients for the given loss.
    fn backward(&mut self, loss: &Tensor) -> Result<(), TrainingError>;

    /// Clips the global gradient norm to `max_norm`; returns the norm seen
    /// before clipping.
    fn clip_grad_norm(&mut self, max_norm: f64) -> Result<f64, TrainingError>;

    /// Applies one optimizer update from the accumulated gradients.
    fn optimizer_step(&mut self) -> Result<(), TrainingError>;

    /// Discards any accumulated gradients.
    fn zero_grad(&mut self);
}

/// Candle-backed implementation owning the model, the optimizer and the
/// gradients of the step in flight.
pub struct CandleBackend {
    model: RnnLm,
    optimizer: AdamW,
    parameter_tensors: Vec<Tensor>,
    grads: Option<GradStore>,
}

impl CandleBackend {
    pub fn new(model: RnnLm, settings: OptimizerSettings) -> Result<Self, TrainingError> {
        let named_parameters = model.named_parameters();
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "model produced no trainable parameters",
            ));
        }
        let parameter_tensors = named_parameters
            .iter()
            .map(|(_, var)| var.as_tensor().clone())
            .collect();
        let optimizer = AdamW::new(named_parameters, settings)?;

        Ok(Self {
            model,
            optimizer,
            parameter_tensors,
            grads: None,
        })
    }

    pub fn model(&self) -> &RnnLm {
        &self.model
    }
}

impl Backend for CandleBackend {
    fn forward(&mut self, ys: &[Vec<u32>], mode: Mode) -> Result<Tensor, TrainingError> {
        self.model.training_loss(ys, mode).map_err(to_runtime_error)
    }

    fn backward(&mut self, loss: &Tensor) -> Result<(), TrainingError> {
        let grads = loss.backward().map_err(to_runtime_error)?;
        self.grads = Some(grads);
        Ok(())
    }

    fn clip_grad_norm(&mut self, max_norm: f64) -> Result<f64, TrainingError> {
        let Some(grads) = self.grads.as_mut() else {
            return Ok(0.0);
        };

        let mut sum_squares = 0.0f64;
        for tensor in &self.parameter_tensors {
            if let Some(grad) = grads.get(tensor) {
                let sq = grad
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?
                    .sqr()
                    .map_err(to_runtime_error)?
                    .sum_all()
                    .map_err(to_runtime_error)?
                    .to_vec0::<f32>()
                    .map_err(to_runtime_error)? as f64;
                sum_squares += sq;
            }
        }
        let total_norm = sum_squares.sqrt();

        if total_norm > max_norm {
            let scale = max_norm / (total_norm + 1e-6);
            for tensor in &self.parameter_tensors {
                if let Some(grad) = grads.remove(tensor) {
                    let clipped = grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                    grads.insert(tensor, clipped);
                }
            }
        }

        Ok(total_norm)
    }

    fn optimizer_step(&mut self) -> Result<(), TrainingError> {
        let Some(mut grads) = self.grads.take() else {
            return Err(TrainingError::runtime(
                "optimizer step requested without accumulated gradients",
            ));
        };
        self.optimizer.step(&mut grads)
    }

    fn zero_grad(&mut self) {
        if let Some(mut grads) = self.grads.take() {
            self.optimizer.zero_grad(&mut grads);
        }
    }
}
