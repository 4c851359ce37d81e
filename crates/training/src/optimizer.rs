//! AdamW over the model's named parameters.

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::Deserialize;

use crate::config::to_runtime_error;
use crate::TrainingError;

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerSettings {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default)]
    pub weight_decay: f64,
    /// Parameters whose name contains one of these patterns are excluded
    /// from weight decay.
    #[serde(default = "default_weight_decay_exclude")]
    pub weight_decay_exclude: Vec<String>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_epsilon(),
            weight_decay: 0.0,
            weight_decay_exclude: default_weight_decay_exclude(),
        }
    }
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_epsilon() -> f64 {
    1e-8
}

fn default_weight_decay_exclude() -> Vec<String> {
    vec!["bias".to_string()]
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

/// Bias-corrected AdamW. Gradients arrive in a [`GradStore`] keyed by the
/// parameter tensors; parameters are updated in place.
#[derive(Debug)]
pub struct AdamW {
    settings: OptimizerSettings,
    params: Vec<ParameterSlot>,
    step: usize,
}

impl AdamW {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        settings: OptimizerSettings,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        if settings.learning_rate <= 0.0 {
            return Err(TrainingError::initialization(
                "optimizer learning_rate must be greater than 0",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let apply_weight_decay = !settings
                .weight_decay_exclude
                .iter()
                .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()));

            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            settings,
            params,
            step: 0,
        })
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        self.step += 1;
        let cfg = self.settings.clone();
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = 1.0 / bias_correction1.max(EPS);
        let scale_v = 1.0 / bias_correction2.max(EPS);

        for slot in &mut self.params {
            let grad = match grads.remove(slot.param.as_tensor()) {
                Some(grad) => grad.to_dtype(DType::F32).map_err(to_runtime_error)?,
                None => continue,
            };

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                .add(&grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            let grad_sq = grad.sqr().map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                .add(
                    &grad_sq
                        .affine(1.0 - cfg.beta2, 0.0)
                        .map_err(to_runtime_error)?,
                )
                .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = slot.param.as_tensor().clone();
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to update parameter '{}': {}",
                    slot.name, err
                ))
            })?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    /// Drops any gradients held for this optimizer's parameters.
    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }
}
