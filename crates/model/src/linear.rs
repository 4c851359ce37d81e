//! Affine output projection with post-projection dropout.

use candle_core::{Error, Result, Tensor, Var};
use candle_nn::ops;

use crate::config::InitDistribution;
use crate::init;
use crate::model::Mode;

/// Dense projection from recurrent outputs to class logits.
///
/// Accepts inputs of any rank whose trailing dimension matches `input_dim`
/// and replaces that dimension with `output_dim`.
#[derive(Debug)]
pub struct Linear {
    weight: Var,
    bias: Var,
    input_dim: usize,
    output_dim: usize,
    dropout: f32,
}

impl Linear {
    pub fn new(
        input_dim: usize,
        output_dim: usize,
        dropout: f32,
        distribution: InitDistribution,
        scale: f64,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let weight = init::sample_weight(distribution, scale, output_dim, input_dim, device)?;
        let bias = Tensor::zeros(output_dim, candle_core::DType::F32, device)?;
        Ok(Self {
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
            input_dim,
            output_dim,
            dropout,
        })
    }

    pub fn forward(&self, xs: &Tensor, mode: Mode) -> Result<Tensor> {
        let dims = xs.dims();
        let last = *dims.last().ok_or_else(|| {
            Error::Msg("projection input must have at least one dimension".into())
        })?;
        if last != self.input_dim {
            return Err(Error::Msg(format!(
                "projection expected trailing dim {} but received {}",
                self.input_dim, last
            )));
        }

        let rows: usize = dims[..dims.len() - 1].iter().product();
        let flat = xs.reshape((rows, self.input_dim))?;
        let weight_t = self.weight.as_tensor().t()?;
        let projected = flat.matmul(&weight_t)?.broadcast_add(self.bias.as_tensor())?;

        let mut output_dims = dims[..dims.len() - 1].to_vec();
        output_dims.push(self.output_dim);
        let projected = projected.reshape(output_dims)?;

        if mode.is_train() && self.dropout > 0.0 {
            ops::dropout(&projected, self.dropout)
        } else {
            Ok(projected)
        }
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{}.weight", scope), self.weight.clone()),
            (format!("{}.bias", scope), self.bias.clone()),
        ]
    }
}
