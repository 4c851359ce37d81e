//! Label embedding table with post-lookup dropout.

use candle_core::{DType, Error, Result, Tensor, Var};
use candle_nn::ops;

use crate::config::InitDistribution;
use crate::init;
use crate::model::Mode;

/// Learnable embedding table over the effective class set (labels plus the
/// shared sentinel).
#[derive(Debug)]
pub struct Embedding {
    weight: Var,
    num_classes: usize,
    embedding_dim: usize,
    dropout: f32,
}

impl Embedding {
    pub fn new(
        num_classes: usize,
        embedding_dim: usize,
        dropout: f32,
        distribution: InitDistribution,
        scale: f64,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let weight = init::sample_weight(distribution, scale, num_classes, embedding_dim, device)?;
        Ok(Self {
            weight: Var::from_tensor(&weight)?,
            num_classes,
            embedding_dim,
            dropout,
        })
    }

    /// Looks up embeddings for `token_ids` shaped `(batch,)` or
    /// `(batch, seq)`, appending the embedding dimension to the input shape.
    pub fn forward(&self, token_ids: &Tensor, mode: Mode) -> Result<Tensor> {
        let dims = token_ids.dims();
        if dims.is_empty() || dims.len() > 2 {
            return Err(Error::Msg(format!(
                "token_ids must be shaped [batch] or [batch, seq], got {:?}",
                dims
            )));
        }

        let flat = token_ids.to_dtype(DType::I64)?.flatten_all()?;
        self.ensure_id_range(&flat)?;

        let gathered = self.weight.as_tensor().index_select(&flat, 0)?;
        let mut output_dims = dims.to_vec();
        output_dims.push(self.embedding_dim);
        let embedded = gathered.reshape(output_dims)?;

        if mode.is_train() && self.dropout > 0.0 {
            ops::dropout(&embedded, self.dropout)
        } else {
            Ok(embedded)
        }
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![(format!("{}.weight", scope), self.weight.clone())]
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        if flat_ids.elem_count() == 0 {
            return Ok(());
        }
        let max_id = flat_ids.max_all()?.to_scalar::<i64>()?;
        if max_id >= self.num_classes as i64 {
            return Err(Error::Msg(format!(
                "token id {} exceeds class count {}",
                max_id, self.num_classes
            )));
        }
        Ok(())
    }
}
