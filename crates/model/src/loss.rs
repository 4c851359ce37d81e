//! Masked sequence cross-entropy.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops;

/// Cross-entropy over `(batch, time)` positions, excluding targets equal to
/// the ignore marker.
///
/// The sum is normalized by the padded extent `batch * max_time`, not by the
/// count of real tokens, so the reported magnitude depends on how much
/// padding a batch carries.
#[derive(Debug, Clone)]
pub struct SequenceCrossEntropy {
    ignore_index: u32,
}

impl SequenceCrossEntropy {
    pub fn new(ignore_index: u32) -> Self {
        Self { ignore_index }
    }

    /// `logits` shaped `(batch, time, classes)`, `targets` shaped
    /// `(batch, time)` as u32 class ids. Returns a scalar tensor.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (b, l, classes) = logits.dims3()?;
        let positions = b * l;

        let logits_flat = logits.reshape((positions, classes))?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1)?;

        let targets_flat = targets.reshape((positions,))?;
        let valid_mask = targets_flat.ne(self.ignore_index)?;
        // The ignore marker lies outside the class range; substitute class 0
        // at masked positions so the gather stays in bounds.
        let safe_targets = valid_mask.where_cond(&targets_flat, &targets_flat.zeros_like()?)?;

        let nll = log_probs
            .gather(&safe_targets.unsqueeze(1)?, 1)?
            .neg()?
            .squeeze(1)?;
        let masked = (&nll * &valid_mask.to_dtype(DType::F32)?)?;

        masked.sum_all()?.affine(1.0 / positions as f64, 0.0)
    }
}
