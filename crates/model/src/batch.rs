//! Turns variable-length label sequences into padded tensor batches.

use candle_core::{Device, Error, Result, Tensor};

/// Padded label batch ready for recurrent processing.
///
/// Examples are reordered by descending true length; `perm[i]` is the
/// original index of the sequence now at row `i`, so callers can map decoded
/// rows back to their utterances.
#[derive(Debug)]
pub struct LabelBatch {
    /// Sentinel-prefixed inputs, shape `(batch, max_len)`, padded with `eos`.
    pub ys_in: Tensor,
    /// Sentinel-suffixed targets, shape `(batch, max_len)`, padded with the
    /// ignore marker.
    pub ys_out: Tensor,
    /// True length per row (sequence length + 1 for the sentinel).
    pub lengths: Vec<usize>,
    /// Sort permutation applied to the input order.
    pub perm: Vec<usize>,
}

/// Builds the teacher-forcing input/target pair for a set of sequences.
///
/// Rows are sorted by descending original length (stable for ties) because
/// the packed recurrent forward requires the active rows at every time step
/// to form a batch prefix.
pub fn prepare_label_batch(
    ys: &[Vec<u32>],
    sos: u32,
    eos: u32,
    ignore: u32,
    device: &Device,
) -> Result<LabelBatch> {
    if ys.is_empty() {
        return Err(Error::Msg(
            "label batch must contain at least one sequence".into(),
        ));
    }

    let mut perm: Vec<usize> = (0..ys.len()).collect();
    perm.sort_by(|&a, &b| ys[b].len().cmp(&ys[a].len()));

    let lengths: Vec<usize> = perm.iter().map(|&i| ys[i].len() + 1).collect();
    let max_len = lengths[0];

    let mut flat_in = Vec::with_capacity(ys.len() * max_len);
    let mut flat_out = Vec::with_capacity(ys.len() * max_len);
    for &i in &perm {
        let seq = &ys[i];
        flat_in.push(sos);
        flat_in.extend_from_slice(seq);
        flat_in.extend(std::iter::repeat(eos).take(max_len - seq.len() - 1));

        flat_out.extend_from_slice(seq);
        flat_out.push(eos);
        flat_out.extend(std::iter::repeat(ignore).take(max_len - seq.len() - 1));
    }

    let shape = (ys.len(), max_len);
    let ys_in = Tensor::from_vec(flat_in, shape, device)?;
    let ys_out = Tensor::from_vec(flat_out, shape, device)?;

    Ok(LabelBatch {
        ys_in,
        ys_out,
        lengths,
        perm,
    })
}
