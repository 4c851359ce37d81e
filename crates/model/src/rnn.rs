//! Recurrent cells and the stacked, optionally bidirectional recurrent
//! layer.
//!
//! Gate layouts follow the usual `[i, f, g, o]` (LSTM) and `[r, z, n]` (GRU)
//! packing. Variable-length batches are processed in packed form: rows are
//! sorted by descending true length, so the rows still active at time step
//! `t` are always a batch prefix and padding positions never enter the
//! recurrence. Outputs beyond a row's true length are zero.

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use candle_nn::ops;

use crate::config::{ModelConfig, RnnType};
use crate::init;
use crate::model::Mode;

/// Recurrent state carried across decode steps, one entry per
/// (layer, direction). `cell` is present only for LSTM stacks.
#[derive(Debug, Clone)]
pub struct RecurrentState {
    pub hidden: Vec<Tensor>,
    pub cell: Option<Vec<Tensor>>,
}

#[derive(Debug)]
struct RnnCell {
    kind: RnnType,
    hidden: usize,
    weight_ih: Var,
    weight_hh: Var,
    bias_ih: Var,
    bias_hh: Var,
}

impl RnnCell {
    fn new(kind: RnnType, input_dim: usize, config: &ModelConfig) -> Result<Self> {
        let hidden = config.num_units;
        let gates = kind.gate_blocks() * hidden;
        let device = &config.device;

        let (weight_ih, weight_hh) = if config.recurrent_weight_orthogonal {
            (
                init::orthogonal_weight(gates, input_dim, config.parameter_init, device)?,
                init::orthogonal_weight(gates, hidden, config.parameter_init, device)?,
            )
        } else {
            (
                init::sample_weight(
                    config.parameter_init_distribution,
                    config.parameter_init,
                    gates,
                    input_dim,
                    device,
                )?,
                init::sample_weight(
                    config.parameter_init_distribution,
                    config.parameter_init,
                    gates,
                    hidden,
                    device,
                )?,
            )
        };

        // Biases start at zero; the LSTM forget-gate block is forced to one
        // afterwards so early gradients flow through the cell state.
        let mut bias = vec![0f32; gates];
        if kind == RnnType::Lstm && config.init_forget_gate_bias_with_one {
            for value in &mut bias[hidden..2 * hidden] {
                *value = 1.0;
            }
        }
        let bias_ih = Tensor::from_vec(bias.clone(), gates, device)?;
        let bias_hh = Tensor::from_vec(bias, gates, device)?;

        Ok(Self {
            kind,
            hidden,
            weight_ih: Var::from_tensor(&weight_ih)?,
            weight_hh: Var::from_tensor(&weight_hh)?,
            bias_ih: Var::from_tensor(&bias_ih)?,
            bias_hh: Var::from_tensor(&bias_hh)?,
        })
    }

    /// Advances the cell one step for a `(rows, input)` slice.
    fn step(&self, x: &Tensor, h: &Tensor, c: Option<&Tensor>) -> Result<(Tensor, Option<Tensor>)> {
        let gx = x
            .matmul(&self.weight_ih.as_tensor().t()?)?
            .broadcast_add(self.bias_ih.as_tensor())?;
        let gh = h
            .matmul(&self.weight_hh.as_tensor().t()?)?
            .broadcast_add(self.bias_hh.as_tensor())?;
        let n = self.hidden;

        match self.kind {
            RnnType::Lstm => {
                let gates = (&gx + &gh)?;
                let i = ops::sigmoid(&gates.narrow(1, 0, n)?)?;
                let f = ops::sigmoid(&gates.narrow(1, n, n)?)?;
                let g = gates.narrow(1, 2 * n, n)?.tanh()?;
                let o = ops::sigmoid(&gates.narrow(1, 3 * n, n)?)?;
                let c_prev =
                    c.ok_or_else(|| Error::Msg("lstm step requires a cell state".into()))?;
                let c_new = ((&f * c_prev)? + (&i * &g)?)?;
                let h_new = (&o * &c_new.tanh()?)?;
                Ok((h_new, Some(c_new)))
            }
            RnnType::Gru => {
                let r = ops::sigmoid(&(gx.narrow(1, 0, n)? + gh.narrow(1, 0, n)?)?)?;
                let z = ops::sigmoid(&(gx.narrow(1, n, n)? + gh.narrow(1, n, n)?)?)?;
                let candidate =
                    (gx.narrow(1, 2 * n, n)? + (&r * &gh.narrow(1, 2 * n, n)?)?)?.tanh()?;
                let retain = z.affine(-1.0, 1.0)?;
                let h_new = ((&retain * &candidate)? + (&z * h)?)?;
                Ok((h_new, None))
            }
            RnnType::Tanh => {
                let h_new = (&gx + &gh)?.tanh()?;
                Ok((h_new, None))
            }
        }
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{}.weight_ih", scope), self.weight_ih.clone()),
            (format!("{}.weight_hh", scope), self.weight_hh.clone()),
            (format!("{}.bias_ih", scope), self.bias_ih.clone()),
            (format!("{}.bias_hh", scope), self.bias_hh.clone()),
        ]
    }
}

#[derive(Debug)]
struct RnnLayer {
    fwd: RnnCell,
    bwd: Option<RnnCell>,
}

/// Stack of recurrent layers with inter-layer dropout.
#[derive(Debug)]
pub struct RnnStack {
    layers: Vec<RnnLayer>,
    kind: RnnType,
    hidden: usize,
    dropout: f32,
    bidirectional: bool,
}

impl RnnStack {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let dirs = config.num_directions();
        let mut layers = Vec::with_capacity(config.num_layers);
        for li in 0..config.num_layers {
            let input_dim = if li == 0 {
                config.embedding_dim
            } else {
                config.num_units * dirs
            };
            let fwd = RnnCell::new(config.rnn_type, input_dim, config)?;
            let bwd = if config.bidirectional {
                Some(RnnCell::new(config.rnn_type, input_dim, config)?)
            } else {
                None
            };
            layers.push(RnnLayer { fwd, bwd });
        }
        Ok(Self {
            layers,
            kind: config.rnn_type,
            hidden: config.num_units,
            dropout: config.dropout_hidden,
            bidirectional: config.bidirectional,
        })
    }

    pub fn num_directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    /// Output feature width (`num_units * directions`).
    pub fn output_dim(&self) -> usize {
        self.hidden * self.num_directions()
    }

    /// Runs the whole stack over a `(batch, time, features)` input whose
    /// rows are sorted by descending true length.
    pub fn forward_packed(&self, xs: &Tensor, lengths: &[usize], mode: Mode) -> Result<Tensor> {
        let (b, _, _) = xs.dims3()?;
        if lengths.len() != b {
            return Err(Error::Msg(format!(
                "length array covers {} rows but batch has {}",
                lengths.len(),
                b
            )));
        }
        if lengths.windows(2).any(|w| w[0] < w[1]) {
            return Err(Error::Msg(
                "packed recurrent input requires descending lengths".into(),
            ));
        }

        let last = self.layers.len() - 1;
        let mut input = xs.clone();
        for (li, layer) in self.layers.iter().enumerate() {
            let fwd = self.run_forward(&layer.fwd, &input, lengths)?;
            let out = match &layer.bwd {
                Some(cell) => {
                    let bwd = self.run_backward(cell, &input, lengths)?;
                    Tensor::cat(&[&fwd, &bwd], 2)?
                }
                None => fwd,
            };
            input = if li < last && mode.is_train() && self.dropout > 0.0 {
                ops::dropout(&out, self.dropout)?
            } else {
                out
            };
        }
        Ok(input)
    }

    /// Advances the stack one step over a `(batch, features)` input,
    /// producing the last layer's output and the next state. `state` is
    /// `None` at decode start; every cell then begins from zeros.
    pub fn step(
        &self,
        x: &Tensor,
        state: Option<&RecurrentState>,
    ) -> Result<(Tensor, RecurrentState)> {
        let (b, _) = x.dims2()?;
        let device = x.device();
        let dirs = self.num_directions();
        let slots = self.layers.len() * dirs;
        if let Some(s) = state {
            if s.hidden.len() != slots {
                return Err(Error::Msg(format!(
                    "recurrent state has {} slots but stack expects {}",
                    s.hidden.len(),
                    slots
                )));
            }
        }

        let mut hidden_states = Vec::with_capacity(slots);
        let mut cell_states = match self.kind {
            RnnType::Lstm => Some(Vec::with_capacity(slots)),
            _ => None,
        };

        let mut input = x.clone();
        for (li, layer) in self.layers.iter().enumerate() {
            let mut outputs: Vec<Tensor> = Vec::with_capacity(dirs);
            let cells: Vec<&RnnCell> = match &layer.bwd {
                Some(bwd) => vec![&layer.fwd, bwd],
                None => vec![&layer.fwd],
            };
            for (di, cell) in cells.into_iter().enumerate() {
                let idx = li * dirs + di;
                let h_prev = match state {
                    Some(s) => s.hidden[idx].clone(),
                    None => Tensor::zeros((b, self.hidden), DType::F32, device)?,
                };
                let c_prev = match self.kind {
                    RnnType::Lstm => Some(match state {
                        Some(s) => s
                            .cell
                            .as_ref()
                            .ok_or_else(|| {
                                Error::Msg("lstm state is missing its cell tensors".into())
                            })?[idx]
                            .clone(),
                        None => Tensor::zeros((b, self.hidden), DType::F32, device)?,
                    }),
                    _ => None,
                };
                let (h_new, c_new) = cell.step(&input, &h_prev, c_prev.as_ref())?;
                hidden_states.push(h_new.clone());
                if let Some(cs) = &mut cell_states {
                    cs.push(c_new.ok_or_else(|| {
                        Error::Msg("lstm step must produce a cell state".into())
                    })?);
                }
                outputs.push(h_new);
            }
            input = match outputs.len() {
                1 => outputs.remove(0),
                _ => Tensor::cat(&[&outputs[0], &outputs[1]], 1)?,
            };
        }

        Ok((
            input,
            RecurrentState {
                hidden: hidden_states,
                cell: cell_states,
            },
        ))
    }

    fn run_forward(&self, cell: &RnnCell, xs: &Tensor, lengths: &[usize]) -> Result<Tensor> {
        let (b, l, _) = xs.dims3()?;
        let device = xs.device();
        let mut h = Tensor::zeros((b, self.hidden), DType::F32, device)?;
        let mut c = match self.kind {
            RnnType::Lstm => Some(Tensor::zeros((b, self.hidden), DType::F32, device)?),
            _ => None,
        };

        let mut outs: Vec<Tensor> = Vec::with_capacity(l);
        for t in 0..l {
            let active = lengths.iter().take_while(|&&len| len > t).count();
            if active == 0 {
                break;
            }
            let x_t = xs.narrow(1, t, 1)?.squeeze(1)?;
            if active < b {
                let x_act = x_t.narrow(0, 0, active)?;
                let h_act = h.narrow(0, 0, active)?;
                let c_act = match &c {
                    Some(c) => Some(c.narrow(0, 0, active)?),
                    None => None,
                };
                let (h_new, c_new) = cell.step(&x_act, &h_act, c_act.as_ref())?;
                let pad = Tensor::zeros((b - active, self.hidden), DType::F32, device)?;
                outs.push(Tensor::cat(&[&h_new, &pad], 0)?.unsqueeze(1)?);
                h = Tensor::cat(&[&h_new, &h.narrow(0, active, b - active)?], 0)?;
                if let (Some(prev), Some(c_new)) = (&c, c_new) {
                    let kept = prev.narrow(0, active, b - active)?;
                    c = Some(Tensor::cat(&[&c_new, &kept], 0)?);
                }
            } else {
                let (h_new, c_new) = cell.step(&x_t, &h, c.as_ref())?;
                outs.push(h_new.unsqueeze(1)?);
                h = h_new;
                if c.is_some() {
                    c = c_new;
                }
            }
        }
        while outs.len() < l {
            outs.push(Tensor::zeros((b, 1, self.hidden), DType::F32, device)?);
        }
        Tensor::cat(&outs, 1)
    }

    fn run_backward(&self, cell: &RnnCell, xs: &Tensor, lengths: &[usize]) -> Result<Tensor> {
        let (b, l, _) = xs.dims3()?;
        let device = xs.device();
        let mut state_h: Option<Tensor> = None;
        let mut state_c: Option<Tensor> = None;
        let mut prev_active = 0usize;

        let mut outs: Vec<Option<Tensor>> = (0..l).map(|_| None).collect();
        for t in (0..l).rev() {
            let active = lengths.iter().take_while(|&&len| len > t).count();
            if active == 0 {
                continue;
            }
            // Rows whose last token sits at `t` join here with zero state.
            let h = grow_state(state_h.take(), prev_active, active, self.hidden, device)?;
            let c = match self.kind {
                RnnType::Lstm => Some(grow_state(
                    state_c.take(),
                    prev_active,
                    active,
                    self.hidden,
                    device,
                )?),
                _ => None,
            };
            let x_t = xs.narrow(1, t, 1)?.squeeze(1)?.narrow(0, 0, active)?;
            let (h_new, c_new) = cell.step(&x_t, &h, c.as_ref())?;
            let out_t = if active < b {
                let pad = Tensor::zeros((b - active, self.hidden), DType::F32, device)?;
                Tensor::cat(&[&h_new, &pad], 0)?
            } else {
                h_new.clone()
            };
            outs[t] = Some(out_t.unsqueeze(1)?);
            state_h = Some(h_new);
            state_c = c_new;
            prev_active = active;
        }

        let mut steps = Vec::with_capacity(l);
        for out in outs {
            match out {
                Some(t) => steps.push(t),
                None => steps.push(Tensor::zeros((b, 1, self.hidden), DType::F32, device)?),
            }
        }
        Tensor::cat(&steps, 1)
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = Vec::new();
        for (li, layer) in self.layers.iter().enumerate() {
            params.extend(layer.fwd.named_parameters(&format!("{}.l{}.fwd", scope, li)));
            if let Some(bwd) = &layer.bwd {
                params.extend(bwd.named_parameters(&format!("{}.l{}.bwd", scope, li)));
            }
        }
        params
    }
}

fn grow_state(
    state: Option<Tensor>,
    prev_active: usize,
    active: usize,
    hidden: usize,
    device: &Device,
) -> Result<Tensor> {
    match state {
        Some(prev) if prev_active < active => {
            let pad = Tensor::zeros((active - prev_active, hidden), DType::F32, device)?;
            Tensor::cat(&[&prev, &pad], 0)
        }
        Some(prev) => Ok(prev),
        None => Tensor::zeros((active, hidden), DType::F32, device),
    }
}
