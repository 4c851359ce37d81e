use std::str::FromStr;

use candle_core::{Device, Error, Result};

/// Recurrent cell family used by every layer of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RnnType {
    Lstm,
    Gru,
    /// Plain Elman cell with a tanh nonlinearity.
    Tanh,
}

impl RnnType {
    /// Number of gate blocks packed into each weight/bias tensor.
    pub(crate) fn gate_blocks(self) -> usize {
        match self {
            RnnType::Lstm => 4,
            RnnType::Gru => 3,
            RnnType::Tanh => 1,
        }
    }
}

impl FromStr for RnnType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "lstm" => Ok(RnnType::Lstm),
            "gru" => Ok(RnnType::Gru),
            "rnn" => Ok(RnnType::Tanh),
            _ => Err(Error::Msg(format!(
                "rnn_type must be \"lstm\" or \"gru\" or \"rnn\", got \"{}\"",
                value
            ))),
        }
    }
}

/// Distribution used to sample non-bias weights at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitDistribution {
    Uniform,
    Normal,
    Orthogonal,
    Constant,
}

impl FromStr for InitDistribution {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "uniform" => Ok(InitDistribution::Uniform),
            "normal" => Ok(InitDistribution::Normal),
            "orthogonal" => Ok(InitDistribution::Orthogonal),
            "constant" => Ok(InitDistribution::Constant),
            _ => Err(Error::Msg(format!(
                "parameter_init_distribution must be \"uniform\", \"normal\", \
                 \"orthogonal\" or \"constant\", got \"{}\"",
                value
            ))),
        }
    }
}

/// Configuration for assembling the recurrent language model.
///
/// `vocab_size` is the number of real label classes; the model adds one
/// shared start/end sentinel class on top, so the effective class count is
/// `vocab_size + 1` and the sentinel id equals `vocab_size`.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub embedding_dim: usize,
    pub rnn_type: RnnType,
    pub bidirectional: bool,
    pub num_units: usize,
    pub num_layers: usize,
    pub dropout_embedding: f32,
    pub dropout_hidden: f32,
    pub dropout_output: f32,
    pub vocab_size: usize,
    pub parameter_init_distribution: InitDistribution,
    pub parameter_init: f64,
    pub recurrent_weight_orthogonal: bool,
    pub init_forget_gate_bias_with_one: bool,
    pub tie_weights: bool,
    pub device: Device,
}

impl ModelConfig {
    /// Effective class count including the shared sentinel.
    pub fn num_classes(&self) -> usize {
        self.vocab_size + 1
    }

    pub fn num_directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.embedding_dim == 0 {
            return Err(Error::Msg("embedding_dim must be greater than zero".into()));
        }
        if self.num_units == 0 {
            return Err(Error::Msg("num_units must be greater than zero".into()));
        }
        if self.num_layers == 0 {
            return Err(Error::Msg("num_layers must be greater than zero".into()));
        }
        for (name, p) in [
            ("dropout_embedding", self.dropout_embedding),
            ("dropout_hidden", self.dropout_hidden),
            ("dropout_output", self.dropout_output),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg(format!("{} must be in [0, 1)", name)));
            }
        }
        if self.parameter_init < 0.0 {
            return Err(Error::Msg("parameter_init must be non-negative".into()));
        }
        if self.tie_weights && self.num_units != self.embedding_dim {
            return Err(Error::Msg(
                "when tie_weights is set, num_units must be equal to embedding_dim".into(),
            ));
        }
        Ok(())
    }
}
