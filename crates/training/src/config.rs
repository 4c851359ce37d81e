use std::str::FromStr;
use std::{fmt, fs, path::Path};

use candle_core::Device;
use model::ModelConfig;
use serde::Deserialize;

use crate::evaluator::DecodeParams;
use crate::logging::LoggingSettings;
use crate::optimizer::OptimizerSettings;
use crate::updater::UpdaterSettings;

/// Experiment configuration loaded from a TOML or JSON file.
#[derive(Debug, Deserialize)]
pub struct ExperimentConfig {
    pub model: ModelSettings,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    #[serde(default)]
    pub updater: UpdaterSettings,
    #[serde(default)]
    pub decode: DecodeParams,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl ExperimentConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: ExperimentConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.vocab_size == 0 {
            errors.push("model.vocab_size must be greater than 0".to_string());
        }
        if self.model.embedding_dim == 0 {
            errors.push("model.embedding_dim must be greater than 0".to_string());
        }
        if self.model.num_units == 0 {
            errors.push("model.num_units must be greater than 0".to_string());
        }
        if self.model.num_layers == 0 {
            errors.push("model.num_layers must be greater than 0".to_string());
        }
        for (name, p) in [
            ("model.dropout_embedding", self.model.dropout_embedding),
            ("model.dropout_hidden", self.model.dropout_hidden),
            ("model.dropout_output", self.model.dropout_output),
        ] {
            if !(0.0..1.0).contains(&p) {
                errors.push(format!("{} must be in [0, 1)", name));
            }
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if self.updater.clip_grad_norm < 0.0 {
            errors.push("updater.clip_grad_norm must be >= 0".to_string());
        }

        if self.decode.batch_size == 0 {
            errors.push("decode.batch_size must be greater than 0".to_string());
        }
        if self.decode.max_decode_len == 0 {
            errors.push("decode.max_decode_len must be greater than 0".to_string());
        }

        if self.logging.log_every_n_steps == 0 {
            errors.push("logging.log_every_n_steps must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }
        Ok(())
    }
}

/// Model hyperparameters as they appear in configuration files; string-typed
/// fields are resolved into the model crate's enums by [`ModelSettings::resolve`].
#[derive(Debug, Deserialize)]
pub struct ModelSettings {
    pub embedding_dim: usize,
    pub rnn_type: String,
    #[serde(default)]
    pub bidirectional: bool,
    pub num_units: usize,
    pub num_layers: usize,
    #[serde(default)]
    pub dropout_embedding: f32,
    #[serde(default)]
    pub dropout_hidden: f32,
    #[serde(default)]
    pub dropout_output: f32,
    pub vocab_size: usize,
    #[serde(default = "default_init_distribution")]
    pub parameter_init_distribution: String,
    #[serde(default = "default_parameter_init")]
    pub parameter_init: f64,
    #[serde(default)]
    pub recurrent_weight_orthogonal: bool,
    #[serde(default = "default_true")]
    pub init_forget_gate_bias_with_one: bool,
    #[serde(default)]
    pub tie_weights: bool,
}

impl ModelSettings {
    /// Turns the file-level settings into a model configuration for `device`.
    /// Unknown cell types or distributions are fail-fast configuration
    /// errors.
    pub fn resolve(&self, device: Device) -> Result<ModelConfig, TrainingError> {
        let rnn_type = model::RnnType::from_str(&self.rnn_type)
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        let parameter_init_distribution =
            model::InitDistribution::from_str(&self.parameter_init_distribution)
                .map_err(|err| TrainingError::initialization(err.to_string()))?;

        Ok(ModelConfig {
            embedding_dim: self.embedding_dim,
            rnn_type,
            bidirectional: self.bidirectional,
            num_units: self.num_units,
            num_layers: self.num_layers,
            dropout_embedding: self.dropout_embedding,
            dropout_hidden: self.dropout_hidden,
            dropout_output: self.dropout_output,
            vocab_size: self.vocab_size,
            parameter_init_distribution,
            parameter_init: self.parameter_init,
            recurrent_weight_orthogonal: self.recurrent_weight_orthogonal,
            init_forget_gate_bias_with_one: self.init_forget_gate_bias_with_one,
            tie_weights: self.tie_weights,
            device,
        })
    }
}

fn default_init_distribution() -> String {
    "uniform".to_string()
}

fn default_parameter_init() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o failure: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "harness initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training step failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
