pub mod backend;
pub mod config;
pub mod data;
pub mod evaluator;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod updater;

pub use backend::{Backend, CandleBackend};
pub use config::{ExperimentConfig, ModelSettings, TrainingError};
pub use data::{Batch, Dataset, LabelUnit, MemoryDataset};
pub use evaluator::{evaluate, DecodeParams, LmDecoder};
pub use logging::{Logger, LoggingSettings};
pub use metrics::{EditStats, ErrorRateAccumulator, ErrorRateSummary};
pub use optimizer::{AdamW, OptimizerSettings};
pub use updater::{Updater, UpdaterSettings};
