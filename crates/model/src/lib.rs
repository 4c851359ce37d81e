pub mod batch;
pub mod config;
pub mod embedding;
pub mod init;
pub mod linear;
pub mod loss;
pub mod model;
pub mod rnn;

pub use batch::{prepare_label_batch, LabelBatch};
pub use config::{InitDistribution, ModelConfig, RnnType};
pub use model::{Mode, RnnLm};
pub use rnn::{RecurrentState, RnnStack};
