//! Injected logging/reporting sink.
//!
//! Components never touch a process-global logger; a [`Logger`] value is
//! constructed at composition time and passed into the updater and the
//! evaluation driver. Scalars can additionally be mirrored into TensorBoard
//! event files.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use serde::Deserialize;

use crate::metrics::ErrorRateSummary;
use crate::TrainingError;

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_one")]
    pub tensorboard_flush_every_n: usize,
    #[serde(default = "default_one")]
    pub log_every_n_steps: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard_dir: None,
            tensorboard_flush_every_n: 1,
            log_every_n_steps: 1,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

pub struct Logger {
    settings: LoggingSettings,
    events: Option<EventFileWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let events = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(EventFileWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self { settings, events })
    }

    pub fn info(&mut self, message: &str) {
        if self.settings.enable_stdout {
            println!("{}", message);
        }
    }

    /// Warnings always reach stderr, regardless of the stdout gate.
    pub fn warn(&mut self, message: &str) {
        eprintln!("WARNING: {}", message);
    }

    pub fn log_training_step(&mut self, step: usize, loss: f64) {
        if self.settings.enable_stdout && step % self.settings.log_every_n_steps == 0 {
            println!("train step={} loss={:.4}", step, loss);
        }
        if let Some(writer) = self.events.as_mut() {
            let _ = writer.scalars(step as i64, &[("train/loss", loss)]);
        }
    }

    pub fn log_evaluation(&mut self, word: &ErrorRateSummary, character: &ErrorRateSummary) {
        if self.settings.enable_stdout {
            println!(
                "eval wer={:.4} (sub={:.4} ins={:.4} del={:.4}) cer={:.4} (sub={:.4} ins={:.4} del={:.4})",
                word.error_rate,
                word.substitution_rate,
                word.insertion_rate,
                word.deletion_rate,
                character.error_rate,
                character.substitution_rate,
                character.insertion_rate,
                character.deletion_rate,
            );
        }
        if let Some(writer) = self.events.as_mut() {
            let _ = writer.scalars(
                0,
                &[
                    ("eval/wer", word.error_rate),
                    ("eval/cer", character.error_rate),
                ],
            );
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.events.as_mut() {
            let _ = writer.flush();
        }
    }
}

/// Minimal TensorBoard scalar event writer (length-prefixed records with
/// masked CRC32 framing).
struct EventFileWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl EventFileWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create event directory {}: {}",
                dir.display(),
                err
            ))
        })?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let path = dir.join(format!("events.out.tfevents.{}.lm", timestamp));
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create event file {}: {}",
                path.display(),
                err
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn scalars(&mut self, step: i64, values: &[(&str, f64)]) -> Result<(), TrainingError> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|dur| dur.as_secs_f64())
            .unwrap_or(0.0);
        let event = Event {
            wall_time,
            step,
            summary: Some(Summary {
                value: values
                    .iter()
                    .map(|(tag, value)| summary::Value {
                        tag: (*tag).to_string(),
                        simple_value: Some(*value as f32),
                    })
                    .collect(),
            }),
        };

        let mut payload = BytesMut::with_capacity(64);
        event
            .encode(&mut payload)
            .map_err(|err| TrainingError::runtime(format!("failed to encode event: {}", err)))?;
        let payload = payload.freeze();

        let len_bytes = (payload.len() as u64).to_le_bytes();
        let frame = [
            &len_bytes[..],
            &masked_crc32(&len_bytes).to_le_bytes()[..],
            payload.as_ref(),
            &masked_crc32(payload.as_ref()).to_le_bytes()[..],
        ]
        .concat();
        self.writer
            .write_all(&frame)
            .map_err(|err| TrainingError::runtime(format!("failed to write event: {}", err)))?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer
            .flush()
            .map_err(|err| TrainingError::runtime(format!("failed to flush event file: {}", err)))?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for EventFileWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
