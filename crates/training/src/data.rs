//! Dataset collaborator contract and a small in-memory implementation.
//!
//! Corpus I/O, vocabulary construction and batching policy live outside this
//! crate; the harness only consumes the trait below.

use crate::TrainingError;

pub type Result<T> = std::result::Result<T, TrainingError>;

/// Granularity of the dataset's label ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelUnit {
    Word,
    Character,
}

/// One batch of label sequences with their utterance ids. Lives for a single
/// training or decode step.
#[derive(Debug, Clone)]
pub struct Batch {
    pub ys: Vec<Vec<u32>>,
    pub utt_ids: Vec<String>,
}

/// Batch source consumed by the updater and the evaluation driver.
pub trait Dataset {
    /// Rewinds the iteration cursor to the first utterance.
    fn reset(&mut self);

    /// Returns the next batch and whether it closes out the current epoch.
    fn next_batch(&mut self, batch_size: usize) -> Result<(Batch, bool)>;

    /// Maps label ids back to human-readable text.
    fn idx2text(&self, ids: &[u32]) -> String;

    fn label_unit(&self) -> LabelUnit;

    fn num_utterances(&self) -> usize;
}

/// In-memory dataset over pre-tokenized utterances, used by harness tests
/// and small experiments.
#[derive(Debug)]
pub struct MemoryDataset {
    utterances: Vec<(String, Vec<u32>)>,
    vocab: Vec<String>,
    unit: LabelUnit,
    cursor: usize,
}

impl MemoryDataset {
    pub fn new(
        utterances: Vec<(String, Vec<u32>)>,
        vocab: Vec<String>,
        unit: LabelUnit,
    ) -> Result<Self> {
        if utterances.is_empty() {
            return Err(TrainingError::initialization(
                "dataset requires at least one utterance",
            ));
        }
        for (utt_id, ys) in &utterances {
            if let Some(&id) = ys.iter().find(|&&id| id as usize >= vocab.len()) {
                return Err(TrainingError::initialization(format!(
                    "utterance {} contains label id {} outside the vocabulary of {}",
                    utt_id,
                    id,
                    vocab.len()
                )));
            }
        }
        Ok(Self {
            utterances,
            vocab,
            unit,
            cursor: 0,
        })
    }
}

impl Dataset for MemoryDataset {
    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn next_batch(&mut self, batch_size: usize) -> Result<(Batch, bool)> {
        if batch_size == 0 {
            return Err(TrainingError::runtime("batch_size must be greater than 0"));
        }
        let end = (self.cursor + batch_size).min(self.utterances.len());
        let slice = &self.utterances[self.cursor..end];
        let batch = Batch {
            ys: slice.iter().map(|(_, ys)| ys.clone()).collect(),
            utt_ids: slice.iter().map(|(id, _)| id.clone()).collect(),
        };
        let is_new_epoch = end == self.utterances.len();
        self.cursor = if is_new_epoch { 0 } else { end };
        Ok((batch, is_new_epoch))
    }

    fn idx2text(&self, ids: &[u32]) -> String {
        let tokens: Vec<&str> = ids
            .iter()
            .filter_map(|&id| self.vocab.get(id as usize).map(String::as_str))
            .collect();
        match self.unit {
            LabelUnit::Word => tokens.join(" "),
            LabelUnit::Character => tokens.concat(),
        }
    }

    fn label_unit(&self) -> LabelUnit {
        self.unit
    }

    fn num_utterances(&self) -> usize {
        self.utterances.len()
    }
}
