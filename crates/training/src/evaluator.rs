//! End-to-end evaluation: decode a dataset, score hypotheses, aggregate
//! corpus-level error rates and emit reference/hypothesis transcripts.

use std::io::Write;

use indicatif::ProgressBar;
use model::RnnLm;
use serde::Deserialize;

use crate::config::to_runtime_error;
use crate::data::{Dataset, LabelUnit};
use crate::logging::Logger;
use crate::metrics::{EditStats, ErrorRateAccumulator, ErrorRateSummary};
use crate::TrainingError;

#[derive(Debug, Clone, Deserialize)]
pub struct DecodeParams {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_decode_len")]
    pub max_decode_len: usize,
    #[serde(default)]
    pub progressbar: bool,
}

impl Default for DecodeParams {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_decode_len: default_max_decode_len(),
            progressbar: false,
        }
    }
}

fn default_batch_size() -> usize {
    1
}

fn default_max_decode_len() -> usize {
    100
}

/// Decode-side surface of the language model, kept narrow so the driver can
/// be exercised against stand-ins.
pub trait LmDecoder {
    fn eos_id(&self) -> u32;

    /// Greedy batched decode; returns hypotheses (sentinel included when
    /// emitted) and their lengths.
    fn decode(
        &self,
        start_tokens: &[u32],
        max_decode_len: usize,
    ) -> Result<(Vec<Vec<u32>>, Vec<usize>), TrainingError>;
}

impl LmDecoder for RnnLm {
    fn eos_id(&self) -> u32 {
        RnnLm::eos_id(self)
    }

    fn decode(
        &self,
        start_tokens: &[u32],
        max_decode_len: usize,
    ) -> Result<(Vec<Vec<u32>>, Vec<usize>), TrainingError> {
        RnnLm::decode(self, start_tokens, max_decode_len).map_err(to_runtime_error)
    }
}

/// Decodes every utterance of `dataset` once, writes one reference and one
/// hypothesis transcript line per utterance to the given streams, and
/// returns `(word, character)` error-rate summaries.
///
/// Word-level statistics are accumulated only for word-based label sets;
/// character-level statistics always are. `compute_edit_stats` is the
/// external scoring collaborator.
pub fn evaluate<S>(
    model: &dyn LmDecoder,
    dataset: &mut dyn Dataset,
    params: &DecodeParams,
    compute_edit_stats: S,
    f_ref: &mut dyn Write,
    f_hyp: &mut dyn Write,
    logger: &mut Logger,
) -> Result<(ErrorRateSummary, ErrorRateSummary), TrainingError>
where
    S: Fn(&[String], &[String], bool) -> EditStats,
{
    dataset.reset();

    let eos = model.eos_id();
    let word_based = dataset.label_unit() == LabelUnit::Word;
    let mut word_acc = ErrorRateAccumulator::default();
    let mut char_acc = ErrorRateAccumulator::default();
    let progress = params
        .progressbar
        .then(|| ProgressBar::new(dataset.num_utterances() as u64));

    loop {
        let (batch, is_new_epoch) = dataset.next_batch(params.batch_size)?;
        let start_tokens = vec![eos; batch.ys.len()];
        let (mut hyps, _) = model.decode(&start_tokens, params.max_decode_len)?;

        for (b, hyp) in hyps.iter_mut().enumerate() {
            if hyp.last() == Some(&eos) {
                hyp.pop();
            }
            let ref_text = dataset.idx2text(&batch.ys[b]);
            let hyp_text = dataset.idx2text(hyp);

            let (speaker, seg_start, seg_end) = parse_utt_id(&batch.utt_ids[b]);
            writeln!(f_ref, "{} ({}-{}-{})", ref_text, speaker, seg_start, seg_end)?;
            writeln!(f_hyp, "{} ({}-{}-{})", hyp_text, speaker, seg_start, seg_end)?;
            logger.info(&format!("utt-id: {}", batch.utt_ids[b]));
            logger.info(&format!("Ref: {}", ref_text));
            logger.info(&format!("Hyp: {}", hyp_text));

            if word_based {
                let ref_words: Vec<String> =
                    ref_text.split_whitespace().map(str::to_string).collect();
                let hyp_words: Vec<String> =
                    hyp_text.split_whitespace().map(str::to_string).collect();
                let stats = compute_edit_stats(&ref_words, &hyp_words, false);
                word_acc.update(&stats, ref_words.len());
            }

            let ref_chars: Vec<String> = ref_text
                .replace(' ', "")
                .chars()
                .map(String::from)
                .collect();
            let hyp_chars: Vec<String> = hyp_text
                .replace(' ', "")
                .chars()
                .map(String::from)
                .collect();
            let stats = compute_edit_stats(&ref_chars, &hyp_chars, false);
            // The character denominator counts the full reference text,
            // spaces included, even though scoring runs space-stripped.
            char_acc.update(&stats, ref_text.chars().count());

            if let Some(pb) = &progress {
                pb.inc(1);
            }
        }

        if is_new_epoch {
            break;
        }
    }

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    dataset.reset();

    let word = word_acc.finalize();
    let character = char_acc.finalize();
    logger.log_evaluation(&word, &character);
    logger.flush();

    Ok((word, character))
}

/// Splits a dash-delimited utterance id into `(speaker, start, end)`: the
/// trailing two fields are the segment bounds, the rest names the speaker.
/// Ids with fewer than three fields keep the whole id as the speaker.
fn parse_utt_id(utt_id: &str) -> (String, String, String) {
    let normalized = utt_id.replace('-', "_");
    let parts: Vec<&str> = normalized.split('_').collect();
    if parts.len() < 3 {
        return (normalized.clone(), String::new(), String::new());
    }
    let speaker = parts[..parts.len() - 2].join("_");
    let start = parts[parts.len() - 2].to_string();
    let end = parts[parts.len() - 1].to_string();
    (speaker, start, end)
}
