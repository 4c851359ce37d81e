use std::cell::Cell;

use anyhow::Result;
use training::{
    evaluate, DecodeParams, EditStats, LabelUnit, LmDecoder, Logger, LoggingSettings,
    MemoryDataset, TrainingError,
};

const EOS: u32 = 5;

/// Decoder double emitting a fixed token before the sentinel for every
/// example.
struct StubDecoder {
    token: u32,
}

impl LmDecoder for StubDecoder {
    fn eos_id(&self) -> u32 {
        EOS
    }

    fn decode(
        &self,
        start_tokens: &[u32],
        _max_decode_len: usize,
    ) -> std::result::Result<(Vec<Vec<u32>>, Vec<usize>), TrainingError> {
        let hyps: Vec<Vec<u32>> = start_tokens.iter().map(|_| vec![self.token, EOS]).collect();
        let lengths = vec![2; start_tokens.len()];
        Ok((hyps, lengths))
    }
}

fn quiet_logger() -> Logger {
    Logger::new(LoggingSettings {
        enable_stdout: false,
        tensorboard_dir: None,
        tensorboard_flush_every_n: 1,
        log_every_n_steps: 1,
    })
    .expect("logger")
}

fn fixed_stats(_r: &[String], _h: &[String], _normalize: bool) -> EditStats {
    EditStats {
        errors: 1,
        substitutions: 0,
        insertions: 0,
        deletions: 1,
    }
}

#[test]
fn transcripts_carry_the_parsed_utterance_annotation() -> Result<()> {
    let mut dataset = MemoryDataset::new(
        vec![("4k0c030a-0001-0015".to_string(), vec![0, 1])],
        vec!["the".into(), "cat".into()],
        LabelUnit::Word,
    )?;
    let model = StubDecoder { token: 0 };
    let mut f_ref = Vec::new();
    let mut f_hyp = Vec::new();
    let mut logger = quiet_logger();

    evaluate(
        &model,
        &mut dataset,
        &DecodeParams::default(),
        fixed_stats,
        &mut f_ref,
        &mut f_hyp,
        &mut logger,
    )?;

    assert_eq!(
        String::from_utf8(f_ref)?,
        "the cat (4k0c030a-0001-0015)\n"
    );
    // The trailing sentinel is excluded before mapping ids to text.
    assert_eq!(String::from_utf8(f_hyp)?, "the (4k0c030a-0001-0015)\n");
    Ok(())
}

#[test]
fn word_rates_divide_by_reference_word_count() -> Result<()> {
    let mut dataset = MemoryDataset::new(
        vec![("spk-0-1".to_string(), vec![0, 1])],
        vec!["the".into(), "cat".into()],
        LabelUnit::Word,
    )?;
    let model = StubDecoder { token: 0 };
    let mut logger = quiet_logger();

    let (word, character) = evaluate(
        &model,
        &mut dataset,
        &DecodeParams::default(),
        fixed_stats,
        &mut Vec::new(),
        &mut Vec::new(),
        &mut logger,
    )?;

    // 1 error over 2 reference words.
    assert!((word.error_rate - 0.5).abs() < 1e-12);
    assert!((word.deletion_rate - 0.5).abs() < 1e-12);
    // The character denominator is the full reference text, space included:
    // "the cat" has 7 characters.
    assert!((character.error_rate - 1.0 / 7.0).abs() < 1e-12);
    Ok(())
}

#[test]
fn word_scoring_is_skipped_for_character_label_sets() -> Result<()> {
    let mut dataset = MemoryDataset::new(
        vec![
            ("spk-0-1".to_string(), vec![0, 1]),
            ("spk-0-2".to_string(), vec![1]),
        ],
        vec!["a".into(), "b".into()],
        LabelUnit::Character,
    )?;
    let model = StubDecoder { token: 0 };
    let mut logger = quiet_logger();

    let calls = Cell::new(0usize);
    let (word, character) = evaluate(
        &model,
        &mut dataset,
        &DecodeParams::default(),
        |r, h, normalize| {
            calls.set(calls.get() + 1);
            fixed_stats(r, h, normalize)
        },
        &mut Vec::new(),
        &mut Vec::new(),
        &mut logger,
    )?;

    // One scoring call per utterance: character-level only.
    assert_eq!(calls.get(), 2);
    assert_eq!(word.error_rate, 0.0);
    assert!(character.error_rate > 0.0);
    Ok(())
}

#[test]
fn evaluation_covers_exactly_one_epoch_in_batches() -> Result<()> {
    let utterances: Vec<(String, Vec<u32>)> = (0..5)
        .map(|i| (format!("spk{}-000{}-001{}", i, i, i), vec![0, 1]))
        .collect();
    let mut dataset = MemoryDataset::new(
        utterances,
        vec!["x".into(), "y".into()],
        LabelUnit::Word,
    )?;
    let model = StubDecoder { token: 1 };
    let mut f_ref = Vec::new();
    let mut logger = quiet_logger();

    let params = DecodeParams {
        batch_size: 2,
        max_decode_len: 10,
        progressbar: false,
    };
    evaluate(
        &model,
        &mut dataset,
        &params,
        fixed_stats,
        &mut f_ref,
        &mut Vec::new(),
        &mut logger,
    )?;

    let lines = String::from_utf8(f_ref)?;
    assert_eq!(lines.lines().count(), 5);
    Ok(())
}
