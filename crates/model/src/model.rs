//! The recurrent language model: embedding, recurrent stack and output
//! projection, with teacher-forcing loss and greedy batched decoding.

use candle_core::{DType, Error, Result, Tensor, Var, D};

use crate::batch::prepare_label_batch;
use crate::config::ModelConfig;
use crate::embedding::Embedding;
use crate::linear::Linear;
use crate::loss::SequenceCrossEntropy;
use crate::rnn::{RecurrentState, RnnStack};

/// Forward-pass mode. Passed explicitly into every call so dropout and other
/// training-only behavior can never leak across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// Recurrent language model over `vocab_size + 1` classes, the extra class
/// being the shared start/end sentinel (`sos == eos == vocab_size`).
#[derive(Debug)]
pub struct RnnLm {
    config: ModelConfig,
    embed: Embedding,
    rnn: RnnStack,
    output: Linear,
    loss: SequenceCrossEntropy,
}

impl RnnLm {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        if config.tie_weights {
            return Err(Error::Msg(
                "tying the output projection to the embedding is not implemented".into(),
            ));
        }

        let num_classes = config.num_classes();
        let embed = Embedding::new(
            num_classes,
            config.embedding_dim,
            config.dropout_embedding,
            config.parameter_init_distribution,
            config.parameter_init,
            &config.device,
        )?;
        let rnn = RnnStack::new(&config)?;
        let output = Linear::new(
            rnn.output_dim(),
            num_classes,
            config.dropout_output,
            config.parameter_init_distribution,
            config.parameter_init,
            &config.device,
        )?;
        let loss = SequenceCrossEntropy::new(num_classes as u32);

        Ok(Self {
            config,
            embed,
            rnn,
            output,
            loss,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Shared start/end sentinel id.
    pub fn eos_id(&self) -> u32 {
        self.config.vocab_size as u32
    }

    pub fn sos_id(&self) -> u32 {
        self.eos_id()
    }

    /// Target value excluded from the loss; one past the valid class range.
    fn ignore_id(&self) -> u32 {
        self.config.num_classes() as u32
    }

    /// Teacher-forcing cross-entropy over a batch of label sequences.
    /// Returns a scalar tensor.
    pub fn training_loss(&self, ys: &[Vec<u32>], mode: Mode) -> Result<Tensor> {
        let batch = prepare_label_batch(
            ys,
            self.sos_id(),
            self.eos_id(),
            self.ignore_id(),
            &self.config.device,
        )?;

        let embedded = self.embed.forward(&batch.ys_in, mode)?;
        let outputs = self.rnn.forward_packed(&embedded, &batch.lengths, mode)?;
        let logits = self.output.forward(&outputs, mode)?;
        self.loss.compute(&logits, &batch.ys_out)
    }

    /// Greedy batched decoding with per-example stopping.
    ///
    /// Every example starts RUNNING and becomes FINISHED once it emits the
    /// sentinel; the loop ends early when all examples are finished. The
    /// returned length counts generated tokens including the sentinel; an
    /// example that never emits it runs to `max_decode_len` untruncated.
    pub fn decode(
        &self,
        start_tokens: &[u32],
        max_decode_len: usize,
    ) -> Result<(Vec<Vec<u32>>, Vec<usize>)> {
        let batch_size = start_tokens.len();
        if batch_size == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let eos = self.eos_id();

        let mut tokens = Tensor::from_vec(
            start_tokens.to_vec(),
            batch_size,
            &self.config.device,
        )?;
        let mut state: Option<RecurrentState> = None;
        let mut finished = vec![false; batch_size];
        let mut lengths = vec![0usize; batch_size];
        let mut hyps: Vec<Vec<u32>> = vec![Vec::new(); batch_size];

        for _ in 0..max_decode_len {
            let embedded = self.embed.forward(&tokens, Mode::Eval)?;
            let (out, next_state) = self.rnn.step(&embedded, state.as_ref())?;
            state = Some(next_state);

            let logits = self.output.forward(&out, Mode::Eval)?;
            let next = logits
                .argmax(D::Minus1)?
                .to_dtype(DType::U32)?
                .to_vec1::<u32>()?;

            for b in 0..batch_size {
                // Recorded for every row; rows past their sentinel are
                // trimmed by `lengths` below.
                hyps[b].push(next[b]);
                if !finished[b] {
                    lengths[b] += 1;
                    if next[b] == eos {
                        finished[b] = true;
                    }
                }
            }
            if finished.iter().all(|&f| f) {
                break;
            }
            tokens = Tensor::from_vec(next, batch_size, &self.config.device)?;
        }

        for (hyp, &len) in hyps.iter_mut().zip(lengths.iter()) {
            hyp.truncate(len);
        }
        Ok((hyps, lengths))
    }

    /// All trainable parameters, named for optimizer bookkeeping.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.embed.named_parameters("embed");
        params.extend(self.rnn.named_parameters("rnn"));
        params.extend(self.output.named_parameters("output"));
        params
    }
}
