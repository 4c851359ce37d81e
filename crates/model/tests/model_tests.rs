use std::str::FromStr;

use anyhow::Result;
use candle_core::{Device, Tensor};
use model::{InitDistribution, Mode, ModelConfig, RnnLm, RnnType};

fn build_config(rnn_type: RnnType) -> ModelConfig {
    ModelConfig {
        embedding_dim: 8,
        rnn_type,
        bidirectional: false,
        num_units: 16,
        num_layers: 2,
        dropout_embedding: 0.0,
        dropout_hidden: 0.0,
        dropout_output: 0.0,
        vocab_size: 5,
        parameter_init_distribution: InitDistribution::Uniform,
        parameter_init: 0.1,
        recurrent_weight_orthogonal: false,
        init_forget_gate_bias_with_one: true,
        tie_weights: false,
        device: Device::Cpu,
    }
}

/// A model whose weights are all zero emits uniform logits, so greedy
/// decoding always picks class 0 and never reaches the sentinel.
fn zero_model(rnn_type: RnnType) -> Result<RnnLm> {
    let mut config = build_config(rnn_type);
    config.parameter_init_distribution = InitDistribution::Constant;
    config.parameter_init = 0.0;
    config.init_forget_gate_bias_with_one = false;
    Ok(RnnLm::new(config)?)
}

#[test]
fn training_loss_is_a_finite_scalar() -> Result<()> {
    for rnn_type in [RnnType::Lstm, RnnType::Gru, RnnType::Tanh] {
        let lm = RnnLm::new(build_config(rnn_type))?;
        let loss = lm.training_loss(&[vec![0, 1, 2], vec![3]], Mode::Train)?;
        assert_eq!(loss.dims(), &[] as &[usize]);
        let value = loss.to_vec0::<f32>()?;
        assert!(value.is_finite() && value > 0.0, "{:?}: {}", rnn_type, value);
    }
    Ok(())
}

#[test]
fn training_loss_accepts_empty_sequences() -> Result<()> {
    let lm = RnnLm::new(build_config(RnnType::Lstm))?;
    let loss = lm.training_loss(&[vec![]], Mode::Eval)?;
    assert!(loss.to_vec0::<f32>()?.is_finite());
    Ok(())
}

#[test]
fn training_loss_is_invariant_to_batch_order() -> Result<()> {
    let lm = RnnLm::new(build_config(RnnType::Lstm))?;
    let a = vec![0, 1, 2, 3];
    let b = vec![4, 2];
    let c = vec![1];

    let first = lm
        .training_loss(&[a.clone(), b.clone(), c.clone()], Mode::Eval)?
        .to_vec0::<f32>()?;
    let second = lm.training_loss(&[c, a, b], Mode::Eval)?.to_vec0::<f32>()?;

    assert!((first - second).abs() < 1e-5, "{} vs {}", first, second);
    Ok(())
}

#[test]
fn bidirectional_stack_trains_and_decodes() -> Result<()> {
    let mut config = build_config(RnnType::Gru);
    config.bidirectional = true;
    let lm = RnnLm::new(config)?;

    let loss = lm.training_loss(&[vec![0, 1], vec![2, 3, 4]], Mode::Train)?;
    assert!(loss.to_vec0::<f32>()?.is_finite());

    let (hyps, lengths) = lm.decode(&[lm.sos_id(), lm.sos_id()], 4)?;
    assert_eq!(hyps.len(), 2);
    assert!(lengths.iter().all(|&len| len <= 4));
    Ok(())
}

#[test]
fn orthogonal_recurrent_weights_build() -> Result<()> {
    let mut config = build_config(RnnType::Lstm);
    config.recurrent_weight_orthogonal = true;
    let lm = RnnLm::new(config)?;
    let loss = lm.training_loss(&[vec![1, 2]], Mode::Eval)?;
    assert!(loss.to_vec0::<f32>()?.is_finite());
    Ok(())
}

#[test]
fn forget_gate_bias_block_is_one() -> Result<()> {
    let lm = RnnLm::new(build_config(RnnType::Lstm))?;
    let params = lm.named_parameters();
    let (_, bias) = params
        .iter()
        .find(|(name, _)| name == "rnn.l0.fwd.bias_ih")
        .expect("lstm bias parameter");

    let values = bias.as_tensor().to_vec1::<f32>()?;
    let h = 16;
    assert!(values[..h].iter().all(|&v| v == 0.0));
    assert!(values[h..2 * h].iter().all(|&v| v == 1.0));
    assert!(values[2 * h..].iter().all(|&v| v == 0.0));
    Ok(())
}

#[test]
fn unknown_rnn_type_is_a_configuration_error() {
    let err = RnnType::from_str("transformer").unwrap_err();
    assert!(err.to_string().contains("rnn_type"));
}

#[test]
fn tied_weights_with_mismatched_dims_fail_validation() {
    let mut config = build_config(RnnType::Lstm);
    config.tie_weights = true;
    // embedding_dim (8) != num_units (16)
    let err = RnnLm::new(config).unwrap_err();
    assert!(err.to_string().contains("num_units"));
}

#[test]
fn tied_weights_are_rejected_as_unimplemented() {
    let mut config = build_config(RnnType::Lstm);
    config.tie_weights = true;
    config.embedding_dim = 16;
    let err = RnnLm::new(config).unwrap_err();
    assert!(err.to_string().contains("not implemented"));
}

#[test]
fn decode_runs_to_the_cap_without_a_sentinel() -> Result<()> {
    let lm = zero_model(RnnType::Gru)?;
    let (hyps, lengths) = lm.decode(&[lm.sos_id(), lm.sos_id(), lm.sos_id()], 6)?;

    assert_eq!(lengths, vec![6, 6, 6]);
    for hyp in &hyps {
        assert_eq!(hyp.len(), 6);
        assert!(hyp.iter().all(|&id| id != lm.eos_id()));
    }
    Ok(())
}

#[test]
fn decode_stops_after_the_first_sentinel() -> Result<()> {
    let lm = zero_model(RnnType::Lstm)?;
    let eos = lm.eos_id() as usize;

    // Bias the projection so the sentinel dominates every step.
    let params = lm.named_parameters();
    let (_, bias) = params
        .iter()
        .find(|(name, _)| name == "output.bias")
        .expect("output bias parameter");
    let mut forced = vec![0f32; eos + 1];
    forced[eos] = 10.0;
    bias.set(&Tensor::from_vec(forced, eos + 1, &Device::Cpu)?)?;

    let (hyps, lengths) = lm.decode(&[lm.sos_id(), lm.sos_id()], 3)?;
    assert_eq!(lengths, vec![1, 1]);
    assert_eq!(hyps, vec![vec![lm.eos_id()], vec![lm.eos_id()]]);
    Ok(())
}

#[test]
fn decode_with_an_empty_batch_returns_nothing() -> Result<()> {
    let lm = RnnLm::new(build_config(RnnType::Tanh))?;
    let (hyps, lengths) = lm.decode(&[], 5)?;
    assert!(hyps.is_empty());
    assert!(lengths.is_empty());
    Ok(())
}
