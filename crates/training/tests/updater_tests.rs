use candle_core::{Device, Tensor};
use model::Mode;
use training::{
    Backend, Batch, Logger, LoggingSettings, TrainingError, Updater, UpdaterSettings,
};

/// Backend double recording which capabilities the updater exercises.
struct StubBackend {
    fail_forward: bool,
    loss_value: f32,
    forward_calls: usize,
    backward_calls: usize,
    clip_calls: Vec<f64>,
    optimizer_steps: usize,
    zero_grad_calls: usize,
}

impl StubBackend {
    fn with_loss(loss_value: f32) -> Self {
        Self {
            fail_forward: false,
            loss_value,
            forward_calls: 0,
            backward_calls: 0,
            clip_calls: Vec::new(),
            optimizer_steps: 0,
            zero_grad_calls: 0,
        }
    }

    fn failing() -> Self {
        let mut stub = Self::with_loss(0.0);
        stub.fail_forward = true;
        stub
    }
}

impl Backend for StubBackend {
    fn forward(&mut self, _ys: &[Vec<u32>], _mode: Mode) -> Result<Tensor, TrainingError> {
        self.forward_calls += 1;
        if self.fail_forward {
            return Err(TrainingError::runtime("device out of memory"));
        }
        Tensor::full(self.loss_value, (), &Device::Cpu)
            .map_err(|err| TrainingError::runtime(err.to_string()))
    }

    fn backward(&mut self, _loss: &Tensor) -> Result<(), TrainingError> {
        self.backward_calls += 1;
        Ok(())
    }

    fn clip_grad_norm(&mut self, max_norm: f64) -> Result<f64, TrainingError> {
        self.clip_calls.push(max_norm);
        Ok(1.0)
    }

    fn optimizer_step(&mut self) -> Result<(), TrainingError> {
        self.optimizer_steps += 1;
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.zero_grad_calls += 1;
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

fn batch() -> Batch {
    Batch {
        ys: vec![vec![1, 2, 3], vec![4]],
        utt_ids: vec!["spk-0001-0002".into(), "spk-0003-0004".into()],
    }
}

#[test]
fn train_step_runs_the_full_cycle() {
    let mut backend = StubBackend::with_loss(2.5);
    let mut updater = Updater::new(UpdaterSettings::default());
    let mut logger = quiet_logger();

    let loss = updater.step(&mut backend, &batch(), Mode::Train, &mut logger);

    assert!((loss - 2.5).abs() < 1e-6);
    assert_eq!(backend.forward_calls, 1);
    assert_eq!(backend.backward_calls, 1);
    assert_eq!(backend.clip_calls, vec![5.0]);
    assert_eq!(backend.optimizer_steps, 1);
    assert_eq!(backend.zero_grad_calls, 1);
}

#[test]
fn failed_step_yields_zero_loss_and_clears_gradients() {
    let mut backend = StubBackend::failing();
    let mut updater = Updater::new(UpdaterSettings::default());
    let mut logger = quiet_logger();

    let loss = updater.step(&mut backend, &batch(), Mode::Train, &mut logger);

    assert_eq!(loss, 0.0);
    // Zero-grad runs once at the start of the step and once while
    // containing the failure; the optimizer never runs.
    assert_eq!(backend.zero_grad_calls, 2);
    assert_eq!(backend.backward_calls, 0);
    assert_eq!(backend.optimizer_steps, 0);
}

#[test]
fn skipped_batches_still_count_as_steps() {
    let mut backend = StubBackend::failing();
    let mut updater = Updater::new(UpdaterSettings::default());
    let mut logger = quiet_logger();

    updater.step(&mut backend, &batch(), Mode::Train, &mut logger);
    updater.step(&mut backend, &batch(), Mode::Train, &mut logger);

    assert_eq!(updater.steps(), 2);
}

#[test]
fn infinite_loss_is_coerced_to_zero() {
    for value in [f32::INFINITY, f32::NEG_INFINITY] {
        let mut backend = StubBackend::with_loss(value);
        let mut updater = Updater::new(UpdaterSettings::default());
        let mut logger = quiet_logger();

        let loss = updater.step(&mut backend, &batch(), Mode::Train, &mut logger);

        assert_eq!(loss, 0.0);
        // The step itself completed; only the reported value is coerced.
        assert_eq!(backend.optimizer_steps, 1);
    }
}

#[test]
fn nan_loss_is_not_coerced() {
    // Known gap kept on purpose: only ±inf is sanitized, NaN flows through.
    let mut backend = StubBackend::with_loss(f32::NAN);
    let mut updater = Updater::new(UpdaterSettings::default());
    let mut logger = quiet_logger();

    let loss = updater.step(&mut backend, &batch(), Mode::Train, &mut logger);

    assert!(loss.is_nan());
}

#[test]
fn evaluation_never_touches_parameters() {
    let mut backend = StubBackend::with_loss(1.25);
    let mut updater = Updater::new(UpdaterSettings::default());
    let mut logger = quiet_logger();

    let loss = updater.step(&mut backend, &batch(), Mode::Eval, &mut logger);

    assert!((loss - 1.25).abs() < 1e-6);
    assert_eq!(backend.zero_grad_calls, 0);
    assert_eq!(backend.backward_calls, 0);
    assert_eq!(backend.clip_calls.len(), 0);
    assert_eq!(backend.optimizer_steps, 0);
}

#[test]
fn clipping_is_skipped_when_threshold_is_zero() {
    let mut backend = StubBackend::with_loss(0.5);
    let mut updater = Updater::new(UpdaterSettings {
        clip_grad_norm: 0.0,
    });
    let mut logger = quiet_logger();

    updater.step(&mut backend, &batch(), Mode::Train, &mut logger);

    assert!(backend.clip_calls.is_empty());
    assert_eq!(backend.optimizer_steps, 1);
}
