mod support;

use st_lstm::{EngineError, EnginePhase, LstmEngine, ParamName, Targets};
use st_tensor::{Shape, TensorHandle};
use support::{cpu_engine, tiny_config, training, FlakyBackend};

#[test]
fn recycled_predictions_are_reused_without_new_allocations() {
    let mut engine = cpu_engine(tiny_config(), 3);
    let tokens = [1, 2, 3];

    let first = engine.forward(&tokens, None).unwrap();
    assert_eq!(first.predictions.shape(), &Shape::matrix(3, 5));
    engine.recycle(first.predictions);
    let after_first = engine.pool_stats();
    assert_eq!(after_first.outstanding, 0);

    let second = engine.forward(&tokens, None).unwrap();
    engine.recycle(second.predictions);
    let after_second = engine.pool_stats();
    assert_eq!(after_second.misses, after_first.misses);
    assert!(after_second.hits > after_first.hits);
    assert!(after_second.reuse_rate() > after_first.reuse_rate());
}

#[test]
fn intermediates_return_to_the_pool_on_error() {
    let mut engine = cpu_engine(tiny_config(), 3);
    let err = engine.forward(&[1, 2, 99], None).unwrap_err();
    assert!(matches!(
        err,
        EngineError::TokenOutOfRange { step: 2, token: 99, vocab: 7 }
    ));

    let err = engine
        .compute_gradients(&[1, 2], Targets::Indices(&[0, 9]))
        .unwrap_err();
    assert!(matches!(err, EngineError::TargetOutOfRange { step: 1, target: 9, .. }));
    assert_eq!(engine.pool_stats().outstanding, 0);
    assert_eq!(engine.phase(), EnginePhase::Idle);
}

#[test]
fn phases_follow_the_training_call() {
    let mut engine = cpu_engine(tiny_config(), 5);
    assert_eq!(engine.phase(), EnginePhase::Idle);
    let (_, grads) = engine
        .compute_gradients(&[1, 2], Targets::Indices(&[2, 3]))
        .unwrap();
    assert_eq!(engine.phase(), EnginePhase::Idle);
    engine.apply_gradients(grads, 0.1).unwrap();
    assert_eq!(engine.phase(), EnginePhase::Idle);
}

#[test]
fn disposing_gradients_without_applying_leaves_the_engine_idle() {
    let mut engine = cpu_engine(tiny_config(), 5);
    let before = engine.weight_to_host(ParamName::WeightOut).unwrap();
    let (_, grads) = engine
        .compute_gradients(&[3, 1], Targets::Indices(&[0, 4]))
        .unwrap();
    assert_eq!(grads.dispose(engine.backend()), ParamName::ALL.len());
    assert_eq!(engine.phase(), EnginePhase::Idle);
    assert_eq!(engine.weight_to_host(ParamName::WeightOut).unwrap(), before);
}

#[test]
fn teardown_is_idempotent() {
    let mut engine = cpu_engine(tiny_config(), 1);
    engine.train_step(&[1, 2, 3], Targets::Indices(&[2, 3, 4])).unwrap();
    engine.teardown();
    assert!(!engine.is_live());
    assert_eq!(engine.pool_stats().idle_tensors, 0);
    engine.teardown();
    assert!(!engine.is_live());

    assert!(matches!(engine.forward(&[1], None), Err(EngineError::TornDown)));
    assert!(matches!(
        engine.weight_to_host(ParamName::Embedding),
        Err(EngineError::MissingWeight(ParamName::Embedding))
    ));
}

#[test]
fn teardown_survives_failing_releases() {
    let hidden = tiny_config().hidden_size;
    let backend = FlakyBackend::failing_on(Some(Shape::row(hidden)));
    let mut engine = LstmEngine::new(backend.clone(), tiny_config(), training(2)).unwrap();
    engine.train_step(&[1, 2], Targets::Indices(&[3, 4])).unwrap();

    let before = backend.attempts();
    engine.teardown();
    let attempts = backend.attempts() - before;
    // 15 weights and two state rows at least; biases and state rows fail.
    assert!(attempts >= 17);
    assert!(backend.failures() >= 6);
    assert!(!engine.is_live());

    let settled = backend.attempts();
    engine.teardown();
    drop(engine);
    assert_eq!(backend.attempts(), settled);
}

#[test]
fn gradient_disposal_continues_past_failures() {
    let hidden = tiny_config().hidden_size;
    let backend = FlakyBackend::failing_on(Some(Shape::matrix(hidden, hidden)));
    let mut engine = LstmEngine::new(backend.clone(), tiny_config(), training(4)).unwrap();
    let before = engine.weight_to_host(ParamName::WeightHi).unwrap();

    let (_, grads) = engine
        .compute_gradients(&[1, 2, 3], Targets::Indices(&[2, 3, 4]))
        .unwrap();
    let (attempts, failures) = (backend.attempts(), backend.failures());
    engine.apply_gradients(grads, 0.5).unwrap();

    assert_eq!(backend.attempts() - attempts, ParamName::ALL.len());
    assert_eq!(backend.failures() - failures, 4);
    assert_ne!(engine.weight_to_host(ParamName::WeightHi).unwrap(), before);
}

#[test]
fn mismatched_gradients_are_refused() {
    let mut engine = cpu_engine(tiny_config(), 6);
    let before = engine.weight_to_host(ParamName::BiasC).unwrap();
    let (_, mut grads) = engine
        .compute_gradients(&[1, 2], Targets::Indices(&[2, 3]))
        .unwrap();
    grads.remove(ParamName::BiasC);

    let err = engine.apply_gradients(grads, 1.0).unwrap_err();
    match err {
        EngineError::GradientMismatch { missing, unexpected } => {
            assert_eq!(missing, vec![ParamName::BiasC]);
            assert!(unexpected.is_empty());
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(engine.weight_to_host(ParamName::BiasC).unwrap(), before);
    assert_eq!(engine.phase(), EnginePhase::Idle);
}
