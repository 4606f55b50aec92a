//! Overfits one short token sequence and prints the loss curve.
//!
//! Hyperparameters come from `SPIRAL_LSTM_*` environment variables on top of
//! the defaults. Pass a path to also save the trained model:
//!
//! ```text
//! RUST_LOG=st_lstm=debug cargo run -p st-lstm --example overfit_sequence -- model.json
//! ```

use st_lstm::{EngineConfig, LstmEngine, Targets};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    spiral_config::tracing::ensure_tracing();

    let EngineConfig { model, training } = EngineConfig::from_env()?;
    let backend = training.cpu_backend();
    let mut engine = LstmEngine::new(backend, model, training)?;

    let vocab = model.vocab_size.min(model.output_size);
    let tokens: Vec<usize> = (1..6).map(|t| t % vocab).collect();
    let targets: Vec<usize> = tokens.iter().map(|t| (t + 1) % vocab).collect();

    for step in 0..50 {
        let loss = engine.train_step(&tokens, Targets::Indices(&targets))?;
        if step % 10 == 0 || step == 49 {
            println!("step {step:>2}  loss {loss:.4}");
        }
    }

    let stats = engine.pool_stats();
    println!(
        "pool: {} hits, {} misses, reuse {:.1}%",
        stats.hits,
        stats.misses,
        stats.reuse_rate() * 100.0
    );

    if let Some(path) = std::env::args().nth(1) {
        engine.save_model(&path)?;
        println!("saved model to {path}");
    }
    engine.teardown();
    Ok(())
}
