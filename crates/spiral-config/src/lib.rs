//! Ambient process configuration shared by the SpiralTorch LSTM crates.
//!
//! Nothing in here knows about tensors. The crate only answers three questions
//! for the rest of the workspace: how diagnostics are emitted, which seed a
//! component should start from, and how `SPIRAL_*` environment overrides are
//! parsed.

pub mod determinism;
pub mod env;
pub mod tracing;

pub use env::ConfigError;
