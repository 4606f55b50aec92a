// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

// crates/st-tensor/src/lib.rs
//! Tensor math behind a swappable backend.
//!
//! The crate exposes three layers that the sequence trainer builds on:
//!
//! * [`Shape`] and [`TensorError`], shared by every backend.
//! * [`MathBackend`], the in-place operation contract, with the
//!   [`CpuBackend`] reference implementation and (behind the `wgpu` feature)
//!   a compute-shader device implementation.
//! * [`TensorPool`], a shape-keyed cache that hands out scoped rentals.

pub mod backend;
pub mod error;
pub mod observability;
pub mod pool;
pub mod shape;

pub use backend::cpu_dense::{CpuBackend, CpuTensor};
#[cfg(feature = "wgpu")]
pub use backend::wgpu_dense::{WgpuBackend, WgpuTensor};
pub use backend::{MathBackend, TensorHandle};
pub use error::{PureResult, TensorError};
pub use pool::{PoolStats, PooledTensor, TensorPool};
pub use shape::Shape;
