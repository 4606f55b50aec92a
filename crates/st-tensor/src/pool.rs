// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Shape-keyed reuse cache over a single backend.
//!
//! [`TensorPool::rent`] hands out a [`PooledTensor`] guard. The guard derefs to
//! the backend tensor and hands it back to the idle cache when dropped, so
//! early returns through `?` never leak a rental. [`TensorPool::trim`] needs
//! `&mut self`, which the borrow checker refuses while any guard is alive.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};

use crate::backend::{MathBackend, TensorHandle};
use crate::error::PureResult;
use crate::shape::Shape;

/// Snapshot of pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Rentals served from the idle cache.
    pub hits: u64,
    /// Rentals that had to allocate.
    pub misses: u64,
    /// Guards currently alive.
    pub outstanding: usize,
    /// Tensors waiting in the idle cache.
    pub idle_tensors: usize,
    /// Bytes held by idle and rented tensors together.
    pub bytes_resident: usize,
}

impl PoolStats {
    /// `hits / (hits + misses)`, or `0.0` before the first rental.
    pub fn reuse_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct PoolState<T> {
    idle: BTreeMap<Shape, Vec<T>>,
    hits: u64,
    misses: u64,
    outstanding: usize,
    idle_tensors: usize,
    idle_bytes: usize,
    rented_bytes: usize,
}

impl<T> Default for PoolState<T> {
    fn default() -> Self {
        Self {
            idle: BTreeMap::new(),
            hits: 0,
            misses: 0,
            outstanding: 0,
            idle_tensors: 0,
            idle_bytes: 0,
            rented_bytes: 0,
        }
    }
}

impl<T: TensorHandle> PoolState<T> {
    fn take_idle(&mut self, shape: &Shape) -> Option<T> {
        let bucket = self.idle.get_mut(shape)?;
        let tensor = bucket.pop()?;
        if bucket.is_empty() {
            self.idle.remove(shape);
        }
        self.idle_tensors -= 1;
        self.idle_bytes -= tensor.byte_len();
        Some(tensor)
    }

    fn put_idle(&mut self, tensor: T) {
        self.idle_tensors += 1;
        self.idle_bytes += tensor.byte_len();
        self.idle.entry(tensor.shape().clone()).or_default().push(tensor);
    }

    fn end_rental(&mut self, bytes: usize) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.rented_bytes = self.rented_bytes.saturating_sub(bytes);
    }
}

/// Cache of idle tensors bucketed by exact shape.
///
/// Single-threaded: the interior state is a [`RefCell`], so a pool is `!Sync`.
pub struct TensorPool<B: MathBackend> {
    backend: B,
    state: RefCell<PoolState<B::Tensor>>,
}

impl<B: MathBackend> fmt::Debug for TensorPool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorPool")
            .field("backend", &self.backend.name())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<B: MathBackend> TensorPool<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: RefCell::new(PoolState::default()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Rents a tensor of exactly `shape`. Contents of a reused tensor are
    /// whatever its previous holder left behind.
    pub fn rent(&self, shape: &Shape) -> PureResult<PooledTensor<'_, B>> {
        let reused = self.state.borrow_mut().take_idle(shape);
        let tensor = match reused {
            Some(tensor) => {
                self.state.borrow_mut().hits += 1;
                tensor
            }
            None => {
                let tensor = self.backend.zeros(shape)?;
                self.state.borrow_mut().misses += 1;
                tensor
            }
        };
        let bytes = tensor.byte_len();
        {
            let mut state = self.state.borrow_mut();
            state.outstanding += 1;
            state.rented_bytes += bytes;
        }
        Ok(PooledTensor {
            pool: self,
            bytes,
            tensor: ManuallyDrop::new(tensor),
        })
    }

    /// Like [`rent`](Self::rent) but the tensor is zero-filled.
    pub fn rent_zeroed(&self, shape: &Shape) -> PureResult<PooledTensor<'_, B>> {
        let mut rental = self.rent(shape)?;
        self.backend.fill(&mut rental, 0.0)?;
        Ok(rental)
    }

    /// Places `tensor` in the idle cache under its shape.
    ///
    /// Takes ownership, so a tensor can be returned at most once and cannot be
    /// touched afterwards. Tensors not obtained from this pool are accepted as
    /// long as they came from the same backend.
    pub fn recycle(&self, tensor: B::Tensor) {
        self.state.borrow_mut().put_idle(tensor);
    }

    /// Releases every idle tensor and returns how many were released.
    ///
    /// A failing release is logged and skipped; the remaining entries are
    /// still released.
    pub fn trim(&mut self) -> usize {
        let state = self.state.get_mut();
        let idle = std::mem::take(&mut state.idle);
        state.idle_tensors = 0;
        state.idle_bytes = 0;
        let mut released = 0;
        for (shape, bucket) in idle {
            for tensor in bucket {
                match self.backend.release(tensor) {
                    Ok(()) => released += 1,
                    Err(err) => {
                        tracing::warn!(%shape, error = %err, "pool trim could not release tensor")
                    }
                }
            }
        }
        tracing::debug!(released, backend = self.backend.name(), "tensor pool trimmed");
        released
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.borrow();
        PoolStats {
            hits: state.hits,
            misses: state.misses,
            outstanding: state.outstanding,
            idle_tensors: state.idle_tensors,
            bytes_resident: state.idle_bytes + state.rented_bytes,
        }
    }

    fn give_back(&self, tensor: B::Tensor, bytes: usize) {
        let mut state = self.state.borrow_mut();
        state.end_rental(bytes);
        state.put_idle(tensor);
    }

    fn forget_rental(&self, bytes: usize) {
        self.state.borrow_mut().end_rental(bytes);
    }
}

impl<B: MathBackend> Drop for TensorPool<B> {
    fn drop(&mut self) {
        if self.state.get_mut().idle_tensors > 0 {
            self.trim();
        }
    }
}

/// A rented tensor. Returns itself to the pool when dropped.
pub struct PooledTensor<'p, B: MathBackend> {
    pool: &'p TensorPool<B>,
    bytes: usize,
    tensor: ManuallyDrop<B::Tensor>,
}

impl<'p, B: MathBackend> PooledTensor<'p, B> {
    /// Takes the tensor out of the pool's accounting. The caller now owns it
    /// and must release it or hand it to [`TensorPool::recycle`].
    pub fn detach(self) -> B::Tensor {
        let mut this = ManuallyDrop::new(self);
        this.pool.forget_rental(this.bytes);
        // SAFETY: `this` is never dropped, so the tensor is taken exactly once.
        unsafe { ManuallyDrop::take(&mut this.tensor) }
    }
}

impl<B: MathBackend> Deref for PooledTensor<'_, B> {
    type Target = B::Tensor;

    fn deref(&self) -> &B::Tensor {
        &self.tensor
    }
}

impl<B: MathBackend> DerefMut for PooledTensor<'_, B> {
    fn deref_mut(&mut self) -> &mut B::Tensor {
        &mut self.tensor
    }
}

impl<B: MathBackend> fmt::Debug for PooledTensor<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledTensor").field(&*self.tensor).finish()
    }
}

impl<B: MathBackend> Drop for PooledTensor<'_, B> {
    fn drop(&mut self) {
        // SAFETY: drop runs once and the field is not used afterwards.
        let tensor = unsafe { ManuallyDrop::take(&mut self.tensor) };
        self.pool.give_back(tensor, self.bytes);
    }
}
