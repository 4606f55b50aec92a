// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Lightweight hooks for observing backend operations without pulling the
//! engine's logging into the hot path.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, RwLock};

use crate::shape::Shape;

/// Metadata about a completed backend operation.
#[derive(Clone, Debug)]
pub struct TensorOpEvent {
    pub backend: &'static str,
    pub op: &'static str,
    /// Shape of the destination tensor.
    pub shape: Shape,
}

/// Observer callback invoked after a backend operation completes.
pub type TensorOpObserver = Arc<dyn Fn(&TensorOpEvent) + Send + Sync + 'static>;

static TENSOR_OP_OBSERVER: OnceLock<RwLock<Option<TensorOpObserver>>> = OnceLock::new();

thread_local! {
    static IN_OBSERVER_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Install (or clear) the global tensor operation observer.
///
/// Returns the previously installed observer, if any.
pub fn set_tensor_op_observer(observer: Option<TensorOpObserver>) -> Option<TensorOpObserver> {
    let lock = TENSOR_OP_OBSERVER.get_or_init(|| RwLock::new(None));
    let mut slot = match lock.write() {
        Ok(slot) => slot,
        Err(poisoned) => poisoned.into_inner(),
    };
    std::mem::replace(&mut *slot, observer)
}

/// Emit an operation event to the currently installed observer.
///
/// No-op, and allocation free, unless an observer has been registered via
/// [`set_tensor_op_observer`]. Re-entrant emissions from inside the observer
/// are dropped and a panicking observer is contained.
pub fn emit_tensor_op(backend: &'static str, op: &'static str, shape: &Shape) {
    let Some(lock) = TENSOR_OP_OBSERVER.get() else {
        return;
    };
    let observer = match lock.read() {
        Ok(slot) => slot.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    let Some(observer) = observer else {
        return;
    };

    let already_in_callback = IN_OBSERVER_CALLBACK.with(|flag| flag.replace(true));
    if already_in_callback {
        return;
    }

    let event = TensorOpEvent {
        backend,
        op,
        shape: shape.clone(),
    };
    let _ = catch_unwind(AssertUnwindSafe(|| observer(&event)));

    IN_OBSERVER_CALLBACK.with(|flag| flag.set(false));
}
