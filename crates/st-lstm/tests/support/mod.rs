#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use st_lstm::{LstmConfig, LstmEngine, TrainingConfig};
use st_tensor::{CpuBackend, CpuTensor, MathBackend, PureResult, Shape, TensorError, TensorHandle};

/// CPU backend whose `release` fails for one chosen shape.
#[derive(Clone, Debug)]
pub struct FlakyBackend {
    inner: CpuBackend,
    failing_shape: Option<Shape>,
    attempts: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}

impl FlakyBackend {
    pub fn failing_on(shape: Option<Shape>) -> Self {
        Self {
            inner: CpuBackend::new(),
            failing_shape: shape,
            attempts: Arc::default(),
            failures: Arc::default(),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl MathBackend for FlakyBackend {
    type Tensor = CpuTensor;

    fn name(&self) -> &'static str {
        "flaky"
    }

    fn is_device(&self) -> bool {
        false
    }

    fn zeros(&self, shape: &Shape) -> PureResult<CpuTensor> {
        self.inner.zeros(shape)
    }

    fn from_host(&self, data: &[f32], shape: &Shape) -> PureResult<CpuTensor> {
        self.inner.from_host(data, shape)
    }

    fn duplicate(&self, src: &CpuTensor) -> PureResult<CpuTensor> {
        self.inner.duplicate(src)
    }

    fn to_host(&self, src: &CpuTensor) -> PureResult<Vec<f32>> {
        self.inner.to_host(src)
    }

    fn release(&self, tensor: CpuTensor) -> PureResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing_shape.as_ref() == Some(tensor.shape()) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(TensorError::backend("flaky", "injected release failure"));
        }
        self.inner.release(tensor)
    }

    fn copy(&self, dst: &mut CpuTensor, src: &CpuTensor) -> PureResult<()> {
        self.inner.copy(dst, src)
    }

    fn fill(&self, dst: &mut CpuTensor, value: f32) -> PureResult<()> {
        self.inner.fill(dst, value)
    }

    fn matmul(&self, dst: &mut CpuTensor, lhs: &CpuTensor, rhs: &CpuTensor) -> PureResult<()> {
        self.inner.matmul(dst, lhs, rhs)
    }

    fn matmul_transpose_lhs(
        &self,
        dst: &mut CpuTensor,
        lhs: &CpuTensor,
        rhs: &CpuTensor,
    ) -> PureResult<()> {
        self.inner.matmul_transpose_lhs(dst, lhs, rhs)
    }

    fn matmul_transpose_rhs(
        &self,
        dst: &mut CpuTensor,
        lhs: &CpuTensor,
        rhs: &CpuTensor,
    ) -> PureResult<()> {
        self.inner.matmul_transpose_rhs(dst, lhs, rhs)
    }

    fn add(&self, dst: &mut CpuTensor, lhs: &CpuTensor, rhs: &CpuTensor) -> PureResult<()> {
        self.inner.add(dst, lhs, rhs)
    }

    fn sub(&self, dst: &mut CpuTensor, lhs: &CpuTensor, rhs: &CpuTensor) -> PureResult<()> {
        self.inner.sub(dst, lhs, rhs)
    }

    fn mul(&self, dst: &mut CpuTensor, lhs: &CpuTensor, rhs: &CpuTensor) -> PureResult<()> {
        self.inner.mul(dst, lhs, rhs)
    }

    fn add_row_broadcast(
        &self,
        dst: &mut CpuTensor,
        matrix: &CpuTensor,
        row: &CpuTensor,
    ) -> PureResult<()> {
        self.inner.add_row_broadcast(dst, matrix, row)
    }

    fn scale(&self, dst: &mut CpuTensor, src: &CpuTensor, scalar: f32) -> PureResult<()> {
        self.inner.scale(dst, src, scalar)
    }

    fn add_scaled(&self, dst: &mut CpuTensor, src: &CpuTensor, scalar: f32) -> PureResult<()> {
        self.inner.add_scaled(dst, src, scalar)
    }

    fn sub_scaled(&self, dst: &mut CpuTensor, src: &CpuTensor, scalar: f32) -> PureResult<()> {
        self.inner.sub_scaled(dst, src, scalar)
    }

    fn transpose(&self, dst: &mut CpuTensor, src: &CpuTensor) -> PureResult<()> {
        self.inner.transpose(dst, src)
    }

    fn sigmoid(&self, dst: &mut CpuTensor, src: &CpuTensor) -> PureResult<()> {
        self.inner.sigmoid(dst, src)
    }

    fn tanh(&self, dst: &mut CpuTensor, src: &CpuTensor) -> PureResult<()> {
        self.inner.tanh(dst, src)
    }

    fn sigmoid_derivative(&self, dst: &mut CpuTensor, activated: &CpuTensor) -> PureResult<()> {
        self.inner.sigmoid_derivative(dst, activated)
    }

    fn tanh_derivative(&self, dst: &mut CpuTensor, activated: &CpuTensor) -> PureResult<()> {
        self.inner.tanh_derivative(dst, activated)
    }

    fn softmax_rows(&self, dst: &mut CpuTensor, src: &CpuTensor) -> PureResult<()> {
        self.inner.softmax_rows(dst, src)
    }

    fn slice_row(&self, dst: &mut CpuTensor, batch: &CpuTensor, row: usize) -> PureResult<()> {
        self.inner.slice_row(dst, batch, row)
    }

    fn set_row(&self, batch: &mut CpuTensor, row: usize, src: &CpuTensor) -> PureResult<()> {
        self.inner.set_row(batch, row, src)
    }

    fn embedding_lookup(
        &self,
        dst: &mut CpuTensor,
        table: &CpuTensor,
        index: usize,
    ) -> PureResult<()> {
        self.inner.embedding_lookup(dst, table, index)
    }

    fn accumulate_row(
        &self,
        table: &mut CpuTensor,
        index: usize,
        src: &CpuTensor,
    ) -> PureResult<()> {
        self.inner.accumulate_row(table, index, src)
    }

    fn clip(&self, dst: &mut CpuTensor, src: &CpuTensor, min: f32, max: f32) -> PureResult<()> {
        self.inner.clip(dst, src, min, max)
    }

    fn softmax_cross_entropy_grad(
        &self,
        dst: &mut CpuTensor,
        predictions: &CpuTensor,
        targets: &[usize],
    ) -> PureResult<()> {
        self.inner.softmax_cross_entropy_grad(dst, predictions, targets)
    }
}

pub fn tiny_config() -> LstmConfig {
    LstmConfig::new(7, 3, 4, 5)
}

pub fn training(seed: u64) -> TrainingConfig {
    TrainingConfig {
        seed,
        ..TrainingConfig::default()
    }
}

pub fn cpu_engine(config: LstmConfig, seed: u64) -> LstmEngine<CpuBackend> {
    LstmEngine::new(CpuBackend::new(), config, training(seed)).expect("engine")
}
