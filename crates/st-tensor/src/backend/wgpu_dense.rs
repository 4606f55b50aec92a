// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Compute-shader backend. Every tensor is one storage buffer; every op is a
//! single dispatch that is submitted and waited on before returning.

use std::fmt;
use std::sync::{Arc, OnceLock};

use wgpu::util::DeviceExt;
use wgpu::{BindGroupLayout, Buffer, ComputePipeline, Device, Queue};

use super::wgpu_util::{empty_buffer, read_buffer, upload_slice};
use super::{
    ensure_host_len, ensure_row_index, ensure_row_width, ensure_same, gemm_dims, MathBackend,
    TensorHandle,
};
use crate::error::{PureResult, TensorError};
use crate::observability::emit_tensor_op;
use crate::shape::Shape;

const BACKEND: &str = "wgpu";
const SHADER: &str = include_str!("../wgpu_shaders/lstm_ops.wgsl");

const ELEMENTWISE_GROUP: u32 = 256;
const MATMUL_GROUP: u32 = 16;
const SOFTMAX_GROUP: u32 = 64;
const MAX_GROUPS_PER_DIM: u32 = 65_535;

/// Mirrors the op codes in `lstm_ops.wgsl`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
enum ElementOp {
    Copy = 0,
    Fill = 1,
    Add = 2,
    Sub = 3,
    Mul = 4,
    Scale = 5,
    Axpy = 6,
    Sigmoid = 7,
    Tanh = 8,
    SigmoidDerivative = 9,
    TanhDerivative = 10,
    Clip = 11,
    AddRow = 12,
    SliceRow = 13,
    SetRow = 14,
    AccumulateRow = 15,
    Transpose = 16,
    CrossEntropyGrad = 17,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    len: u32,
    rows: u32,
    cols: u32,
    inner: u32,
    op: u32,
    flags: u32,
    row: u32,
    _pad0: u32,
    scalar_a: f32,
    scalar_b: f32,
    _pad1: f32,
    _pad2: f32,
}

impl Params {
    fn len(len: usize) -> Self {
        Self {
            len: len as u32,
            ..Self::default()
        }
    }

    fn matrix(mut self, rows: usize, cols: usize) -> Self {
        self.rows = rows as u32;
        self.cols = cols as u32;
        self
    }

    fn row(mut self, row: usize) -> Self {
        self.row = row as u32;
        self
    }

    fn scalars(mut self, a: f32, b: f32) -> Self {
        self.scalar_a = a;
        self.scalar_b = b;
        self
    }
}

/// Tensor stored in a device buffer.
pub struct WgpuTensor {
    shape: Shape,
    buffer: Buffer,
}

impl fmt::Debug for WgpuTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuTensor")
            .field("shape", &self.shape)
            .field("bytes", &self.buffer.size())
            .finish()
    }
}

impl TensorHandle for WgpuTensor {
    fn shape(&self) -> &Shape {
        &self.shape
    }
}

struct DeviceContext {
    adapter_name: String,
    device: Device,
    queue: Queue,
    bind_layout: BindGroupLayout,
    elementwise: ComputePipeline,
    matmul: ComputePipeline,
    softmax: ComputePipeline,
    /// Bound into slots an op does not read.
    dummy: Buffer,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl DeviceContext {
    fn new() -> Result<Self, String> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(async {
            instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
        })
        .ok_or_else(|| "no suitable WGPU adapter".to_string())?;
        let adapter_name = adapter.get_info().name;

        let (device, queue) = pollster::block_on(async {
            adapter
                .request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("st.tensor.wgpu.device"),
                        required_features: wgpu::Features::empty(),
                        required_limits: adapter.limits(),
                    },
                    None,
                )
                .await
        })
        .map_err(|err| err.to_string())?;

        let bind_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("st.tensor.wgpu.bind_layout"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("st.tensor.wgpu.pipeline_layout"),
            bind_group_layouts: &[&bind_layout],
            push_constant_ranges: &[],
        });
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("st.tensor.wgpu.lstm_ops"),
            source: wgpu::ShaderSource::Wgsl(SHADER.into()),
        });
        let pipeline = |entry_point: &'static str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point,
            })
        };
        let elementwise = pipeline("elementwise");
        let matmul = pipeline("matmul");
        let softmax = pipeline("softmax_rows");
        let dummy = empty_buffer(&device, "st.tensor.wgpu.dummy", 1);

        Ok(Self {
            adapter_name,
            device,
            queue,
            bind_layout,
            elementwise,
            matmul,
            softmax,
            dummy,
        })
    }
}

static SHARED: OnceLock<Arc<DeviceContext>> = OnceLock::new();

/// Device backend over `wgpu` compute pipelines.
///
/// Clones share one device, queue and set of pipelines.
#[derive(Clone)]
pub struct WgpuBackend {
    ctx: Arc<DeviceContext>,
}

impl fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("adapter", &self.ctx.adapter_name)
            .finish()
    }
}

impl WgpuBackend {
    /// Opens (or reuses) the process-wide device. Fails when no adapter is
    /// available.
    pub fn new() -> PureResult<Self> {
        if let Some(ctx) = SHARED.get() {
            return Ok(Self { ctx: ctx.clone() });
        }
        let ctx = Arc::new(
            DeviceContext::new().map_err(|message| TensorError::backend(BACKEND, message))?,
        );
        tracing::info!(adapter = %ctx.adapter_name, "wgpu backend ready");
        let ctx = SHARED.get_or_init(|| ctx).clone();
        Ok(Self { ctx })
    }

    pub fn adapter_name(&self) -> &str {
        &self.ctx.adapter_name
    }

    fn dispatch(
        &self,
        pipeline: &ComputePipeline,
        lhs: &Buffer,
        rhs: &Buffer,
        dst: &Buffer,
        params: Params,
        groups: (u32, u32),
    ) -> PureResult<()> {
        let device = &self.ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("st.tensor.wgpu.params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("st.tensor.wgpu.bind_group"),
            layout: &self.ctx.bind_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: lhs.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: rhs.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: dst.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("st.tensor.wgpu.encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("st.tensor.wgpu.pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups.0.max(1), groups.1.max(1), 1);
        }
        self.ctx.queue.submit(Some(encoder.finish()));
        device.poll(wgpu::Maintain::Wait);
        match pollster::block_on(device.pop_error_scope()) {
            Some(err) => Err(TensorError::backend(BACKEND, err.to_string())),
            None => Ok(()),
        }
    }

    /// Runs one elementwise kernel over `params.len` invocations.
    fn elementwise(
        &self,
        name: &'static str,
        op: ElementOp,
        dst: &mut WgpuTensor,
        lhs: Option<&Buffer>,
        rhs: Option<&Buffer>,
        mut params: Params,
    ) -> PureResult<()> {
        if params.len > 0 {
            params.op = op as u32;
            let total = params.len.div_ceil(ELEMENTWISE_GROUP);
            let gx = total.min(MAX_GROUPS_PER_DIM);
            let gy = total.div_ceil(gx);
            let dummy = &self.ctx.dummy;
            self.dispatch(
                &self.ctx.elementwise,
                lhs.unwrap_or(dummy),
                rhs.unwrap_or(dummy),
                &dst.buffer,
                params,
                (gx, gy),
            )?;
        }
        emit_tensor_op(BACKEND, name, &dst.shape);
        Ok(())
    }

    fn gemm(
        &self,
        name: &'static str,
        dst: &mut WgpuTensor,
        lhs: &WgpuTensor,
        rhs: &WgpuTensor,
        transpose_lhs: bool,
        transpose_rhs: bool,
    ) -> PureResult<()> {
        let dims = gemm_dims(
            name,
            &dst.shape,
            &lhs.shape,
            &rhs.shape,
            transpose_lhs,
            transpose_rhs,
        )?;
        if dims.m > 0 && dims.n > 0 {
            let mut params = Params::len(dims.m * dims.n).matrix(dims.m, dims.n);
            params.inner = dims.k as u32;
            params.flags = u32::from(transpose_lhs) | (u32::from(transpose_rhs) << 1);
            let groups = (
                (dims.n as u32).div_ceil(MATMUL_GROUP),
                (dims.m as u32).div_ceil(MATMUL_GROUP),
            );
            self.dispatch(
                &self.ctx.matmul,
                &lhs.buffer,
                &rhs.buffer,
                &dst.buffer,
                params,
                groups,
            )?;
        }
        emit_tensor_op(BACKEND, name, &dst.shape);
        Ok(())
    }

    fn unary(
        &self,
        name: &'static str,
        op: ElementOp,
        dst: &mut WgpuTensor,
        src: &WgpuTensor,
        scalars: (f32, f32),
    ) -> PureResult<()> {
        ensure_same(name, &dst.shape, &src.shape)?;
        let params = Params::len(dst.numel()).scalars(scalars.0, scalars.1);
        self.elementwise(name, op, dst, Some(&src.buffer), None, params)
    }

    fn binary(
        &self,
        name: &'static str,
        op: ElementOp,
        dst: &mut WgpuTensor,
        lhs: &WgpuTensor,
        rhs: &WgpuTensor,
    ) -> PureResult<()> {
        ensure_same(name, &lhs.shape, &rhs.shape)?;
        ensure_same(name, &dst.shape, &lhs.shape)?;
        let params = Params::len(dst.numel());
        self.elementwise(name, op, dst, Some(&lhs.buffer), Some(&rhs.buffer), params)
    }
}

impl MathBackend for WgpuBackend {
    type Tensor = WgpuTensor;

    fn name(&self) -> &'static str {
        BACKEND
    }

    fn is_device(&self) -> bool {
        true
    }

    fn zeros(&self, shape: &Shape) -> PureResult<WgpuTensor> {
        // wgpu zero-initialises new buffers.
        Ok(WgpuTensor {
            shape: shape.clone(),
            buffer: empty_buffer(&self.ctx.device, "st.tensor.wgpu.tensor", shape.numel()),
        })
    }

    fn from_host(&self, data: &[f32], shape: &Shape) -> PureResult<WgpuTensor> {
        ensure_host_len(data, shape)?;
        Ok(WgpuTensor {
            shape: shape.clone(),
            buffer: upload_slice(&self.ctx.device, "st.tensor.wgpu.tensor", data),
        })
    }

    fn duplicate(&self, src: &WgpuTensor) -> PureResult<WgpuTensor> {
        let mut out = self.zeros(&src.shape)?;
        self.copy(&mut out, src)?;
        Ok(out)
    }

    fn to_host(&self, src: &WgpuTensor) -> PureResult<Vec<f32>> {
        read_buffer(&self.ctx.device, &self.ctx.queue, &src.buffer, src.numel())
            .map_err(|message| TensorError::backend(BACKEND, message))
    }

    fn release(&self, tensor: WgpuTensor) -> PureResult<()> {
        tensor.buffer.destroy();
        Ok(())
    }

    fn copy(&self, dst: &mut WgpuTensor, src: &WgpuTensor) -> PureResult<()> {
        self.unary("copy", ElementOp::Copy, dst, src, (0.0, 0.0))
    }

    fn fill(&self, dst: &mut WgpuTensor, value: f32) -> PureResult<()> {
        let params = Params::len(dst.numel()).scalars(value, 0.0);
        self.elementwise("fill", ElementOp::Fill, dst, None, None, params)
    }

    fn matmul(&self, dst: &mut WgpuTensor, lhs: &WgpuTensor, rhs: &WgpuTensor) -> PureResult<()> {
        self.gemm("matmul", dst, lhs, rhs, false, false)
    }

    fn matmul_transpose_lhs(
        &self,
        dst: &mut WgpuTensor,
        lhs: &WgpuTensor,
        rhs: &WgpuTensor,
    ) -> PureResult<()> {
        self.gemm("matmul_transpose_lhs", dst, lhs, rhs, true, false)
    }

    fn matmul_transpose_rhs(
        &self,
        dst: &mut WgpuTensor,
        lhs: &WgpuTensor,
        rhs: &WgpuTensor,
    ) -> PureResult<()> {
        self.gemm("matmul_transpose_rhs", dst, lhs, rhs, false, true)
    }

    fn add(&self, dst: &mut WgpuTensor, lhs: &WgpuTensor, rhs: &WgpuTensor) -> PureResult<()> {
        self.binary("add", ElementOp::Add, dst, lhs, rhs)
    }

    fn sub(&self, dst: &mut WgpuTensor, lhs: &WgpuTensor, rhs: &WgpuTensor) -> PureResult<()> {
        self.binary("sub", ElementOp::Sub, dst, lhs, rhs)
    }

    fn mul(&self, dst: &mut WgpuTensor, lhs: &WgpuTensor, rhs: &WgpuTensor) -> PureResult<()> {
        self.binary("mul", ElementOp::Mul, dst, lhs, rhs)
    }

    fn add_row_broadcast(
        &self,
        dst: &mut WgpuTensor,
        matrix: &WgpuTensor,
        row: &WgpuTensor,
    ) -> PureResult<()> {
        ensure_same("add_row_broadcast", &dst.shape, &matrix.shape)?;
        let (rows, cols) = matrix.shape.as_matrix();
        ensure_row_width("add_row_broadcast", &row.shape, cols)?;
        let params = Params::len(dst.numel()).matrix(rows, cols);
        self.elementwise(
            "add_row_broadcast",
            ElementOp::AddRow,
            dst,
            Some(&matrix.buffer),
            Some(&row.buffer),
            params,
        )
    }

    fn scale(&self, dst: &mut WgpuTensor, src: &WgpuTensor, scalar: f32) -> PureResult<()> {
        self.unary("scale", ElementOp::Scale, dst, src, (scalar, 0.0))
    }

    fn add_scaled(&self, dst: &mut WgpuTensor, src: &WgpuTensor, scalar: f32) -> PureResult<()> {
        self.unary("add_scaled", ElementOp::Axpy, dst, src, (scalar, 0.0))
    }

    fn sub_scaled(&self, dst: &mut WgpuTensor, src: &WgpuTensor, scalar: f32) -> PureResult<()> {
        self.unary("sub_scaled", ElementOp::Axpy, dst, src, (-scalar, 0.0))
    }

    fn transpose(&self, dst: &mut WgpuTensor, src: &WgpuTensor) -> PureResult<()> {
        let (rows, cols) = src.shape.as_matrix();
        if dst.shape.as_matrix() != (cols, rows) {
            return Err(TensorError::shape_mismatch(
                "transpose",
                &dst.shape,
                &Shape::matrix(cols, rows),
            ));
        }
        let params = Params::len(dst.numel()).matrix(rows, cols);
        self.elementwise(
            "transpose",
            ElementOp::Transpose,
            dst,
            Some(&src.buffer),
            None,
            params,
        )
    }

    fn sigmoid(&self, dst: &mut WgpuTensor, src: &WgpuTensor) -> PureResult<()> {
        self.unary("sigmoid", ElementOp::Sigmoid, dst, src, (0.0, 0.0))
    }

    fn tanh(&self, dst: &mut WgpuTensor, src: &WgpuTensor) -> PureResult<()> {
        self.unary("tanh", ElementOp::Tanh, dst, src, (0.0, 0.0))
    }

    fn sigmoid_derivative(&self, dst: &mut WgpuTensor, activated: &WgpuTensor) -> PureResult<()> {
        self.unary(
            "sigmoid_derivative",
            ElementOp::SigmoidDerivative,
            dst,
            activated,
            (0.0, 0.0),
        )
    }

    fn tanh_derivative(&self, dst: &mut WgpuTensor, activated: &WgpuTensor) -> PureResult<()> {
        self.unary(
            "tanh_derivative",
            ElementOp::TanhDerivative,
            dst,
            activated,
            (0.0, 0.0),
        )
    }

    fn softmax_rows(&self, dst: &mut WgpuTensor, src: &WgpuTensor) -> PureResult<()> {
        ensure_same("softmax_rows", &dst.shape, &src.shape)?;
        let (rows, cols) = src.shape.as_matrix();
        if rows > 0 && cols > 0 {
            let params = Params::len(rows * cols).matrix(rows, cols);
            let groups = ((rows as u32).div_ceil(SOFTMAX_GROUP), 1);
            self.dispatch(
                &self.ctx.softmax,
                &src.buffer,
                &self.ctx.dummy,
                &dst.buffer,
                params,
                groups,
            )?;
        }
        emit_tensor_op(BACKEND, "softmax_rows", &dst.shape);
        Ok(())
    }

    fn slice_row(&self, dst: &mut WgpuTensor, batch: &WgpuTensor, row: usize) -> PureResult<()> {
        let (rows, cols) = batch.shape.as_matrix();
        ensure_row_index("slice_row", row, rows)?;
        ensure_row_width("slice_row", &dst.shape, cols)?;
        let params = Params::len(cols).matrix(rows, cols).row(row);
        self.elementwise(
            "slice_row",
            ElementOp::SliceRow,
            dst,
            Some(&batch.buffer),
            None,
            params,
        )
    }

    fn set_row(&self, batch: &mut WgpuTensor, row: usize, src: &WgpuTensor) -> PureResult<()> {
        let (rows, cols) = batch.shape.as_matrix();
        ensure_row_index("set_row", row, rows)?;
        ensure_row_width("set_row", &src.shape, cols)?;
        let params = Params::len(cols).matrix(rows, cols).row(row);
        self.elementwise(
            "set_row",
            ElementOp::SetRow,
            batch,
            Some(&src.buffer),
            None,
            params,
        )
    }

    fn embedding_lookup(
        &self,
        dst: &mut WgpuTensor,
        table: &WgpuTensor,
        index: usize,
    ) -> PureResult<()> {
        let (rows, cols) = table.shape.as_matrix();
        ensure_row_index("embedding_lookup", index, rows)?;
        ensure_row_width("embedding_lookup", &dst.shape, cols)?;
        let params = Params::len(cols).matrix(rows, cols).row(index);
        self.elementwise(
            "embedding_lookup",
            ElementOp::SliceRow,
            dst,
            Some(&table.buffer),
            None,
            params,
        )
    }

    fn accumulate_row(
        &self,
        table: &mut WgpuTensor,
        index: usize,
        src: &WgpuTensor,
    ) -> PureResult<()> {
        let (rows, cols) = table.shape.as_matrix();
        ensure_row_index("accumulate_row", index, rows)?;
        ensure_row_width("accumulate_row", &src.shape, cols)?;
        let params = Params::len(cols).matrix(rows, cols).row(index);
        self.elementwise(
            "accumulate_row",
            ElementOp::AccumulateRow,
            table,
            Some(&src.buffer),
            None,
            params,
        )
    }

    fn clip(&self, dst: &mut WgpuTensor, src: &WgpuTensor, min: f32, max: f32) -> PureResult<()> {
        if min > max {
            return Err(TensorError::InvalidValue {
                label: "clip range is inverted",
            });
        }
        self.unary("clip", ElementOp::Clip, dst, src, (min, max))
    }

    fn softmax_cross_entropy_grad(
        &self,
        dst: &mut WgpuTensor,
        predictions: &WgpuTensor,
        targets: &[usize],
    ) -> PureResult<()> {
        ensure_same("softmax_cross_entropy_grad", &dst.shape, &predictions.shape)?;
        let (rows, cols) = predictions.shape.as_matrix();
        if targets.len() != rows {
            return Err(TensorError::DataLength {
                expected: rows,
                got: targets.len(),
            });
        }
        for &target in targets {
            ensure_row_index("softmax_cross_entropy_grad", target, cols)?;
        }
        let encoded: Vec<f32> = targets.iter().map(|&t| t as f32).collect();
        let target_buf = upload_slice(&self.ctx.device, "st.tensor.wgpu.targets", &encoded);
        let params = Params::len(rows * cols).matrix(rows, cols);
        let result = self.elementwise(
            "softmax_cross_entropy_grad",
            ElementOp::CrossEntropyGrad,
            dst,
            Some(&predictions.buffer),
            Some(&target_buf),
            params,
        );
        target_buf.destroy();
        result
    }
}
