// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use wgpu::util::DeviceExt;
use wgpu::{Buffer, BufferUsages, Device, MapMode, Queue};

/// Usage flags shared by every tensor buffer.
pub(crate) const TENSOR_USAGE: BufferUsages = BufferUsages::STORAGE
    .union(BufferUsages::COPY_SRC)
    .union(BufferUsages::COPY_DST);

/// wgpu rejects zero-sized bindings, so empty tensors still get one element.
fn padded_size(elements: usize) -> u64 {
    (elements.max(1) * std::mem::size_of::<f32>()) as u64
}

/// Create a storage buffer initialised with the provided `f32` slice.
pub(crate) fn upload_slice(device: &Device, label: &str, data: &[f32]) -> Buffer {
    if data.is_empty() {
        return empty_buffer(device, label, 0);
    }
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::cast_slice(data),
        usage: TENSOR_USAGE,
    })
}

/// Allocate a zeroed storage buffer sized to `elements` `f32` values.
pub(crate) fn empty_buffer(device: &Device, label: &str, elements: usize) -> Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: padded_size(elements),
        usage: TENSOR_USAGE,
        mapped_at_creation: false,
    })
}

/// Read back the first `elements` values of a storage buffer.
pub(crate) fn read_buffer(
    device: &Device,
    queue: &Queue,
    buffer: &Buffer,
    elements: usize,
) -> Result<Vec<f32>, String> {
    if elements == 0 {
        return Ok(Vec::new());
    }
    let size = (elements * std::mem::size_of::<f32>()) as u64;
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("st.tensor.wgpu.readback"),
        size,
        usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("st.tensor.wgpu.readback_encoder"),
    });
    encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
    queue.submit(std::iter::once(encoder.finish()));
    let slice = staging.slice(..);
    let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
    slice.map_async(MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device.poll(wgpu::Maintain::Wait);
    pollster::block_on(async {
        receiver
            .receive()
            .await
            .ok_or_else(|| "map_async was cancelled".to_string())?
            .map_err(|_| "failed to map WGPU buffer".to_string())
    })?;
    let data = slice.get_mapped_range();
    let output = bytemuck::cast_slice::<u8, f32>(&data).to_vec();
    drop(data);
    staging.unmap();
    Ok(output)
}
