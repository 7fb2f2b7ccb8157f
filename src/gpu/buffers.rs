//! GPU buffer helpers for pass execution.

use wgpu::{Buffer, BufferUsages, Device, Queue};

use crate::backend::BackendError;

/// Storage buffer usable as pass input, output and copy endpoint.
pub fn create_storage_buffer(device: &Device, label: &str, size_bytes: u64) -> Buffer {
    let size = size_bytes.max(4).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Uniform buffer holding one `PassParams` block.
pub fn create_uniform_buffer(device: &Device, label: &str, size: u64) -> Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Copy `source` into a staging buffer and map it back to the host.
pub fn read_back(device: &Device, queue: &Queue, source: &Buffer) -> Result<Vec<u8>, BackendError> {
    let size = source.size();
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("fft_staging"),
        size,
        usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("fft_readback_encoder"),
    });
    encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
    queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    device
        .poll(wgpu::PollType::wait_indefinitely())
        .map_err(|e| BackendError::Readback(e.to_string()))?;

    rx.recv()
        .map_err(|e| BackendError::Readback(e.to_string()))?
        .map_err(|e| BackendError::Readback(format!("{:?}", e)))?;

    let data = slice.get_mapped_range();
    let bytes = data.to_vec();
    drop(data);
    staging.unmap();
    Ok(bytes)
}
