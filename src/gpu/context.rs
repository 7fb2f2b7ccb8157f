//! Compute device acquisition.
//!
//! The FFT backend never presents anything, so the context asks for no
//! surface and no features. It raises the compute and storage limits to
//! whatever the adapter offers, since those bound the radices and work
//! groups the planner may use.

use std::sync::Arc;
use wgpu::{Adapter, Device, Instance, Queue};

/// Errors raised while opening a compute device.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("No adapter with compute support was found")]
    NoAdapter,
    #[error("Compute device request was refused: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),
}

/// Adapter, device and queue the FFT passes are submitted to.
pub struct GpuContext {
    pub instance: Instance,
    pub adapter: Arc<Adapter>,
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
}

impl GpuContext {
    /// Open the high-performance adapter for compute work.
    pub async fn new() -> Result<Self, GpuError> {
        let instance = Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::METAL | wgpu::Backends::VULKAN | wgpu::Backends::DX12,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .map_err(|_| GpuError::NoAdapter)?;

        let offered = adapter.limits();
        let required_limits = wgpu::Limits {
            max_compute_workgroup_storage_size: offered.max_compute_workgroup_storage_size,
            max_compute_invocations_per_workgroup: offered.max_compute_invocations_per_workgroup,
            max_compute_workgroup_size_x: offered.max_compute_workgroup_size_x,
            max_compute_workgroup_size_y: offered.max_compute_workgroup_size_y,
            max_compute_workgroup_size_z: offered.max_compute_workgroup_size_z,
            max_storage_buffer_binding_size: offered.max_storage_buffer_binding_size,
            max_buffer_size: offered.max_buffer_size,
            ..wgpu::Limits::default()
        };
        log::debug!(
            "Requesting {} invocations, {} bytes of workgroup storage",
            required_limits.max_compute_invocations_per_workgroup,
            required_limits.max_compute_workgroup_storage_size
        );

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("gpufft"),
                required_features: wgpu::Features::empty(),
                required_limits,
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
                experimental_features: wgpu::ExperimentalFeatures::default(),
            })
            .await?;

        Ok(Self {
            instance,
            adapter: Arc::new(adapter),
            device: Arc::new(device),
            queue: Arc::new(queue),
        })
    }

    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    /// Limits the device was opened with.
    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }

    /// Whether shaders may pack and unpack half floats.
    pub fn half_precision(&self) -> bool {
        self.adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::SHADER_F16_IN_F32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_context_raises_compute_limits() {
        // Machines without an adapter have nothing to check.
        let Ok(ctx) = GpuContext::new().await else {
            return;
        };
        let limits = ctx.limits();
        let offered = ctx.adapter.limits();
        assert_eq!(
            limits.max_compute_invocations_per_workgroup,
            offered.max_compute_invocations_per_workgroup
        );
        assert_eq!(
            limits.max_compute_workgroup_storage_size,
            offered.max_compute_workgroup_storage_size
        );
        assert!(limits.max_compute_workgroup_storage_size > 0);
    }
}
