//! GPU execution of plans using wgpu.
//!
//! Each program is a WGSL compute shader generated from its key. Textures
//! are stored as storage buffers with the texel layout of their format, so
//! every pass binds the same four slots: input, aux, output, params.

pub mod buffers;
pub mod context;
pub mod pipelines;
pub mod shader;

pub use context::{GpuContext, GpuError};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wgpu::{Buffer, ComputePipeline};

use crate::backend::{
    BackendError, BoundResources, BufferHandle, ExecutionBackend, PassParams, ProgramHandle,
    Resource, TargetProfile, TextureFormat, TextureHandle,
};
use crate::cache::ProgramKey;
use crate::radix::SUPPORTED_RADICES;
use crate::shape::Precision;

use pipelines::PassLayout;

/// Complex single-precision value in bytes, the unit of workgroup storage.
const COMPLEX_BYTES: u32 = 8;

/// Backend running passes as wgpu compute dispatches.
pub struct WgpuBackend {
    context: GpuContext,
    profile: TargetProfile,
    layout: PassLayout,
    params: Buffer,
    next_id: AtomicU64,
    programs: Mutex<HashMap<ProgramHandle, Arc<ComputePipeline>>>,
    resources: Mutex<HashMap<u64, Arc<Buffer>>>,
    /// Serializes params upload and submission of one dispatch.
    submit: Mutex<()>,
}

impl WgpuBackend {
    pub fn new(context: GpuContext) -> Self {
        let limits = context.limits();
        let info = context.adapter_info();
        let profile = TargetProfile {
            name: format!("wgpu-{:?}-{}", info.backend, info.name),
            max_shared_memory_elements: limits.max_compute_workgroup_storage_size / COMPLEX_BYTES,
            max_work_group_invocations: limits.max_compute_invocations_per_workgroup,
            max_work_group_size: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            supported_radices: SUPPORTED_RADICES.to_vec(),
            supports_half: context.half_precision(),
        };
        log::info!(
            "GPU backend on {} ({:?}): {} shared elements, {} invocations, half {}",
            info.name,
            info.backend,
            profile.max_shared_memory_elements,
            profile.max_work_group_invocations,
            profile.supports_half
        );

        let layout = PassLayout::new(&context.device);
        let params = buffers::create_uniform_buffer(
            &context.device,
            "fft_params",
            std::mem::size_of::<PassParams>() as u64,
        );

        Self {
            context,
            profile,
            layout,
            params,
            next_id: AtomicU64::new(1),
            programs: Mutex::new(HashMap::new()),
            resources: Mutex::new(HashMap::new()),
            submit: Mutex::new(()),
        }
    }

    /// Open the default adapter and wrap it.
    pub fn create() -> Result<Self, GpuError> {
        let context = pollster::block_on(GpuContext::new())?;
        Ok(Self::new(context))
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn buffer(&self, resource: Resource) -> Result<Arc<Buffer>, BackendError> {
        self.resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&resource.id())
            .cloned()
            .ok_or(BackendError::UnknownResource(resource))
    }

    fn insert(&self, size_bytes: u64, label: &str) -> Result<u64, BackendError> {
        let limits = self.context.limits();
        let binding_limit = limits.max_storage_buffer_binding_size as u64;
        if size_bytes > binding_limit || size_bytes > limits.max_buffer_size {
            return Err(BackendError::ResourceTooLarge {
                requested: size_bytes,
                limit: binding_limit.min(limits.max_buffer_size),
            });
        }
        let id = self.next_id();
        let buffer = buffers::create_storage_buffer(&self.context.device, label, size_bytes);
        self.resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(buffer));
        Ok(id)
    }

    fn check_workgroup(&self, key: &ProgramKey) -> Result<(), BackendError> {
        let wg = key.workgroup;
        let [max_x, max_y, max_z] = self.profile.max_work_group_size;
        if wg.invocations() > self.profile.max_work_group_invocations
            || wg.x > max_x
            || wg.y > max_y
            || wg.z > max_z
        {
            return Err(BackendError::Compile(format!(
                "work group {}x{}x{} exceeds device limits",
                wg.x, wg.y, wg.z
            )));
        }
        Ok(())
    }
}

impl ExecutionBackend for WgpuBackend {
    fn profile(&self) -> &TargetProfile {
        &self.profile
    }

    fn compile(&self, key: &ProgramKey) -> Result<ProgramHandle, BackendError> {
        if key.target_profile != self.profile.name {
            return Err(BackendError::Compile(format!(
                "program targets '{}', backend is '{}'",
                key.target_profile, self.profile.name
            )));
        }
        if key.precision == Precision::Half && !self.profile.supports_half {
            return Err(BackendError::Compile(
                "device cannot pack half floats in shaders".to_string(),
            ));
        }
        self.check_workgroup(key)?;

        let pipeline = self.layout.create_pipeline(&self.context.device, key)?;
        let handle = ProgramHandle(self.next_id());
        log::debug!("Compiled {:?} {:?} as {:?}", key.kernel, key.axis, handle);
        self.programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle, Arc::new(pipeline));
        Ok(handle)
    }

    fn destroy_program(&self, program: ProgramHandle) {
        self.programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&program);
    }

    fn allocate_buffer(&self, size_bytes: u64) -> Result<BufferHandle, BackendError> {
        self.insert(size_bytes, "fft_buffer").map(BufferHandle)
    }

    fn allocate_texture(
        &self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<TextureHandle, BackendError> {
        let size = width as u64 * height as u64 * format.bytes_per_texel();
        self.insert(size, "fft_texture").map(TextureHandle)
    }

    fn release_resource(&self, resource: Resource) {
        let removed = self
            .resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&resource.id());
        if let Some(buffer) = removed {
            buffer.destroy();
        }
    }

    fn write_buffer(&self, resource: Resource, data: &[u8]) -> Result<(), BackendError> {
        let buffer = self.buffer(resource)?;
        let padded = (data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if padded > buffer.size() {
            return Err(BackendError::ResourceTooSmall {
                needed: data.len() as u64,
                size: buffer.size(),
            });
        }
        if padded == data.len() as u64 {
            self.context.queue.write_buffer(&buffer, 0, data);
        } else {
            let mut aligned = data.to_vec();
            aligned.resize(padded as usize, 0);
            self.context.queue.write_buffer(&buffer, 0, &aligned);
        }
        Ok(())
    }

    fn read_buffer(&self, resource: Resource) -> Result<Vec<u8>, BackendError> {
        let buffer = self.buffer(resource)?;
        let _guard = self.submit.lock().unwrap_or_else(|e| e.into_inner());
        buffers::read_back(&self.context.device, &self.context.queue, &buffer)
    }

    fn dispatch(
        &self,
        program: ProgramHandle,
        work_groups: [u32; 3],
        params: &PassParams,
        resources: &BoundResources,
    ) -> Result<(), BackendError> {
        let pipeline = self
            .programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&program)
            .cloned()
            .ok_or(BackendError::UnknownProgram(program))?;

        let max_groups = self.context.limits().max_compute_workgroups_per_dimension;
        if work_groups.iter().any(|&n| n > max_groups) {
            return Err(BackendError::Dispatch(format!(
                "{:?} work groups exceed {} per dimension",
                work_groups, max_groups
            )));
        }

        let input = self.buffer(resources.input)?;
        let aux = match resources.aux {
            Some(aux) => self.buffer(aux)?,
            None => input.clone(),
        };
        let output = self.buffer(resources.output)?;
        let device = &self.context.device;
        let bind_group = self
            .layout
            .create_bind_group(device, &input, &aux, &output, &self.params);

        // One submission per dispatch so every pass sees its own params.
        let _guard = self.submit.lock().unwrap_or_else(|e| e.into_inner());
        self.context
            .queue
            .write_buffer(&self.params, 0, bytemuck::bytes_of(params));
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("fft_pass_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("fft_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(work_groups[0], work_groups[1], work_groups[2]);
        }
        self.context.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn synchronize(&self) -> Result<(), BackendError> {
        self.context
            .device
            .poll(wgpu::PollType::wait_indefinitely())
            .map(|_| ())
            .map_err(|e| BackendError::Dispatch(e.to_string()))
    }

    fn synchronize_within(&self, budget: Duration) -> Result<(), BackendError> {
        let wait = wgpu::PollType::Wait {
            submission_index: None,
            timeout: Some(budget),
        };
        match self.context.device.poll(wait) {
            Ok(_) => Ok(()),
            Err(wgpu::PollError::Timeout) => Err(BackendError::Timeout(budget)),
            Err(e) => Err(BackendError::Dispatch(e.to_string())),
        }
    }
}
