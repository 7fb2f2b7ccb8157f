//! Bind group layout and compute pipeline creation for pass programs.

use wgpu::{BindGroup, BindGroupLayout, Buffer, ComputePipeline, Device};

use crate::backend::BackendError;
use crate::cache::ProgramKey;

use super::shader;

/// Layout shared by every pass program: input, aux, output, params.
pub struct PassLayout {
    pub bind_group: BindGroupLayout,
    pipeline: wgpu::PipelineLayout,
}

impl PassLayout {
    pub fn new(device: &Device) -> Self {
        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bind_group = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("fft_pass_layout"),
            entries: &[
                storage(0, true),
                storage(1, true),
                storage(2, false),
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

        let pipeline = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("fft_pass_pipeline_layout"),
            bind_group_layouts: &[&bind_group],
            immediate_size: 0,
        });

        Self {
            bind_group,
            pipeline,
        }
    }

    /// Compile the generated shader of `key` into a pipeline.
    ///
    /// Validation failures are captured and returned instead of reaching
    /// the device's uncaptured error handler.
    pub fn create_pipeline(
        &self,
        device: &Device,
        key: &ProgramKey,
    ) -> Result<ComputePipeline, BackendError> {
        let label = format!("fft_{:?}_{:?}", key.kernel, key.axis);
        let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&label),
            source: wgpu::ShaderSource::Wgsl(shader::generate(key).into()),
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&format!("{}_pipeline", label)),
            layout: Some(&self.pipeline),
            module: &module,
            entry_point: Some(shader::ENTRY_POINT),
            compilation_options: Default::default(),
            cache: None,
        });

        match pollster::block_on(scope.pop()) {
            Some(error) => Err(BackendError::Compile(format!("{}: {}", label, error))),
            None => Ok(pipeline),
        }
    }

    pub fn create_bind_group(
        &self,
        device: &Device,
        input: &Buffer,
        aux: &Buffer,
        output: &Buffer,
        params: &Buffer,
    ) -> BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("fft_pass"),
            layout: &self.bind_group,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: input.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: aux.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: output.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: params.as_entire_binding(),
                },
            ],
        })
    }
}
