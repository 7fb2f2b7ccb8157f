//! Execution backends.
//!
//! The planner never touches device state directly. Everything it needs
//! from a device (compiling programs, allocating and moving data,
//! dispatching and timing) goes through [`ExecutionBackend`].

mod cpu;
mod params;

pub use cpu::CpuBackend;
pub use params::PassParams;

use std::time::{Duration, Instant};

use crate::cache::ProgramKey;
use crate::config::BenchmarkOptions;
use crate::passes::{Extent, Plan, ResourceRole};
use crate::planner::ExecutablePlan;
use crate::radix::{Constraints, SUPPORTED_RADICES};
use crate::shape::{Precision, Target, TransformType};

/// Errors reported by a backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("Program compilation failed: {0}")]
    Compile(String),
    #[error("Benchmark exceeded its {0:?} budget")]
    Timeout(Duration),
    #[error("Unknown program {0:?}")]
    UnknownProgram(ProgramHandle),
    #[error("Unknown resource {0:?}")]
    UnknownResource(Resource),
    #[error("Plan resource {0:?} was not allocated")]
    MissingResource(ResourceRole),
    #[error("Resource too small: need {needed} bytes, have {size}")]
    ResourceTooSmall { needed: u64, size: u64 },
    #[error("Allocation of {requested} bytes exceeds the device limit of {limit}")]
    ResourceTooLarge { requested: u64, limit: u64 },
    #[error("Dispatch failed: {0}")]
    Dispatch(String),
    #[error("Readback failed: {0}")]
    Readback(String),
    #[error("Unsupported by this backend: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u64);

/// A buffer or texture owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

impl Resource {
    pub fn id(&self) -> u64 {
        match self {
            Resource::Buffer(BufferHandle(id)) | Resource::Texture(TextureHandle(id)) => *id,
        }
    }
}

/// Texel formats used for texture-bound inputs and outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
}

impl TextureFormat {
    pub fn channels(&self) -> u32 {
        match self {
            TextureFormat::R16Float | TextureFormat::R32Float => 1,
            TextureFormat::Rg16Float | TextureFormat::Rg32Float => 2,
            TextureFormat::Rgba16Float | TextureFormat::Rgba32Float => 4,
        }
    }

    pub fn bytes_per_texel(&self) -> u64 {
        let channel = match self {
            TextureFormat::R16Float | TextureFormat::Rg16Float | TextureFormat::Rgba16Float => 2,
            _ => 4,
        };
        channel * self.channels() as u64
    }
}

/// Texture dimensions and format holding `extent` complex elements.
///
/// Real textures store the two reals packed in one complex value as two
/// texels, so they are twice as wide.
pub fn texture_layout(
    target: Target,
    extent: Extent,
    transform_type: TransformType,
    precision: Precision,
) -> (u32, u32, TextureFormat) {
    let half = precision == Precision::Half;
    match target {
        Target::TextureReal => {
            let format = if half {
                TextureFormat::R16Float
            } else {
                TextureFormat::R32Float
            };
            (extent.cols * 2, extent.rows, format)
        }
        _ => {
            let format = match (transform_type.components(), half) {
                (2, true) => TextureFormat::Rgba16Float,
                (2, false) => TextureFormat::Rgba32Float,
                (_, true) => TextureFormat::Rg16Float,
                (_, false) => TextureFormat::Rg32Float,
            };
            (extent.cols, extent.rows, format)
        }
    }
}

/// Capabilities of the device programs are built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProfile {
    /// Name recorded in program keys and wisdom records.
    pub name: String,
    pub max_shared_memory_elements: u32,
    pub max_work_group_invocations: u32,
    pub max_work_group_size: [u32; 3],
    pub supported_radices: Vec<u32>,
    pub supports_half: bool,
}

impl Constraints {
    /// Constraints matching a device profile.
    pub fn from_profile(profile: &TargetProfile) -> Self {
        let allowed_radices = profile
            .supported_radices
            .iter()
            .copied()
            .filter(|r| SUPPORTED_RADICES.contains(r))
            .collect();
        Self {
            allowed_radices,
            max_shared_memory_elements: profile.max_shared_memory_elements,
            max_work_group_invocations: profile.max_work_group_invocations,
        }
    }
}

/// Resources bound to one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundResources {
    pub input: Resource,
    pub aux: Option<Resource>,
    pub output: Resource,
}

/// Device capability surface consumed by the planner.
pub trait ExecutionBackend: Send + Sync {
    fn profile(&self) -> &TargetProfile;

    /// Build the program for `key`. Each call yields a fresh handle.
    fn compile(&self, key: &ProgramKey) -> Result<ProgramHandle, BackendError>;

    fn destroy_program(&self, program: ProgramHandle);

    fn allocate_buffer(&self, size_bytes: u64) -> Result<BufferHandle, BackendError>;

    fn allocate_texture(
        &self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<TextureHandle, BackendError>;

    fn release_resource(&self, resource: Resource);

    /// Upload `data` to the start of `resource`.
    fn write_buffer(&self, resource: Resource, data: &[u8]) -> Result<(), BackendError>;

    /// Download the full contents of `resource`.
    fn read_buffer(&self, resource: Resource) -> Result<Vec<u8>, BackendError>;

    fn dispatch(
        &self,
        program: ProgramHandle,
        work_groups: [u32; 3],
        params: &PassParams,
        resources: &BoundResources,
    ) -> Result<(), BackendError>;

    /// Wait until every submitted dispatch has finished.
    fn synchronize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Like [`ExecutionBackend::synchronize`], giving up with
    /// [`BackendError::Timeout`] after `budget`.
    fn synchronize_within(&self, _budget: Duration) -> Result<(), BackendError> {
        self.synchronize()
    }

    /// Average wall-clock time of one execution of `plan`.
    ///
    /// Fails with [`BackendError::Timeout`] once the warm-up and timed runs
    /// together exceed the configured budget.
    fn benchmark(
        &self,
        plan: &ExecutablePlan,
        options: &BenchmarkOptions,
    ) -> Result<Duration, BackendError> {
        benchmark_plan(self, plan, options)
    }
}

/// Allocate scratch resources for `plan`, time it, then free them again.
pub fn benchmark_plan<B: ExecutionBackend + ?Sized>(
    backend: &B,
    plan: &ExecutablePlan,
    options: &BenchmarkOptions,
) -> Result<Duration, BackendError> {
    let resources = PlanResources::allocate(backend, plan.plan())?;
    let result = time_plan(backend, plan, &resources, options);
    resources.release(backend);
    result
}

fn time_plan<B: ExecutionBackend + ?Sized>(
    backend: &B,
    plan: &ExecutablePlan,
    resources: &PlanResources,
    options: &BenchmarkOptions,
) -> Result<Duration, BackendError> {
    let budget = options.timeout();
    let started = Instant::now();
    let check = || {
        if started.elapsed() > budget {
            Err(BackendError::Timeout(budget))
        } else {
            Ok(())
        }
    };

    let remaining = || budget.saturating_sub(started.elapsed());

    for _ in 0..options.warmup_iterations {
        run_plan(backend, plan, resources)?;
        backend.synchronize_within(remaining())?;
        check()?;
    }

    let timed = Instant::now();
    for _ in 0..options.iterations {
        run_plan(backend, plan, resources)?;
        backend.synchronize_within(remaining())?;
        check()?;
    }
    Ok(timed.elapsed() / options.iterations.max(1))
}

/// Resources of one plan execution, indexed by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanResources {
    pub input: Resource,
    pub aux: Option<Resource>,
    pub output: Resource,
    pub scratch: [Option<Resource>; 2],
}

impl PlanResources {
    /// Allocate every resource `plan` needs.
    pub fn allocate<B: ExecutionBackend + ?Sized>(
        backend: &B,
        plan: &Plan,
    ) -> Result<Self, BackendError> {
        let shape = plan.shape();
        let buffers = plan.buffers();
        let allocate = |target: Target, extent: Extent, bytes: u64| -> Result<Resource, BackendError> {
            match target {
                Target::Buffer => Ok(Resource::Buffer(backend.allocate_buffer(bytes)?)),
                _ => {
                    let (width, height, format) =
                        texture_layout(target, extent, shape.transform_type(), shape.precision());
                    Ok(Resource::Texture(backend.allocate_texture(width, height, format)?))
                }
            }
        };

        let input = allocate(
            shape.input_target(),
            buffers.input.extent,
            buffers.input.bytes,
        )?;
        let aux = buffers
            .aux
            .map(|aux| allocate(shape.input_target(), aux.extent, aux.bytes))
            .transpose()?;
        let output = allocate(
            shape.output_target(),
            buffers.output.extent,
            buffers.output.bytes,
        )?;
        let mut scratch = [None, None];
        for (slot, size) in scratch.iter_mut().zip(buffers.scratch.iter()) {
            if let Some(size) = size {
                *slot = Some(Resource::Buffer(backend.allocate_buffer(size.bytes)?));
            }
        }

        Ok(Self {
            input,
            aux,
            output,
            scratch,
        })
    }

    pub fn resolve(&self, role: ResourceRole) -> Result<Resource, BackendError> {
        let resource = match role {
            ResourceRole::Input => Some(self.input),
            ResourceRole::InputAux => self.aux,
            ResourceRole::Output => Some(self.output),
            ResourceRole::Scratch(i) => self.scratch.get(i as usize).copied().flatten(),
        };
        resource.ok_or(BackendError::MissingResource(role))
    }

    pub fn release<B: ExecutionBackend + ?Sized>(self, backend: &B) {
        backend.release_resource(self.input);
        if let Some(aux) = self.aux {
            backend.release_resource(aux);
        }
        backend.release_resource(self.output);
        for scratch in self.scratch.into_iter().flatten() {
            backend.release_resource(scratch);
        }
    }
}

/// Dispatch every pass of `plan` in order.
pub fn run_plan<B: ExecutionBackend + ?Sized>(
    backend: &B,
    plan: &ExecutablePlan,
    resources: &PlanResources,
) -> Result<(), BackendError> {
    for (pass, program) in plan.steps() {
        let bound = BoundResources {
            input: resources.resolve(pass.input.role)?,
            aux: if pass.reads_aux {
                Some(resources.resolve(ResourceRole::InputAux)?)
            } else {
                None
            },
            output: resources.resolve(pass.output.role)?,
        };
        backend.dispatch(program, pass.dispatch, &PassParams::for_pass(pass), &bound)?;
    }
    Ok(())
}

/// Upload single-precision values.
pub fn write_f32<B: ExecutionBackend + ?Sized>(
    backend: &B,
    resource: Resource,
    values: &[f32],
) -> Result<(), BackendError> {
    backend.write_buffer(resource, bytemuck::cast_slice(values))
}

/// Download a resource as single-precision values.
pub fn read_f32<B: ExecutionBackend + ?Sized>(
    backend: &B,
    resource: Resource,
) -> Result<Vec<f32>, BackendError> {
    let bytes = backend.read_buffer(resource)?;
    Ok(bytemuck::pod_collect_to_vec(&bytes))
}
