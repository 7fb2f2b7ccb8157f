//! Reference backend executing passes on the CPU.
//!
//! Programs are interpreted from their keys, buffers and textures are plain
//! `f32` arrays. Arithmetic runs in double precision, so results serve as
//! ground truth for the GPU backend.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use rustfft::num_complex::Complex;

use crate::cache::{KernelKind, ProgramKey};
use crate::passes::dispatch_coverage;
use crate::radix::SUPPORTED_RADICES;
use crate::shape::{Axis, Precision};

use super::{
    BackendError, BoundResources, BufferHandle, ExecutionBackend, PassParams, ProgramHandle,
    Resource, TargetProfile, TextureFormat, TextureHandle,
};

type C64 = Complex<f64>;

/// Single-threaded reference executor.
pub struct CpuBackend {
    profile: TargetProfile,
    next_id: AtomicU64,
    programs: Mutex<HashMap<ProgramHandle, ProgramKey>>,
    storage: Mutex<HashMap<u64, Vec<f32>>>,
    compiles: AtomicUsize,
    destroyed: AtomicUsize,
    max_allocation: u64,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_profile(TargetProfile {
            name: "cpu-reference".to_string(),
            max_shared_memory_elements: 8192,
            max_work_group_invocations: 256,
            max_work_group_size: [256, 256, 64],
            supported_radices: SUPPORTED_RADICES.to_vec(),
            supports_half: false,
        })
    }

    pub fn with_profile(profile: TargetProfile) -> Self {
        Self {
            profile,
            next_id: AtomicU64::new(1),
            programs: Mutex::new(HashMap::new()),
            storage: Mutex::new(HashMap::new()),
            compiles: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            max_allocation: u64::MAX,
        }
    }

    /// Refuse allocations larger than `bytes`, like a device would.
    pub fn with_allocation_limit(mut self, bytes: u64) -> Self {
        self.max_allocation = bytes;
        self
    }

    fn check_allocation(&self, size_bytes: u64) -> Result<(), BackendError> {
        if size_bytes > self.max_allocation {
            return Err(BackendError::ResourceTooLarge {
                requested: size_bytes,
                limit: self.max_allocation,
            });
        }
        Ok(())
    }

    /// Programs compiled so far.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    /// Programs destroyed so far.
    pub fn destroy_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Programs currently alive.
    pub fn live_programs(&self) -> usize {
        self.programs.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn load(&self, resource: Resource, values: usize) -> Result<Vec<C64>, BackendError> {
        let storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
        let data = storage
            .get(&resource.id())
            .ok_or(BackendError::UnknownResource(resource))?;
        if data.len() < values * 2 {
            return Err(BackendError::ResourceTooSmall {
                needed: values as u64 * 8,
                size: data.len() as u64 * 4,
            });
        }
        Ok(data[..values * 2]
            .chunks_exact(2)
            .map(|c| C64::new(c[0] as f64, c[1] as f64))
            .collect())
    }

    fn store(&self, resource: Resource, values: &[C64]) -> Result<(), BackendError> {
        let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
        let data = storage
            .get_mut(&resource.id())
            .ok_or(BackendError::UnknownResource(resource))?;
        if data.len() < values.len() * 2 {
            return Err(BackendError::ResourceTooSmall {
                needed: values.len() as u64 * 8,
                size: data.len() as u64 * 4,
            });
        }
        for (dst, v) in data.chunks_exact_mut(2).zip(values) {
            dst[0] = v.re as f32;
            dst[1] = v.im as f32;
        }
        Ok(())
    }
}

impl ExecutionBackend for CpuBackend {
    fn profile(&self) -> &TargetProfile {
        &self.profile
    }

    fn compile(&self, key: &ProgramKey) -> Result<ProgramHandle, BackendError> {
        if key.precision == Precision::Half {
            return Err(BackendError::Compile(
                "half precision is not available on the CPU reference".to_string(),
            ));
        }
        if key.target_profile != self.profile.name {
            return Err(BackendError::Compile(format!(
                "program targets '{}', backend is '{}'",
                key.target_profile, self.profile.name
            )));
        }
        let handle = ProgramHandle(self.next_id());
        self.programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle, key.clone());
        self.compiles.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn destroy_program(&self, program: ProgramHandle) {
        let removed = self
            .programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&program);
        if removed.is_some() {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn allocate_buffer(&self, size_bytes: u64) -> Result<BufferHandle, BackendError> {
        self.check_allocation(size_bytes)?;
        let id = self.next_id();
        let floats = size_bytes.div_ceil(4) as usize;
        self.storage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, vec![0.0; floats]);
        Ok(BufferHandle(id))
    }

    fn allocate_texture(
        &self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<TextureHandle, BackendError> {
        if format.bytes_per_texel() != 4 * format.channels() as u64 {
            return Err(BackendError::Unsupported(format!("{:?} textures", format)));
        }
        self.check_allocation(width as u64 * height as u64 * format.bytes_per_texel())?;
        let id = self.next_id();
        let floats = width as usize * height as usize * format.channels() as usize;
        self.storage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, vec![0.0; floats]);
        Ok(TextureHandle(id))
    }

    fn release_resource(&self, resource: Resource) {
        self.storage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&resource.id());
    }

    fn write_buffer(&self, resource: Resource, data: &[u8]) -> Result<(), BackendError> {
        let values: Vec<f32> = bytemuck::pod_collect_to_vec(data);
        let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
        let target = storage
            .get_mut(&resource.id())
            .ok_or(BackendError::UnknownResource(resource))?;
        if values.len() > target.len() {
            return Err(BackendError::ResourceTooSmall {
                needed: data.len() as u64,
                size: target.len() as u64 * 4,
            });
        }
        target[..values.len()].copy_from_slice(&values);
        Ok(())
    }

    fn read_buffer(&self, resource: Resource) -> Result<Vec<u8>, BackendError> {
        let storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
        let data = storage
            .get(&resource.id())
            .ok_or(BackendError::UnknownResource(resource))?;
        Ok(bytemuck::cast_slice(data).to_vec())
    }

    fn dispatch(
        &self,
        program: ProgramHandle,
        work_groups: [u32; 3],
        params: &PassParams,
        resources: &BoundResources,
    ) -> Result<(), BackendError> {
        let key = self
            .programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&program)
            .cloned()
            .ok_or(BackendError::UnknownProgram(program))?;

        let covered = dispatch_coverage(key.kernel, key.workgroup, key.lanes, work_groups);
        let expected = params.out_rows as u64 * params.out_cols as u64;
        if covered != expected {
            return Err(BackendError::Dispatch(format!(
                "{:?} covers {} elements, output has {}",
                key.kernel, covered, expected
            )));
        }

        let mut input = self.load(resources.input, params.input_values())?;
        if params.convolve != 0 {
            let aux = resources
                .aux
                .ok_or_else(|| BackendError::Dispatch("convolution without aux input".to_string()))?;
            let aux = self.load(aux, params.input_values())?;
            for (value, factor) in input.iter_mut().zip(aux) {
                *value *= factor;
            }
        }

        let mut output = vec![C64::new(0.0, 0.0); params.output_values()];
        match key.kernel {
            KernelKind::Radix(_) => radix_stage(&input, &mut output, params, key.axis),
            KernelKind::ResolveRealToComplex => resolve_real_to_complex(&input, &mut output, params),
            KernelKind::ResolveComplexToReal => resolve_complex_to_real(&input, &mut output, params),
            KernelKind::Transpose => transpose(&input, &mut output, params),
            KernelKind::Copy => {
                let n = output.len();
                output.copy_from_slice(&input[..n]);
            }
        }

        if params.scale != 1.0 {
            let scale = params.scale as f64;
            for value in &mut output {
                *value *= scale;
            }
        }
        self.store(resources.output, &output)
    }
}

fn twiddle(sign: f64, numerator: u64, denominator: u64) -> C64 {
    C64::from_polar(1.0, sign * 2.0 * PI * numerator as f64 / denominator as f64)
}

/// One Stockham stage of radix `params.radix` at stride `params.stride`.
fn radix_stage(input: &[C64], output: &mut [C64], params: &PassParams, axis: Axis) {
    let n = params.length as usize;
    let radix = params.radix as usize;
    let stride = params.stride as usize;
    let comps = params.components as usize;
    let cols = params.in_cols as usize;
    let sign = params.sign as f64;
    let (lines, line_step, elem_step) = match axis {
        Axis::Horizontal => (params.in_rows as usize, cols * comps, comps),
        Axis::Vertical => (cols, comps, cols * comps),
    };
    let roots: Vec<C64> = (0..radix)
        .map(|m| twiddle(sign, m as u64, radix as u64))
        .collect();

    let span = n / radix;
    let mut gathered = vec![C64::new(0.0, 0.0); radix];
    for line in 0..lines {
        for c in 0..comps {
            let at = |i: usize| line * line_step + i * elem_step + c;
            for i in 0..span {
                let k = i % stride;
                for (m, slot) in gathered.iter_mut().enumerate() {
                    let w = twiddle(sign, (m * k) as u64, (stride * radix) as u64);
                    *slot = input[at(i + m * span)] * w;
                }
                let base = (i - k) * radix + k;
                for m in 0..radix {
                    let sum = gathered
                        .iter()
                        .enumerate()
                        .fold(C64::new(0.0, 0.0), |acc, (q, v)| acc + v * roots[(q * m) % radix]);
                    output[at(base + m * stride)] = sum;
                }
            }
        }
    }
}

/// Unpack the half-length transform of packed reals into `M + 1` bins.
fn resolve_real_to_complex(input: &[C64], output: &mut [C64], params: &PassParams) {
    let half = params.length as usize;
    let in_cols = params.in_cols as usize;
    let out_cols = params.out_cols as usize;
    let i = C64::new(0.0, 1.0);
    for row in 0..params.in_rows as usize {
        let z = &input[row * in_cols..(row + 1) * in_cols];
        for k in 0..=half {
            let a = z[k % half];
            let b = z[(half - k) % half].conj();
            let even = (a + b) * 0.5;
            let odd = -i * (a - b) * 0.5;
            let w = twiddle(-1.0, k as u64, 2 * half as u64);
            output[row * out_cols + k] = even + w * odd;
        }
    }
}

/// Pack `M + 1` bins into the half-length spectrum of packed reals.
fn resolve_complex_to_real(input: &[C64], output: &mut [C64], params: &PassParams) {
    let half = params.length as usize;
    let in_cols = params.in_cols as usize;
    let out_cols = params.out_cols as usize;
    let i = C64::new(0.0, 1.0);
    for row in 0..params.in_rows as usize {
        let x = &input[row * in_cols..(row + 1) * in_cols];
        for k in 0..half {
            let a = x[k];
            let b = x[half - k].conj();
            let w = twiddle(1.0, k as u64, 2 * half as u64);
            output[row * out_cols + k] = (a + b) + i * w * (a - b);
        }
    }
}

fn transpose(input: &[C64], output: &mut [C64], params: &PassParams) {
    let rows = params.in_rows as usize;
    let cols = params.in_cols as usize;
    let comps = params.components as usize;
    for r in 0..rows {
        for col in 0..cols {
            for c in 0..comps {
                output[(col * rows + r) * comps + c] = input[(r * cols + col) * comps + c];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{read_f32, write_f32};

    fn params(length: u32, radix: u32, stride: u32) -> PassParams {
        PassParams {
            in_rows: 1,
            in_cols: length,
            out_rows: 1,
            out_cols: length,
            length,
            stride,
            radix,
            components: 1,
            scale: 1.0,
            sign: -1.0,
            convolve: 0,
            _padding: 0,
        }
    }

    #[test]
    fn test_single_stage_is_dft() {
        let input: Vec<C64> = (0..8).map(|i| C64::new(i as f64, 0.0)).collect();
        let mut output = vec![C64::new(0.0, 0.0); 8];
        radix_stage(&input, &mut output, &params(8, 8, 1), Axis::Horizontal);
        // DC bin is the sum of the inputs.
        assert!((output[0].re - 28.0).abs() < 1e-9);
        assert!(output[0].im.abs() < 1e-9);
        // Bin 4 alternates signs.
        assert!((output[4].re + 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_stages_match_one() {
        let input: Vec<C64> = (0..16)
            .map(|i| C64::new((i as f64 * 0.7).sin(), (i as f64 * 0.3).cos()))
            .collect();
        let mut direct = vec![C64::new(0.0, 0.0); 16];
        radix_stage(&input, &mut direct, &params(16, 16, 1), Axis::Horizontal);

        let mut mid = vec![C64::new(0.0, 0.0); 16];
        let mut staged = vec![C64::new(0.0, 0.0); 16];
        radix_stage(&input, &mut mid, &params(16, 4, 1), Axis::Horizontal);
        radix_stage(&mid, &mut staged, &params(16, 4, 4), Axis::Horizontal);

        for (a, b) in direct.iter().zip(&staged) {
            assert!((a - b).norm() < 1e-9);
        }
    }

    #[test]
    fn test_buffer_roundtrip_and_release() {
        let backend = CpuBackend::new();
        let buffer = Resource::Buffer(backend.allocate_buffer(16).unwrap());
        write_f32(&backend, buffer, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(read_f32(&backend, buffer).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

        let too_much = write_f32(&backend, buffer, &[0.0; 5]);
        assert!(matches!(too_much, Err(BackendError::ResourceTooSmall { .. })));

        backend.release_resource(buffer);
        assert_eq!(
            backend.read_buffer(buffer),
            Err(BackendError::UnknownResource(buffer))
        );
    }

    fn copy_key(precision: Precision, width: u32) -> ProgramKey {
        ProgramKey {
            kernel: KernelKind::Copy,
            axis: Axis::Horizontal,
            direction: crate::shape::Direction::Forward,
            transform_type: crate::shape::TransformType::ComplexToComplex,
            precision,
            workgroup: crate::radix::WorkGroupSize::new(width, 1, 1),
            lanes: 1,
            input_target: crate::shape::Target::Buffer,
            output_target: crate::shape::Target::Buffer,
            first_stage: false,
            normalize: false,
            target_profile: "cpu-reference".to_string(),
        }
    }

    #[test]
    fn test_rejects_half_precision() {
        let backend = CpuBackend::new();
        let key = copy_key(Precision::Half, 1);
        assert!(matches!(backend.compile(&key), Err(BackendError::Compile(_))));
        assert_eq!(backend.compile_count(), 0);
    }

    #[test]
    fn test_copy_takes_output_sized_prefix() {
        let backend = CpuBackend::new();
        let program = backend.compile(&copy_key(Precision::Single, 2)).unwrap();
        let input = Resource::Buffer(backend.allocate_buffer(32).unwrap());
        let output = Resource::Buffer(backend.allocate_buffer(16).unwrap());
        write_f32(&backend, input, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]).unwrap();

        let mut copy = params(2, 1, 1);
        copy.in_cols = 4;
        let resources = BoundResources {
            input,
            aux: None,
            output,
        };
        backend.dispatch(program, [1, 1, 1], &copy, &resources).unwrap();
        assert_eq!(read_f32(&backend, output).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_allocation_limit() {
        let backend = CpuBackend::new().with_allocation_limit(64);
        assert!(backend.allocate_buffer(64).is_ok());
        assert_eq!(
            backend.allocate_buffer(65),
            Err(BackendError::ResourceTooLarge {
                requested: 65,
                limit: 64
            })
        );
        assert!(matches!(
            backend.allocate_texture(4, 4, TextureFormat::Rg32Float),
            Err(BackendError::ResourceTooLarge { requested: 128, .. })
        ));
    }
}
