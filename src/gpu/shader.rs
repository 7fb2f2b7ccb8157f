//! WGSL generation for pass programs.
//!
//! Every [`ProgramKey`] maps to one self-contained compute shader with a
//! `main` entry point. Dispatch-time values (extents, stride, scale) come
//! from the `Params` uniform; everything in the key is baked in as
//! constants.

use crate::cache::{KernelKind, ProgramKey};
use crate::shape::{Axis, Direction, Precision};

/// Entry point of every generated shader.
pub const ENTRY_POINT: &str = "main";

/// Generate the shader source for `key`.
pub fn generate(key: &ProgramKey) -> String {
    let mut source = prelude(key);
    match key.kernel {
        KernelKind::Radix(radix) => source.push_str(&radix_kernel(key, radix)),
        KernelKind::ResolveRealToComplex => source.push_str(&resolve_kernel(key, true)),
        KernelKind::ResolveComplexToReal => source.push_str(&resolve_kernel(key, false)),
        KernelKind::Transpose => source.push_str(&elementwise_kernel(key, true)),
        KernelKind::Copy => source.push_str(&elementwise_kernel(key, false)),
    }
    source
}

fn prelude(key: &ProgramKey) -> String {
    let scalar = match key.precision {
        Precision::Half => "u32",
        Precision::Single => "f32",
    };
    let access = match key.precision {
        Precision::Half => {
            "fn read_src(i: u32) -> vec2<f32> { return unpack2x16float(src[i]); }\n\
             fn read_aux(i: u32) -> vec2<f32> { return unpack2x16float(aux[i]); }\n\
             fn write_dst(i: u32, v: vec2<f32>) { dst[i] = pack2x16float(v); }\n"
        }
        Precision::Single => {
            "fn read_src(i: u32) -> vec2<f32> { return vec2<f32>(src[2u * i], src[2u * i + 1u]); }\n\
             fn read_aux(i: u32) -> vec2<f32> { return vec2<f32>(aux[2u * i], aux[2u * i + 1u]); }\n\
             fn write_dst(i: u32, v: vec2<f32>) { dst[2u * i] = v.x; dst[2u * i + 1u] = v.y; }\n"
        }
    };
    let load = if key.direction == Direction::InverseConvolve {
        "return cmul(read_src(i), read_aux(i));"
    } else {
        "return read_src(i);"
    };
    let store = if key.normalize {
        "write_dst(i, v * params.scale);"
    } else {
        "write_dst(i, v);"
    };

    format!(
        "// {kernel:?} {axis:?} {direction} {mode:?} {precision:?}\n\
         struct Params {{\n\
         \x20   in_rows: u32,\n\
         \x20   in_cols: u32,\n\
         \x20   out_rows: u32,\n\
         \x20   out_cols: u32,\n\
         \x20   length: u32,\n\
         \x20   stride: u32,\n\
         \x20   radix: u32,\n\
         \x20   components: u32,\n\
         \x20   scale: f32,\n\
         \x20   sign: f32,\n\
         \x20   convolve: u32,\n\
         \x20   padding: u32,\n\
         }}\n\
         \n\
         @group(0) @binding(0) var<storage, read> src: array<{scalar}>;\n\
         @group(0) @binding(1) var<storage, read> aux: array<{scalar}>;\n\
         @group(0) @binding(2) var<storage, read_write> dst: array<{scalar}>;\n\
         @group(0) @binding(3) var<uniform> params: Params;\n\
         \n\
         const PI: f32 = 3.14159265358979;\n\
         const COMPONENTS: u32 = {components}u;\n\
         \n\
         fn cmul(a: vec2<f32>, b: vec2<f32>) -> vec2<f32> {{\n\
         \x20   return vec2<f32>(a.x * b.x - a.y * b.y, a.x * b.y + a.y * b.x);\n\
         }}\n\
         \n\
         fn conj(a: vec2<f32>) -> vec2<f32> {{\n\
         \x20   return vec2<f32>(a.x, -a.y);\n\
         }}\n\
         \n\
         fn twiddle(num: u32, den: u32) -> vec2<f32> {{\n\
         \x20   let angle = params.sign * 2.0 * PI * f32(num) / f32(den);\n\
         \x20   return vec2<f32>(cos(angle), sin(angle));\n\
         }}\n\
         \n\
         {access}\n\
         fn load(i: u32) -> vec2<f32> {{\n\
         \x20   {load}\n\
         }}\n\
         \n\
         fn store(i: u32, v: vec2<f32>) {{\n\
         \x20   {store}\n\
         }}\n\
         \n",
        kernel = key.kernel,
        axis = key.axis,
        direction = key.direction.name(),
        mode = key.transform_type,
        precision = key.precision,
        components = key.transform_type.components(),
    )
}

fn workgroup_attribute(key: &ProgramKey) -> String {
    format!(
        "@compute @workgroup_size({}, {}, {})",
        key.workgroup.x, key.workgroup.y, key.workgroup.z
    )
}

fn radix_kernel(key: &ProgramKey, radix: u32) -> String {
    let element = match key.axis {
        Axis::Horizontal => "(ln * params.in_cols + pos) * COMPONENTS + c",
        Axis::Vertical => "(pos * params.in_cols + ln) * COMPONENTS + c",
    };
    let gather = if key.first_stage {
        "v[m] = load(element(ln, i + m * span, c));"
    } else {
        "v[m] = cmul(load(element(ln, i + m * span, c)), twiddle(m * k, p * RADIX));"
    };
    let entry = match key.axis {
        Axis::Horizontal => {
            "if (gid.x * LANES >= span || gid.y >= params.in_rows || gid.z >= COOP) {\n\
             \x20       return;\n\
             \x20   }\n\
             \x20   for (var lane = 0u; lane < LANES; lane = lane + 1u) {\n\
             \x20       butterfly(gid.y, gid.x * LANES + lane, gid.z);\n\
             \x20   }"
        }
        Axis::Vertical => {
            "if (gid.x * LANES >= params.in_cols || gid.y >= span || gid.z >= COOP) {\n\
             \x20       return;\n\
             \x20   }\n\
             \x20   for (var lane = 0u; lane < LANES; lane = lane + 1u) {\n\
             \x20       butterfly(gid.x * LANES + lane, gid.y, gid.z);\n\
             \x20   }"
        }
    };

    format!(
        "const RADIX: u32 = {radix}u;\n\
         const COOP: u32 = {coop}u;\n\
         const LANES: u32 = {lanes}u;\n\
         \n\
         fn element(ln: u32, pos: u32, c: u32) -> u32 {{\n\
         \x20   return {element};\n\
         }}\n\
         \n\
         fn butterfly(ln: u32, i: u32, part: u32) {{\n\
         \x20   let span = params.length / RADIX;\n\
         \x20   let p = params.stride;\n\
         \x20   let k = i % p;\n\
         \x20   let base = (i - k) * RADIX + k;\n\
         \x20   let per_part = RADIX / COOP;\n\
         \x20   for (var c = 0u; c < COMPONENTS; c = c + 1u) {{\n\
         \x20       var v: array<vec2<f32>, RADIX>;\n\
         \x20       for (var m = 0u; m < RADIX; m = m + 1u) {{\n\
         \x20           {gather}\n\
         \x20       }}\n\
         \x20       for (var o = part * per_part; o < (part + 1u) * per_part; o = o + 1u) {{\n\
         \x20           var acc = vec2<f32>(0.0, 0.0);\n\
         \x20           for (var q = 0u; q < RADIX; q = q + 1u) {{\n\
         \x20               acc = acc + cmul(v[q], twiddle((q * o) % RADIX, RADIX));\n\
         \x20           }}\n\
         \x20           store(element(ln, base + o * p, c), acc);\n\
         \x20       }}\n\
         \x20   }}\n\
         }}\n\
         \n\
         {attribute}\n\
         fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{\n\
         \x20   let span = params.length / RADIX;\n\
         \x20   {entry}\n\
         }}\n",
        coop = key.workgroup.z,
        lanes = key.lanes,
        attribute = workgroup_attribute(key),
    )
}

fn resolve_kernel(key: &ProgramKey, to_complex: bool) -> String {
    let body = if to_complex {
        "if (gid.x > n || gid.y >= params.in_rows) {\n\
         \x20       return;\n\
         \x20   }\n\
         \x20   let a = load(row_in + k % n);\n\
         \x20   let b = conj(load(row_in + (n - k) % n));\n\
         \x20   let even = (a + b) * 0.5;\n\
         \x20   let d = (a - b) * 0.5;\n\
         \x20   let odd = vec2<f32>(d.y, -d.x);\n\
         \x20   store(gid.y * params.out_cols + k, even + cmul(twiddle(k, 2u * n), odd));"
    } else {
        "if (gid.x >= n || gid.y >= params.in_rows) {\n\
         \x20       return;\n\
         \x20   }\n\
         \x20   let a = load(row_in + k);\n\
         \x20   let b = conj(load(row_in + n - k));\n\
         \x20   let t = cmul(twiddle(k, 2u * n), a - b);\n\
         \x20   store(gid.y * params.out_cols + k, a + b + vec2<f32>(-t.y, t.x));"
    };
    format!(
        "{attribute}\n\
         fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{\n\
         \x20   let n = params.length;\n\
         \x20   let k = gid.x;\n\
         \x20   let row_in = gid.y * params.in_cols;\n\
         \x20   {body}\n\
         }}\n",
        attribute = workgroup_attribute(key),
    )
}

fn elementwise_kernel(key: &ProgramKey, transpose: bool) -> String {
    let source_element = if transpose {
        "gid.x * params.in_cols + gid.y"
    } else {
        "gid.y * params.in_cols + gid.x"
    };
    format!(
        "{attribute}\n\
         fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{\n\
         \x20   if (gid.x >= params.out_cols || gid.y >= params.out_rows) {{\n\
         \x20       return;\n\
         \x20   }}\n\
         \x20   let read_at = ({source_element}) * COMPONENTS;\n\
         \x20   let write_at = (gid.y * params.out_cols + gid.x) * COMPONENTS;\n\
         \x20   for (var c = 0u; c < COMPONENTS; c = c + 1u) {{\n\
         \x20       store(write_at + c, load(read_at + c));\n\
         \x20   }}\n\
         }}\n",
        attribute = workgroup_attribute(key),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radix::WorkGroupSize;
    use crate::shape::{Target, TransformType};

    fn key(kernel: KernelKind) -> ProgramKey {
        ProgramKey {
            kernel,
            axis: Axis::Horizontal,
            direction: Direction::Forward,
            transform_type: TransformType::ComplexToComplex,
            precision: Precision::Single,
            workgroup: WorkGroupSize::new(4, 1, 1),
            lanes: 1,
            input_target: Target::Buffer,
            output_target: Target::Buffer,
            first_stage: false,
            normalize: false,
            target_profile: "test".to_string(),
        }
    }

    #[test]
    fn test_radix_constants_baked_in() {
        let source = generate(&key(KernelKind::Radix(16)));
        assert!(source.contains("const RADIX: u32 = 16u;"));
        assert!(source.contains("@compute @workgroup_size(4, 1, 1)"));
        assert!(source.contains("twiddle(m * k, p * RADIX)"));
        assert!(source.contains("fn main("));
    }

    #[test]
    fn test_variants_change_source() {
        let plain = generate(&key(KernelKind::Radix(8)));
        let mut convolve = key(KernelKind::Radix(8));
        convolve.direction = Direction::InverseConvolve;
        let convolve = generate(&convolve);
        assert!(convolve.contains("cmul(read_src(i), read_aux(i))"));
        assert!(!plain.contains("cmul(read_src(i), read_aux(i))"));

        let mut half = key(KernelKind::Copy);
        half.precision = Precision::Half;
        assert!(generate(&half).contains("unpack2x16float"));

        let mut normalized = key(KernelKind::Transpose);
        normalized.normalize = true;
        assert!(generate(&normalized).contains("v * params.scale"));
    }
}
