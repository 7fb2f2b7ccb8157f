//! Per-pass uniform block.
//!
//! The layout must match the `Params` struct of the generated WGSL,
//! including alignment: twelve 4-byte fields, 48 bytes total.

use crate::passes::Pass;

/// Runtime parameters of one dispatch.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PassParams {
    pub in_rows: u32,
    pub in_cols: u32,
    pub out_rows: u32,
    pub out_cols: u32,
    /// Transform length along the pass axis.
    pub length: u32,
    /// Product of the radices already applied on the axis.
    pub stride: u32,
    pub radix: u32,
    /// Complex values per element.
    pub components: u32,
    pub scale: f32,
    /// Exponent sign of the twiddle factors: -1 forward, +1 inverse.
    pub sign: f32,
    pub convolve: u32,
    pub _padding: u32,
}

impl PassParams {
    pub fn for_pass(pass: &Pass) -> Self {
        Self {
            in_rows: pass.source.rows,
            in_cols: pass.source.cols,
            out_rows: pass.dest.rows,
            out_cols: pass.dest.cols,
            length: pass.length(),
            stride: pass.stride(),
            radix: pass.radix().unwrap_or(1),
            components: pass.program.transform_type.components(),
            scale: pass.scale,
            sign: if pass.direction.is_inverse() { 1.0 } else { -1.0 },
            convolve: pass.reads_aux as u32,
            _padding: 0,
        }
    }

    /// Complex values in the input array.
    pub fn input_values(&self) -> usize {
        self.in_rows as usize * self.in_cols as usize * self.components as usize
    }

    /// Complex values in the output array.
    pub fn output_values(&self) -> usize {
        self.out_rows as usize * self.out_cols as usize * self.components as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_size() {
        assert_eq!(std::mem::size_of::<PassParams>(), 48);
    }
}
