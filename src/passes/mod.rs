//! Passes and plans.
//!
//! A [`Pass`] is one dispatch: a group of fused radix stages, a real/complex
//! resolve, a transpose or a copy. A [`Plan`] is the ordered pass list for a
//! shape together with the resource sizes needed to run it.

mod builder;

pub use builder::{AxisChains, PassBuilder};

use crate::cache::{KernelKind, ProgramKey};
use crate::config::PerformanceOptions;
use crate::radix::{RadixChain, WorkGroupSize};
use crate::shape::{Axis, Direction, Target, TransformShape};

/// A chain handed to the builder does not fit the shape or the hardware.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IncompatibleChainError {
    #[error("{axis:?} radix product {product} does not match axis length {expected}")]
    LengthMismatch {
        axis: Axis,
        expected: u32,
        product: u64,
    },
    #[error("{axis:?} chain uses radix {radix} outside the allowed set")]
    DisallowedRadix { axis: Axis, radix: u32 },
    #[error("{axis:?} pass of radix {radix} exceeds the hardware limits")]
    InfeasibleStep { axis: Axis, radix: u32 },
    #[error("{options} tuned performance options for a plan of {passes} passes")]
    TuningMismatch { passes: usize, options: usize },
}

/// Rows and columns of a two-dimensional element array.
///
/// One element holds `components` complex values (two for dual transforms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub rows: u32,
    pub cols: u32,
}

impl Extent {
    pub fn new(rows: u32, cols: u32) -> Self {
        Self { rows, cols }
    }

    pub fn elements(&self) -> u64 {
        self.rows as u64 * self.cols as u64
    }

    pub fn transposed(&self) -> Self {
        Self {
            rows: self.cols,
            cols: self.rows,
        }
    }
}

/// Which plan resource a pass binding refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceRole {
    Input,
    /// Second operand of a convolution.
    InputAux,
    Output,
    Scratch(u8),
}

/// Role and binding kind of a pass input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Binding {
    pub role: ResourceRole,
    pub target: Target,
}

/// Direction of a real/complex resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveMode {
    RealToComplex,
    ComplexToReal,
}

/// What a pass computes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PassKind {
    /// Radix stages executed in one dispatch. More than one radix means
    /// the stages are fused.
    Radix { radices: Vec<u32>, stride: u32 },
    Resolve(ResolveMode),
    Transpose,
    Copy,
}

impl PassKind {
    pub fn kernel(&self) -> KernelKind {
        match self {
            PassKind::Radix { radices, .. } => KernelKind::Radix(radices.iter().product()),
            PassKind::Resolve(ResolveMode::RealToComplex) => KernelKind::ResolveRealToComplex,
            PassKind::Resolve(ResolveMode::ComplexToReal) => KernelKind::ResolveComplexToReal,
            PassKind::Transpose => KernelKind::Transpose,
            PassKind::Copy => KernelKind::Copy,
        }
    }
}

/// One dispatch of a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Pass {
    pub kind: PassKind,
    /// Memory axis the pass walks along.
    pub axis: Axis,
    pub direction: Direction,
    pub input: Binding,
    pub output: Binding,
    /// Multiplies the input by [`ResourceRole::InputAux`] before transforming.
    pub reads_aux: bool,
    pub source: Extent,
    pub dest: Extent,
    pub workgroup: WorkGroupSize,
    /// Butterflies (or columns) handled per invocation.
    pub lanes: u32,
    pub dispatch: [u32; 3],
    /// Factor applied to every value written.
    pub scale: f32,
    /// Whether a memory barrier must follow the pass.
    pub barrier: bool,
    pub program: ProgramKey,
}

impl Pass {
    pub fn is_resolve(&self) -> bool {
        matches!(self.kind, PassKind::Resolve(_))
    }

    /// Combined radix of a radix pass.
    pub fn radix(&self) -> Option<u32> {
        match &self.kind {
            PassKind::Radix { radices, .. } => Some(radices.iter().product()),
            _ => None,
        }
    }

    /// Product of the radices executed before this pass on its axis.
    pub fn stride(&self) -> u32 {
        match &self.kind {
            PassKind::Radix { stride, .. } => *stride,
            _ => 1,
        }
    }

    pub fn is_fused(&self) -> bool {
        matches!(&self.kind, PassKind::Radix { radices, .. } if radices.len() > 1)
    }

    /// Transform length along the pass axis.
    pub fn length(&self) -> u32 {
        match (&self.kind, self.axis) {
            (PassKind::Resolve(_), _) => self.source.cols.min(self.dest.cols),
            (_, Axis::Horizontal) => self.source.cols,
            (_, Axis::Vertical) => self.source.rows,
        }
    }

    /// Elements written by the dispatch.
    pub fn covered_elements(&self) -> u64 {
        dispatch_coverage(
            self.program.kernel,
            self.workgroup,
            self.lanes,
            self.dispatch,
        )
    }
}

/// Elements a dispatch of `counts` work groups writes.
pub fn dispatch_coverage(
    kernel: KernelKind,
    workgroup: WorkGroupSize,
    lanes: u32,
    counts: [u32; 3],
) -> u64 {
    let x = counts[0] as u64 * workgroup.x as u64;
    let y = counts[1] as u64 * workgroup.y as u64;
    let z = counts[2] as u64;
    match kernel {
        KernelKind::Radix(radix) => x * lanes as u64 * y * z * radix as u64,
        _ => x * y * z,
    }
}

/// Size of one plan resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSize {
    pub extent: Extent,
    pub bytes: u64,
}

/// Resource sizes a plan needs at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequirements {
    pub input: ResourceSize,
    pub aux: Option<ResourceSize>,
    pub output: ResourceSize,
    pub scratch: [Option<ResourceSize>; 2],
}

/// Immutable pass list for one transform shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    shape: TransformShape,
    chains: AxisChains,
    passes: Vec<Pass>,
    buffers: BufferRequirements,
    estimated_cost: f64,
    transposed: bool,
    tuning: Vec<PerformanceOptions>,
}

impl Plan {
    pub fn shape(&self) -> &TransformShape {
        &self.shape
    }

    pub fn chains(&self) -> &AxisChains {
        &self.chains
    }

    pub fn horizontal(&self) -> &RadixChain {
        &self.chains.horizontal
    }

    pub fn vertical(&self) -> &RadixChain {
        &self.chains.vertical
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn buffers(&self) -> &BufferRequirements {
        &self.buffers
    }

    /// Static cost of the plan under the builder's weights.
    pub fn estimated_cost(&self) -> f64 {
        self.estimated_cost
    }

    /// Whether the vertical axis runs between two transposes.
    pub fn is_transposed(&self) -> bool {
        self.transposed
    }

    /// Per-pass performance options, empty when every pass uses the defaults.
    pub fn tuning(&self) -> &[PerformanceOptions] {
        &self.tuning
    }

    /// Elements the final pass writes to the output.
    pub fn output_extent(&self) -> Extent {
        self.passes
            .last()
            .map(|p| p.dest)
            .unwrap_or(Extent::new(0, 0))
    }
}
