//! Turns radix chains into pass lists.

use crate::cache::ProgramKey;
use crate::config::{PerformanceOptions, PlannerConfig};
use crate::radix::{Constraints, RadixChain, RadixFactorizer, StepFootprint, WorkGroupSize};
use crate::shape::{Axis, Direction, Target, TransformShape, TransformType};

use super::{
    Binding, BufferRequirements, Extent, IncompatibleChainError, Pass, PassKind, Plan,
    ResolveMode, ResourceRole, ResourceSize,
};

/// Radix chains for both axes of a shape.
///
/// One-dimensional shapes use an empty vertical chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AxisChains {
    pub horizontal: RadixChain,
    pub vertical: RadixChain,
}

impl AxisChains {
    pub fn new(horizontal: RadixChain, vertical: RadixChain) -> Self {
        Self {
            horizontal,
            vertical,
        }
    }

    pub fn one_d(horizontal: RadixChain) -> Self {
        Self {
            horizontal,
            vertical: RadixChain::default(),
        }
    }
}

struct Draft {
    kind: PassKind,
    axis: Axis,
    source: Extent,
    dest: Extent,
}

/// Builds plans for one set of constraints and one device profile.
#[derive(Debug, Clone)]
pub struct PassBuilder {
    factorizer: RadixFactorizer,
    constraints: Constraints,
    target_profile: String,
    normalize: bool,
}

impl PassBuilder {
    pub fn new(
        config: &PlannerConfig,
        constraints: Constraints,
        target_profile: impl Into<String>,
    ) -> Self {
        Self {
            factorizer: RadixFactorizer::new(config),
            constraints,
            target_profile: target_profile.into(),
            normalize: config.normalize,
        }
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn factorizer(&self) -> &RadixFactorizer {
        &self.factorizer
    }

    /// Materialize the pass list for `chains` on `shape`.
    ///
    /// Forward transforms run the horizontal axis first, inverse transforms
    /// the vertical axis first. Real transforms resolve between the axes.
    pub fn build(
        &self,
        chains: &AxisChains,
        shape: &TransformShape,
    ) -> Result<Plan, IncompatibleChainError> {
        self.build_tuned(chains, shape, &[])
    }

    /// Like [`PassBuilder::build`], with performance options chosen per pass.
    ///
    /// `tuning` is either empty or holds one entry per pass of the plan.
    pub fn build_tuned(
        &self,
        chains: &AxisChains,
        shape: &TransformShape,
        tuning: &[PerformanceOptions],
    ) -> Result<Plan, IncompatibleChainError> {
        check_length(Axis::Horizontal, &chains.horizontal, shape.complex_width())?;
        check_length(Axis::Vertical, &chains.vertical, shape.rows())?;
        let h_groups = self.groups(Axis::Horizontal, &chains.horizontal)?;
        let v_groups = self.groups(Axis::Vertical, &chains.vertical)?;

        let packed = Extent::new(shape.rows(), shape.complex_width());
        let spectrum = Extent::new(shape.rows(), shape.spectrum_width());
        let transposed = self.should_transpose(shape, v_groups.len());
        let resolve = match shape.transform_type() {
            TransformType::RealToComplex => Some(ResolveMode::RealToComplex),
            TransformType::ComplexToReal => Some(ResolveMode::ComplexToReal),
            _ => None,
        };

        let mut drafts = Vec::new();
        if shape.direction().is_inverse() {
            push_vertical(&mut drafts, &v_groups, spectrum, transposed);
            if let Some(mode) = resolve {
                drafts.push(Draft {
                    kind: PassKind::Resolve(mode),
                    axis: Axis::Horizontal,
                    source: spectrum,
                    dest: packed,
                });
            }
            push_axis(&mut drafts, Axis::Horizontal, &h_groups, packed);
        } else {
            push_axis(&mut drafts, Axis::Horizontal, &h_groups, packed);
            if let Some(mode) = resolve {
                drafts.push(Draft {
                    kind: PassKind::Resolve(mode),
                    axis: Axis::Horizontal,
                    source: packed,
                    dest: spectrum,
                });
            }
            push_vertical(&mut drafts, &v_groups, spectrum, transposed);
        }
        if drafts.is_empty() {
            drafts.push(Draft {
                kind: PassKind::Copy,
                axis: Axis::Horizontal,
                source: packed,
                dest: packed,
            });
        }

        if !tuning.is_empty() && tuning.len() != drafts.len() {
            return Err(IncompatibleChainError::TuningMismatch {
                passes: drafts.len(),
                options: tuning.len(),
            });
        }
        for (draft, perf) in drafts.iter().zip(tuning) {
            if let PassKind::Radix { radices, .. } = &draft.kind {
                let radix: u32 = radices.iter().product();
                if !StepFootprint::for_radix(radix, perf).fits(&self.constraints) {
                    return Err(IncompatibleChainError::InfeasibleStep {
                        axis: draft.axis,
                        radix,
                    });
                }
            }
        }

        let passes = self.finalize(drafts, shape, tuning);
        let buffers = requirements(&passes, shape);

        let weights = self.factorizer.weights();
        let mut estimated_cost = self
            .factorizer
            .estimate(shape.complex_width(), &chains.horizontal.radices(), &self.constraints)
            .total
            + self
                .factorizer
                .estimate(shape.rows(), &chains.vertical.radices(), &self.constraints)
                .total;
        if transposed {
            estimated_cost += 2.0 * weights.pass;
        } else {
            estimated_cost += weights.strided_access * v_groups.len() as f64;
        }
        if resolve.is_some() {
            estimated_cost += weights.pass;
        }

        log::debug!(
            "Built {} passes for {}x{} {:?} (horizontal {:?}, vertical {:?}{})",
            passes.len(),
            shape.width(),
            shape.rows(),
            shape.direction(),
            chains.horizontal.radices(),
            chains.vertical.radices(),
            if transposed { ", transposed" } else { "" }
        );

        Ok(Plan {
            shape: *shape,
            chains: chains.clone(),
            passes,
            buffers,
            estimated_cost,
            transposed,
            tuning: tuning.to_vec(),
        })
    }

    /// Fused pass groups of a chain, rejecting steps the hardware cannot run.
    fn groups(&self, axis: Axis, chain: &RadixChain) -> Result<Vec<Vec<u32>>, IncompatibleChainError> {
        let radices = chain.radices();
        if let Some(&radix) = radices
            .iter()
            .find(|r| !self.constraints.allowed_radices.contains(r))
        {
            return Err(IncompatibleChainError::DisallowedRadix { axis, radix });
        }
        let groups = self.factorizer.groups(&radices, &self.constraints);
        for group in &groups {
            let radix: u32 = group.iter().product();
            if !StepFootprint::for_radix(radix, self.factorizer.performance()).fits(&self.constraints) {
                return Err(IncompatibleChainError::InfeasibleStep { axis, radix });
            }
        }
        Ok(groups)
    }

    fn should_transpose(&self, shape: &TransformShape, vertical_passes: usize) -> bool {
        if shape.height().is_none() || shape.transform_type().is_real() || vertical_passes == 0 {
            return false;
        }
        let weights = self.factorizer.weights();
        weights.strided_access * vertical_passes as f64 > 2.0 * weights.pass
    }

    fn finalize(
        &self,
        drafts: Vec<Draft>,
        shape: &TransformShape,
        tuning: &[PerformanceOptions],
    ) -> Vec<Pass> {
        let count = drafts.len();
        let texture_output = shape.output_target() != Target::Buffer;
        let scale = if self.normalize {
            (1.0 / shape.sample_count() as f64) as f32
        } else {
            1.0
        };

        let mut previous_output = ResourceRole::Input;
        let mut passes = Vec::with_capacity(count);
        for (index, draft) in drafts.into_iter().enumerate() {
            let first = index == 0;
            let last = index + 1 == count;

            let direction = match shape.direction() {
                Direction::InverseConvolve if !first => Direction::Inverse,
                direction => direction,
            };
            let input = Binding {
                role: if first {
                    ResourceRole::Input
                } else {
                    previous_output
                },
                target: if first {
                    shape.input_target()
                } else {
                    Target::Buffer
                },
            };
            let output = Binding {
                role: output_role(count - 1 - index, texture_output),
                target: if last {
                    shape.output_target()
                } else {
                    Target::Buffer
                },
            };
            previous_output = output.role;

            let perf = tuning.get(index).unwrap_or(self.factorizer.performance());
            let (workgroup, lanes, dispatch) = self.geometry(&draft, perf);
            let program = ProgramKey {
                kernel: draft.kind.kernel(),
                axis: draft.axis,
                direction,
                transform_type: shape.transform_type(),
                precision: shape.precision(),
                workgroup,
                lanes,
                input_target: input.target,
                output_target: output.target,
                first_stage: matches!(draft.kind, PassKind::Radix { stride: 1, .. }),
                normalize: last && self.normalize,
                target_profile: self.target_profile.clone(),
            };

            passes.push(Pass {
                kind: draft.kind,
                axis: draft.axis,
                direction,
                input,
                output,
                reads_aux: direction == Direction::InverseConvolve,
                source: draft.source,
                dest: draft.dest,
                workgroup,
                lanes,
                dispatch,
                scale: if last { scale } else { 1.0 },
                barrier: !last,
                program,
            });
        }
        passes
    }

    /// Work-group size, lanes and dispatch counts of a draft pass.
    fn geometry(&self, draft: &Draft, perf: &PerformanceOptions) -> (WorkGroupSize, u32, [u32; 3]) {
        match &draft.kind {
            PassKind::Radix { radices, .. } => {
                let radix: u32 = radices.iter().product();
                let extent = draft.source;
                let (count_x, count_y, lanes) = match draft.axis {
                    Axis::Horizontal => {
                        let butterflies = extent.cols / radix;
                        let lanes = lanes_for(butterflies, perf.lanes);
                        (butterflies / lanes, extent.rows, lanes)
                    }
                    Axis::Vertical => {
                        let lanes = lanes_for(extent.cols, perf.lanes);
                        (extent.cols / lanes, extent.rows / radix, lanes)
                    }
                };
                let workgroup = WorkGroupSize::for_radix(radix, perf).fitted(count_x, count_y);
                (
                    workgroup,
                    lanes,
                    [count_x / workgroup.x, count_y / workgroup.y, 1],
                )
            }
            _ => {
                let dest = draft.dest;
                let workgroup = self.elementwise_workgroup(perf).fitted(dest.cols, dest.rows);
                (
                    workgroup,
                    1,
                    [dest.cols / workgroup.x, dest.rows / workgroup.y, 1],
                )
            }
        }
    }

    /// Work group of resolve, transpose and copy passes.
    fn elementwise_workgroup(&self, perf: &PerformanceOptions) -> WorkGroupSize {
        let max = self.constraints.max_work_group_invocations.max(1);
        let x = perf.workgroup_size_x.clamp(1, max);
        let y = perf.workgroup_size_y.clamp(1, (max / x).max(1));
        WorkGroupSize::new(x, y, 1)
    }
}

fn check_length(axis: Axis, chain: &RadixChain, expected: u32) -> Result<(), IncompatibleChainError> {
    let product = chain.product();
    if product != expected as u64 {
        return Err(IncompatibleChainError::LengthMismatch {
            axis,
            expected,
            product,
        });
    }
    Ok(())
}

fn push_axis(drafts: &mut Vec<Draft>, axis: Axis, groups: &[Vec<u32>], extent: Extent) {
    let mut stride = 1;
    for group in groups {
        drafts.push(Draft {
            kind: PassKind::Radix {
                radices: group.clone(),
                stride,
            },
            axis,
            source: extent,
            dest: extent,
        });
        stride *= group.iter().product::<u32>();
    }
}

/// Vertical passes, optionally run as rows of the transposed array.
fn push_vertical(drafts: &mut Vec<Draft>, groups: &[Vec<u32>], extent: Extent, transposed: bool) {
    if !transposed {
        push_axis(drafts, Axis::Vertical, groups, extent);
        return;
    }
    let flipped = extent.transposed();
    drafts.push(Draft {
        kind: PassKind::Transpose,
        axis: Axis::Horizontal,
        source: extent,
        dest: flipped,
    });
    push_axis(drafts, Axis::Horizontal, groups, flipped);
    drafts.push(Draft {
        kind: PassKind::Transpose,
        axis: Axis::Horizontal,
        source: flipped,
        dest: extent,
    });
}

fn lanes_for(count: u32, lanes: u32) -> u32 {
    if lanes > 1 && count % lanes == 0 {
        lanes
    } else {
        1
    }
}

/// Output role of the pass `distance` steps before the last one.
///
/// Roles alternate so no pass reads what it writes. A texture output can
/// only take the final write, so the second scratch buffer stands in.
fn output_role(distance: usize, texture_output: bool) -> ResourceRole {
    if distance == 0 {
        ResourceRole::Output
    } else if distance % 2 == 1 {
        ResourceRole::Scratch(0)
    } else if texture_output {
        ResourceRole::Scratch(1)
    } else {
        ResourceRole::Output
    }
}

fn requirements(passes: &[Pass], shape: &TransformShape) -> BufferRequirements {
    let element_bytes =
        shape.transform_type().components() as u64 * shape.precision().complex_bytes();
    let size = |extent: Extent| ResourceSize {
        extent,
        bytes: extent.elements() * element_bytes,
    };
    let largest = |role: ResourceRole| {
        passes
            .iter()
            .filter(|p| p.output.role == role)
            .map(|p| p.dest)
            .max_by_key(|e| e.elements())
            .map(size)
    };

    let input = passes
        .first()
        .map(|p| size(p.source))
        .unwrap_or(size(Extent::new(0, 0)));
    let aux = passes.first().filter(|p| p.reads_aux).map(|_| input);
    BufferRequirements {
        input,
        aux,
        output: largest(ResourceRole::Output).unwrap_or(input),
        scratch: [
            largest(ResourceRole::Scratch(0)),
            largest(ResourceRole::Scratch(1)),
        ],
    }
}
