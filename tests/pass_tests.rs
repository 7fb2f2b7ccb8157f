//! Integration tests for pass list construction.

use gpufft::cache::KernelKind;
use gpufft::config::{CostWeights, PerformanceOptions, PlannerConfig};
use gpufft::passes::{AxisChains, Extent, IncompatibleChainError, PassBuilder, PassKind, ResourceRole};
use gpufft::radix::{Constraints, RadixChain};
use gpufft::shape::{Axis, Direction, Target, TransformShape, TransformType};

fn chain(length: u32, radices: &[u32]) -> RadixChain {
    RadixChain::for_length(length, radices).unwrap()
}

fn builder(config: &PlannerConfig, radices: &[u32]) -> PassBuilder {
    PassBuilder::new(config, Constraints::default().with_radices(radices), "cpu-reference")
}

#[test]
fn test_1024_coverage_with_small_radices() {
    let config = PlannerConfig::default();
    let shape = TransformShape::new_1d(1024);
    let plan = builder(&config, &[4, 8, 16])
        .build(&AxisChains::one_d(chain(1024, &[16, 16, 4])), &shape)
        .unwrap();

    assert_eq!(plan.pass_count(), 3);
    for pass in plan.passes() {
        assert_eq!(pass.covered_elements(), 1024);
        assert_eq!(pass.dest, Extent::new(1, 1024));
        assert_eq!(pass.length(), 1024);
    }
    assert_eq!(plan.output_extent().elements(), 1024);
    assert_eq!(plan.passes().last().unwrap().output.role, ResourceRole::Output);
    assert_eq!(plan.buffers().output.bytes, 1024 * 8);
}

#[test]
fn test_disallowed_radix_is_rejected() {
    let config = PlannerConfig::default();
    let shape = TransformShape::new_1d(1024);
    let result = builder(&config, &[4, 8, 16]).build(&AxisChains::one_d(chain(1024, &[64, 16])), &shape);
    assert!(result.is_err());
}

#[test]
fn test_2d_forward_runs_rows_then_columns() {
    let config = PlannerConfig::default();
    let shape = TransformShape::new_2d(64, 32);
    let plan = builder(&config, &[4, 8, 16, 64])
        .build(&AxisChains::new(chain(64, &[64]), chain(32, &[8, 4])), &shape)
        .unwrap();

    let axes: Vec<Axis> = plan.passes().iter().map(|p| p.axis).collect();
    assert_eq!(axes, vec![Axis::Horizontal, Axis::Vertical]);
    assert!(plan.passes()[1].is_fused());
    assert_eq!(plan.passes()[1].length(), 32);
    assert!(!plan.is_transposed());
    assert!(plan
        .passes()
        .iter()
        .all(|p| p.covered_elements() == 64 * 32));
}

#[test]
fn test_2d_inverse_runs_columns_first() {
    let config = PlannerConfig::default();
    let shape = TransformShape::new_2d(64, 32).with_direction(Direction::Inverse);
    let plan = builder(&config, &[4, 8, 16, 64])
        .build(&AxisChains::new(chain(64, &[16, 4]), chain(32, &[8, 4])), &shape)
        .unwrap();
    assert_eq!(plan.passes()[0].axis, Axis::Vertical);
    assert_eq!(plan.passes().last().unwrap().axis, Axis::Horizontal);
}

#[test]
fn test_expensive_strides_transpose_columns() {
    let config = PlannerConfig {
        cost: CostWeights {
            strided_access: 10.0,
            ..CostWeights::default()
        },
        ..PlannerConfig::default()
    };
    let shape = TransformShape::new_2d(16, 64);
    let plan = builder(&config, &[4, 8, 16, 64])
        .build(&AxisChains::new(chain(16, &[16]), chain(64, &[64])), &shape)
        .unwrap();

    assert!(plan.is_transposed());
    let kinds: Vec<KernelKind> = plan.passes().iter().map(|p| p.program.kernel).collect();
    assert_eq!(
        kinds,
        vec![
            KernelKind::Radix(16),
            KernelKind::Transpose,
            KernelKind::Radix(64),
            KernelKind::Transpose
        ]
    );
    assert_eq!(plan.passes()[1].dest, Extent::new(16, 64));
    assert_eq!(plan.passes()[2].axis, Axis::Horizontal);
    assert_eq!(plan.passes()[2].length(), 64);
    assert_eq!(plan.output_extent(), Extent::new(64, 16));
    for pass in plan.passes() {
        assert_eq!(pass.covered_elements(), pass.dest.elements());
    }
}

#[test]
fn test_real_modes_never_transpose() {
    let config = PlannerConfig {
        cost: CostWeights {
            strided_access: 10.0,
            ..CostWeights::default()
        },
        ..PlannerConfig::default()
    };
    let shape = TransformShape::new_2d(32, 64).with_type(TransformType::RealToComplex);
    let plan = builder(&config, &[4, 8, 16, 64])
        .build(&AxisChains::new(chain(16, &[16]), chain(64, &[64])), &shape)
        .unwrap();
    assert!(!plan.is_transposed());
}

#[test]
fn test_complex_to_real_resolves_before_rows() {
    let config = PlannerConfig::default();
    let shape = TransformShape::new_2d(64, 16)
        .with_type(TransformType::ComplexToReal)
        .with_direction(Direction::Inverse);
    let plan = builder(&config, &[4, 8, 16, 64])
        .build(&AxisChains::new(chain(32, &[8, 4]), chain(16, &[16])), &shape)
        .unwrap();

    let kinds: Vec<KernelKind> = plan.passes().iter().map(|p| p.program.kernel).collect();
    assert_eq!(
        kinds,
        vec![
            KernelKind::Radix(16),
            KernelKind::ResolveComplexToReal,
            KernelKind::Radix(32)
        ]
    );
    assert_eq!(plan.passes()[0].dest, Extent::new(16, 33));
    assert_eq!(plan.passes()[1].source, Extent::new(16, 33));
    assert_eq!(plan.passes()[1].dest, Extent::new(16, 32));
    assert_eq!(plan.passes()[1].length(), 32);
    assert_eq!(plan.buffers().input.extent, Extent::new(16, 33));
    assert_eq!(plan.output_extent(), Extent::new(16, 32));
}

#[test]
fn test_texture_targets_are_recorded() {
    let config = PlannerConfig::default();
    let shape = TransformShape::new_1d(256).with_targets(Target::Texture, Target::Texture);
    let plan = builder(&config, &[4, 8, 16])
        .build(&AxisChains::one_d(chain(256, &[16, 16])), &shape)
        .unwrap();
    let first = &plan.passes()[0];
    let last = &plan.passes()[1];
    assert_eq!(first.input.target, Target::Texture);
    assert_eq!(first.output.target, Target::Buffer);
    assert_eq!(first.program.input_target, Target::Texture);
    assert_eq!(last.input.target, Target::Buffer);
    assert_eq!(last.output.target, Target::Texture);
    assert_ne!(first.program, last.program);
}

#[test]
fn test_first_stage_flag_follows_stride() {
    let config = PlannerConfig::default();
    let shape = TransformShape::new_1d(4096);
    let plan = builder(&config, &[4, 8, 16, 64])
        .build(&AxisChains::one_d(chain(4096, &[16, 16, 16])), &shape)
        .unwrap();
    let flags: Vec<bool> = plan.passes().iter().map(|p| p.program.first_stage).collect();
    assert_eq!(flags, vec![true, false, false]);
    assert!(matches!(
        plan.passes()[2].kind,
        PassKind::Radix { stride: 256, .. }
    ));
}

#[test]
fn test_lanes_only_where_they_divide() {
    let mut config = PlannerConfig::default();
    config.fusion.enabled = false;
    config.performance.lanes = 2;
    let shape = TransformShape::new_2d(64, 32);
    let plan = builder(&config, &[4, 8, 16])
        .build(
            &AxisChains::new(chain(64, &[8, 8]), chain(32, &[8, 4])),
            &shape,
        )
        .unwrap();
    for pass in plan.passes() {
        assert_eq!(pass.lanes, 2);
        assert_eq!(pass.program.lanes, 2);
        assert_eq!(pass.covered_elements(), 64 * 32);
    }

    config.performance.lanes = 4;
    let shape = TransformShape::new_1d(12);
    let plan = builder(&config, &[3, 4])
        .build(&AxisChains::one_d(chain(12, &[4, 3])), &shape)
        .unwrap();
    // Three radix-4 butterflies cannot be split four ways.
    let lanes: Vec<u32> = plan.passes().iter().map(|p| p.lanes).collect();
    assert_eq!(lanes, vec![1, 4]);
    for pass in plan.passes() {
        assert_eq!(pass.covered_elements(), 12);
    }
}

#[test]
fn test_per_pass_tuning() {
    let mut config = PlannerConfig::default();
    config.fusion.enabled = false;
    let shape = TransformShape::new_1d(1024);
    let builder = builder(&config, &[4, 8, 16]);
    let chains = AxisChains::one_d(chain(1024, &[16, 16, 4]));

    let wide = PerformanceOptions {
        workgroup_size_x: 64,
        workgroup_size_y: 1,
        lanes: 1,
    };
    let default = config.performance;
    let plan = builder
        .build_tuned(&chains, &shape, &[default, wide, default])
        .unwrap();
    assert_eq!(plan.tuning(), &[default, wide, default]);
    let untuned = builder.build(&chains, &shape).unwrap();
    assert!(untuned.tuning().is_empty());
    assert_eq!(plan.passes()[0].program, untuned.passes()[0].program);
    assert!(plan.passes()[1].workgroup.invocations() > untuned.passes()[1].workgroup.invocations());
    for pass in plan.passes() {
        assert_eq!(pass.covered_elements(), 1024);
    }

    let result = builder.build_tuned(&chains, &shape, &[wide]);
    assert_eq!(
        result,
        Err(IncompatibleChainError::TuningMismatch {
            passes: 3,
            options: 1
        })
    );
}
