//! Static cost model and stage fusion.

use std::cmp::Ordering;

use crate::config::{CostWeights, FusionOptions, PerformanceOptions};

use super::workgroup::StepFootprint;
use super::Constraints;

/// Scalar proxy for the GPU cost of a radix chain.
///
/// Only meaningful for ranking candidates against each other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimate {
    /// Weighted total used for ranking.
    pub total: f64,
    /// Dispatches after fusion.
    pub passes: u32,
    /// Shared-memory elements touched across all passes.
    pub shared_traffic: u64,
    /// Pairs of radices merged into one pass.
    pub fused_pairs: u32,
    /// Passes whose butterflies do not split evenly over work groups.
    pub imbalance: u32,
}

impl CostEstimate {
    /// Cost of a chain with no passes (length-1 axis).
    pub fn zero() -> Self {
        Self {
            total: 0.0,
            passes: 0,
            shared_traffic: 0,
            fused_pairs: 0,
            imbalance: 0,
        }
    }

    /// Order by total cost, then fewer passes, then better balance.
    pub fn rank(&self, other: &Self) -> Ordering {
        self.total
            .total_cmp(&other.total)
            .then(self.passes.cmp(&other.passes))
            .then(self.imbalance.cmp(&other.imbalance))
    }
}

/// Group adjacent radices that execute in one pass.
///
/// Two neighbouring small radices merge when the fused radix stays within
/// the fusion limit and still fits the hardware. Each group is one pass.
pub fn fuse_groups(
    radices: &[u32],
    perf: &PerformanceOptions,
    fusion: &FusionOptions,
    constraints: &Constraints,
) -> Vec<Vec<u32>> {
    let mut groups: Vec<Vec<u32>> = Vec::with_capacity(radices.len());
    for &radix in radices {
        if fusion.enabled {
            if let Some(last) = groups.last_mut() {
                let small = |r: u32| r <= fusion.max_fusable_radix;
                if last.len() == 1 && small(last[0]) && small(radix) {
                    let fused = last[0] * radix;
                    if fused <= fusion.max_fused_radix
                        && StepFootprint::for_radix(fused, perf).fits(constraints)
                    {
                        last.push(radix);
                        continue;
                    }
                }
            }
        }
        groups.push(vec![radix]);
    }
    groups
}

/// Estimate the cost of transforming `length` with `radices`.
pub fn estimate(
    length: u32,
    radices: &[u32],
    weights: &CostWeights,
    perf: &PerformanceOptions,
    fusion: &FusionOptions,
    constraints: &Constraints,
) -> CostEstimate {
    if radices.is_empty() {
        return CostEstimate::zero();
    }

    let groups = fuse_groups(radices, perf, fusion, constraints);
    let mut shared_traffic = 0u64;
    let mut fused_pairs = 0u32;
    let mut imbalance = 0u32;
    let mut register_pressure = 0.0f64;

    for group in &groups {
        let radix: u32 = group.iter().product();
        let footprint = StepFootprint::for_radix(radix, perf);
        shared_traffic += footprint.shared_elements;

        if group.len() > 1 {
            fused_pairs += 1;
            register_pressure += (radix as f64).log2();
        }

        let butterflies = length / radix;
        let per_group = (footprint.workgroup.x * perf.lanes).max(1);
        if butterflies % per_group != 0 {
            imbalance += 1;
        }
    }

    let passes = groups.len() as u32;
    let total = weights.pass * passes as f64
        + weights.shared_traffic * shared_traffic as f64
        + weights.register_pressure * register_pressure
        - weights.fusion_bonus * fused_pairs as f64;

    CostEstimate {
        total,
        passes,
        shared_traffic,
        fused_pairs,
        imbalance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> (CostWeights, PerformanceOptions, FusionOptions, Constraints) {
        (
            CostWeights::default(),
            PerformanceOptions::default(),
            FusionOptions::default(),
            Constraints::default(),
        )
    }

    #[test]
    fn test_fuse_small_neighbours() {
        let (_, perf, fusion, constraints) = defaults();
        let groups = fuse_groups(&[8, 8, 8, 4], &perf, &fusion, &constraints);
        assert_eq!(groups, vec![vec![8, 8], vec![8, 4]]);

        let groups = fuse_groups(&[64, 8, 4], &perf, &fusion, &constraints);
        assert_eq!(groups, vec![vec![64], vec![8, 4]]);
    }

    #[test]
    fn test_fusion_disabled() {
        let (_, perf, mut fusion, constraints) = defaults();
        fusion.enabled = false;
        let groups = fuse_groups(&[4, 4], &perf, &fusion, &constraints);
        assert_eq!(groups, vec![vec![4], vec![4]]);
    }

    #[test]
    fn test_fusion_respects_shared_memory() {
        let (_, perf, fusion, mut constraints) = defaults();
        // A fused radix-64 pass needs 64 shared elements with the defaults.
        constraints.max_shared_memory_elements = 32;
        let groups = fuse_groups(&[8, 8], &perf, &fusion, &constraints);
        assert_eq!(groups, vec![vec![8], vec![8]]);
    }

    #[test]
    fn test_fewer_passes_cost_less() {
        let (weights, perf, fusion, constraints) = defaults();
        let two = estimate(4096, &[64, 64], &weights, &perf, &fusion, &constraints);
        let six = estimate(
            4096,
            &[8, 8, 8, 8, 8, 4],
            &weights,
            &perf,
            &fusion,
            &constraints,
        );
        assert_eq!(two.passes, 2);
        assert_eq!(six.passes, 3);
        assert_eq!(six.fused_pairs, 3);
        assert!(two.total < six.total);
        assert_eq!(two.rank(&six), Ordering::Less);
    }

    #[test]
    fn test_empty_chain_is_free() {
        let (weights, perf, fusion, constraints) = defaults();
        let cost = estimate(1, &[], &weights, &perf, &fusion, &constraints);
        assert_eq!(cost, CostEstimate::zero());
    }
}
