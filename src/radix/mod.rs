//! Radix factorization of transform lengths.
//!
//! Given an axis length and the hardware constraints, the factorizer
//! enumerates every chain of allowed radices whose product is the length
//! and whose steps fit the hardware, tagging each chain with a static cost.

mod cost;
mod workgroup;

pub use cost::{estimate, fuse_groups, CostEstimate};
pub use workgroup::{cooperating_invocations, largest_divisor_at_most, StepFootprint, WorkGroupSize};

use crate::config::{CostWeights, FusionOptions, PerformanceOptions, PlannerConfig};

/// Radices the pass kernels implement.
pub const SUPPORTED_RADICES: [u32; 8] = [2, 3, 4, 5, 8, 16, 32, 64];

/// Errors raised when a length cannot be decomposed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecompositionError {
    #[error("Transform length must be positive")]
    ZeroLength,
    #[error("Allowed radix set is empty")]
    EmptyRadixSet,
    #[error("Radix {0} is not supported")]
    UnsupportedRadix(u32),
    #[error("No radix chain of {radices:?} decomposes length {length} within the constraints")]
    NoChain { length: u32, radices: Vec<u32> },
    #[error("Radix product {product} does not match length {length}")]
    ProductMismatch { length: u32, product: u64 },
}

/// Hardware limits a decomposition must respect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraints {
    pub allowed_radices: Vec<u32>,
    pub max_shared_memory_elements: u32,
    pub max_work_group_invocations: u32,
}

impl Default for Constraints {
    /// Limits every compute-capable GLES 3.1 device guarantees.
    fn default() -> Self {
        Self {
            allowed_radices: vec![4, 8, 16, 64],
            max_shared_memory_elements: 2048,
            max_work_group_invocations: 128,
        }
    }
}

impl Constraints {
    pub fn with_radices(mut self, radices: &[u32]) -> Self {
        self.allowed_radices = radices.to_vec();
        self
    }

    /// Allowed radices, deduplicated, largest first.
    pub fn sorted_radices(&self) -> Result<Vec<u32>, DecompositionError> {
        if self.allowed_radices.is_empty() {
            return Err(DecompositionError::EmptyRadixSet);
        }
        if let Some(&bad) = self
            .allowed_radices
            .iter()
            .find(|r| !SUPPORTED_RADICES.contains(r))
        {
            return Err(DecompositionError::UnsupportedRadix(bad));
        }
        let mut radices = self.allowed_radices.clone();
        radices.sort_unstable_by(|a, b| b.cmp(a));
        radices.dedup();
        Ok(radices)
    }
}

/// One stage of a radix chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RadixStep {
    pub radix: u32,
    /// Product of the radices before this step.
    pub stride: u32,
    pub first: bool,
    pub last: bool,
}

/// Ordered radix stages whose product is the axis length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RadixChain {
    steps: Vec<RadixStep>,
}

impl RadixChain {
    /// Build a chain, checking that the radices multiply to `length`.
    pub fn for_length(length: u32, radices: &[u32]) -> Result<Self, DecompositionError> {
        let product: u64 = radices.iter().map(|&r| r as u64).product();
        if product != length as u64 {
            return Err(DecompositionError::ProductMismatch { length, product });
        }
        Ok(Self::from_radices(radices))
    }

    fn from_radices(radices: &[u32]) -> Self {
        let mut stride = 1u32;
        let count = radices.len();
        let steps = radices
            .iter()
            .enumerate()
            .map(|(i, &radix)| {
                let step = RadixStep {
                    radix,
                    stride,
                    first: i == 0,
                    last: i + 1 == count,
                };
                stride *= radix;
                step
            })
            .collect();
        Self { steps }
    }

    pub fn steps(&self) -> &[RadixStep] {
        &self.steps
    }

    pub fn radices(&self) -> Vec<u32> {
        self.steps.iter().map(|s| s.radix).collect()
    }

    pub fn product(&self) -> u64 {
        self.steps.iter().map(|s| s.radix as u64).product()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A chain tagged with its cost estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChain {
    pub chain: RadixChain,
    pub cost: CostEstimate,
}

/// Every chain found for one length, in traversal order.
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub length: u32,
    pub candidates: Vec<ScoredChain>,
}

impl Decomposition {
    /// Candidates from best to worst. Equal costs keep traversal order.
    pub fn ranked(&self) -> Vec<&ScoredChain> {
        let mut ranked: Vec<&ScoredChain> = self.candidates.iter().collect();
        ranked.sort_by(|a, b| a.cost.rank(&b.cost));
        ranked
    }

    pub fn best(&self) -> Option<&ScoredChain> {
        self.ranked().into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Enumerates and scores radix chains.
#[derive(Debug, Clone, Default)]
pub struct RadixFactorizer {
    weights: CostWeights,
    performance: PerformanceOptions,
    fusion: FusionOptions,
}

impl RadixFactorizer {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            weights: config.cost.clone(),
            performance: config.performance,
            fusion: config.fusion,
        }
    }

    pub fn performance(&self) -> &PerformanceOptions {
        &self.performance
    }

    pub fn fusion(&self) -> &FusionOptions {
        &self.fusion
    }

    pub fn weights(&self) -> &CostWeights {
        &self.weights
    }

    /// Whether a single step of `radix` fits the hardware.
    pub fn is_feasible(&self, radix: u32, constraints: &Constraints) -> bool {
        StepFootprint::for_radix(radix, &self.performance).fits(constraints)
    }

    /// Enumerate every valid chain for `length`.
    ///
    /// Chains list radices largest first and are produced by a depth-first
    /// walk over the radix set in descending order, so the result is
    /// identical for identical inputs.
    pub fn enumerate(
        &self,
        length: u32,
        constraints: &Constraints,
    ) -> Result<Decomposition, DecompositionError> {
        if length == 0 {
            return Err(DecompositionError::ZeroLength);
        }
        let radices = constraints.sorted_radices()?;

        let feasible: Vec<u32> = radices
            .iter()
            .copied()
            .filter(|&r| self.is_feasible(r, constraints))
            .collect();

        let mut found = Vec::new();
        let mut prefix = Vec::new();
        search(length, &feasible, 0, &mut prefix, &mut found);

        if found.is_empty() {
            return Err(DecompositionError::NoChain { length, radices });
        }

        let candidates = found
            .into_iter()
            .map(|radices| {
                let cost = self.estimate(length, &radices, constraints);
                ScoredChain {
                    chain: RadixChain::from_radices(&radices),
                    cost,
                }
            })
            .collect::<Vec<_>>();

        log::debug!(
            "Length {}: {} radix chains, best {:?}",
            length,
            candidates.len(),
            candidates
                .iter()
                .min_by(|a, b| a.cost.rank(&b.cost))
                .map(|c| c.chain.radices())
        );

        Ok(Decomposition { length, candidates })
    }

    /// Cost of a chain under this factorizer's weights.
    pub fn estimate(&self, length: u32, radices: &[u32], constraints: &Constraints) -> CostEstimate {
        estimate(
            length,
            radices,
            &self.weights,
            &self.performance,
            &self.fusion,
            constraints,
        )
    }

    /// Pass grouping of a chain under this factorizer's fusion rules.
    pub fn groups(&self, radices: &[u32], constraints: &Constraints) -> Vec<Vec<u32>> {
        fuse_groups(radices, &self.performance, &self.fusion, constraints)
    }
}

fn search(
    remaining: u32,
    radices: &[u32],
    start: usize,
    prefix: &mut Vec<u32>,
    found: &mut Vec<Vec<u32>>,
) {
    if remaining == 1 {
        found.push(prefix.clone());
        return;
    }
    for (i, &radix) in radices.iter().enumerate().skip(start) {
        if remaining % radix != 0 {
            continue;
        }
        prefix.push(radix);
        search(remaining / radix, radices, i, prefix, found);
        prefix.pop();
    }
}
