//! Planner configuration.
//!
//! All knobs that shape planning decisions without being part of the
//! transform itself: cost weights, work-group defaults, fusion limits and
//! benchmark parameters. Every section has conservative defaults and can be
//! loaded from JSON with missing fields falling back to those defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Errors that can occur while loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Weights of the static cost model.
///
/// The values are hardware dependent; the defaults only keep the intended
/// ranking: pass count dominates, shared-memory traffic and register
/// pressure separate chains with equal pass counts, fusion earns a bonus
/// smaller than the pass it removes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostWeights {
    /// Cost of one dispatch.
    pub pass: f64,
    /// Cost per shared-memory element touched by a pass.
    pub shared_traffic: f64,
    /// Cost per fused radix stage held in registers.
    pub register_pressure: f64,
    /// Bonus for each pair of radices merged into one pass.
    pub fusion_bonus: f64,
    /// Extra cost of a vertical (column-strided) pass.
    pub strided_access: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            pass: 1.0,
            shared_traffic: 1.0 / 16384.0,
            register_pressure: 0.05,
            fusion_bonus: 0.25,
            strided_access: 0.0625,
        }
    }
}

/// Default work-group shape and vector width of radix passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceOptions {
    /// Work-group size in X before shared-memory reduction.
    pub workgroup_size_x: u32,
    /// Work-group size in Y before shared-memory reduction.
    pub workgroup_size_y: u32,
    /// Complex elements processed side by side per invocation.
    pub lanes: u32,
}

impl Default for PerformanceOptions {
    fn default() -> Self {
        Self {
            workgroup_size_x: 4,
            workgroup_size_y: 1,
            lanes: 1,
        }
    }
}

const TUNING_WORKGROUP_X: [u32; 7] = [4, 8, 16, 32, 64, 128, 256];
const TUNING_WORKGROUP_Y: [u32; 4] = [1, 2, 4, 8];
const TUNING_LANES: [u32; 3] = [1, 2, 4];

impl PerformanceOptions {
    /// Options tried when tuning a pass, limited to `max_invocations` per group.
    pub fn tuning_candidates(max_invocations: u32) -> Vec<PerformanceOptions> {
        let mut candidates = Vec::new();
        for lanes in TUNING_LANES {
            for workgroup_size_y in TUNING_WORKGROUP_Y {
                for workgroup_size_x in TUNING_WORKGROUP_X {
                    if workgroup_size_x * workgroup_size_y > max_invocations {
                        continue;
                    }
                    candidates.push(PerformanceOptions {
                        workgroup_size_x,
                        workgroup_size_y,
                        lanes,
                    });
                }
            }
        }
        candidates
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workgroup_size_x == 0 || self.workgroup_size_y == 0 {
            return Err(ConfigError::Invalid(
                "work-group sizes must be non-zero".to_string(),
            ));
        }
        if self.lanes == 0 {
            return Err(ConfigError::Invalid("lanes must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Limits on merging adjacent radix stages into one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionOptions {
    pub enabled: bool,
    /// Largest radix considered "small" enough to fuse.
    pub max_fusable_radix: u32,
    /// Largest radix a fused pass may reach.
    pub max_fused_radix: u32,
}

impl Default for FusionOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_fusable_radix: 8,
            max_fused_radix: 64,
        }
    }
}

/// Parameters of live benchmarking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkOptions {
    pub warmup_iterations: u32,
    pub iterations: u32,
    /// Per-candidate time budget in milliseconds.
    pub timeout_ms: u64,
    /// Best-ranked chains per axis that get benchmarked.
    pub max_candidates: usize,
    /// Search per-pass work-group shapes and lanes once the chains are chosen.
    pub tune_performance: bool,
}

impl Default for BenchmarkOptions {
    fn default() -> Self {
        Self {
            warmup_iterations: 2,
            iterations: 8,
            timeout_ms: 500,
            max_candidates: 4,
            tune_performance: false,
        }
    }
}

impl BenchmarkOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Complete planner configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub cost: CostWeights,
    pub performance: PerformanceOptions,
    pub fusion: FusionOptions,
    pub benchmark: BenchmarkOptions,
    /// Apply the 1/N normalization factor on the last pass.
    pub normalize: bool,
}

impl PlannerConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: PlannerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.performance.validate()?;
        if self.benchmark.iterations == 0 || self.benchmark.max_candidates == 0 {
            return Err(ConfigError::Invalid(
                "benchmark iterations and candidates must be non-zero".to_string(),
            ));
        }
        let weights = [
            self.cost.pass,
            self.cost.shared_traffic,
            self.cost.register_pressure,
            self.cost.fusion_bonus,
            self.cost.strided_access,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Invalid(
                "cost weights must be finite and non-negative".to_string(),
            ));
        }
        Ok(())
    }
}
