//! GPU FFT Planner
//!
//! Plans one- and two-dimensional FFTs for GPU execution as chains of
//! Stockham radix passes.
//!
//! # Features
//!
//! - Radix decomposition with a static cost model
//! - Pass sequences with ping-pong buffer roles, fused radices and real/complex resolves
//! - Shared, reference-counted cache of compiled programs
//! - Persisted wisdom of benchmarked decompositions and per-pass tuning
//! - wgpu compute backend and a CPU reference backend

pub mod backend;
pub mod cache;
pub mod config;
pub mod gpu;
pub mod passes;
pub mod planner;
pub mod radix;
pub mod shape;
pub mod wisdom;

// Re-export commonly used types
pub use backend::{BackendError, CpuBackend, ExecutionBackend, PlanResources, TargetProfile};
pub use cache::{ProgramCache, ProgramCacheEntry, ProgramCompileError, ProgramKey};
pub use config::{ConfigError, PlannerConfig};
pub use gpu::{GpuContext, GpuError, WgpuBackend};
pub use passes::{AxisChains, IncompatibleChainError, Pass, PassBuilder, PassKind, Plan};
pub use planner::{ExecutablePlan, PlanError, PlanPolicy, PlanSource, Planner};
pub use radix::{Constraints, Decomposition, DecompositionError, RadixChain, RadixFactorizer};
pub use shape::{Direction, Precision, Target, TransformShape, TransformType};
pub use wisdom::{ShapeKey, WisdomError, WisdomRecord, WisdomStore};
