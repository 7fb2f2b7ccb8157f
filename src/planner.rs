//! Plan requests.
//!
//! The [`Planner`] ties the components together: it factorizes both axes,
//! builds candidate plans, consults or fills the wisdom store, benchmarks
//! on the backend and hands back an [`ExecutablePlan`] whose programs are
//! held in the shared cache.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendError, ExecutionBackend, ProgramHandle};
use crate::cache::{ProgramCache, ProgramCacheEntry, ProgramCompileError};
use crate::config::{ConfigError, PerformanceOptions, PlannerConfig};
use crate::passes::{AxisChains, IncompatibleChainError, Pass, PassBuilder, Plan};
use crate::radix::{Constraints, DecompositionError, RadixChain, RadixFactorizer};
use crate::shape::{Precision, ShapeError, TransformShape};
use crate::wisdom::{ShapeKey, WisdomStore};

/// Errors returned by [`Planner::request_plan`].
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Invalid planner config: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid shape: {0}")]
    Shape(#[from] ShapeError),
    #[error("Decomposition failed: {0}")]
    Decomposition(#[from] DecompositionError),
    #[error("Incompatible chain: {0}")]
    IncompatibleChain(#[from] IncompatibleChainError),
    #[error(transparent)]
    Compile(#[from] ProgramCompileError),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("No wisdom recorded for {0:?}")]
    NoWisdom(ShapeKey),
    #[error("All {candidates} benchmark candidates timed out")]
    AllCandidatesTimedOut { candidates: usize },
    #[error("{target} has no half-precision support")]
    HalfPrecisionUnsupported { target: String },
}

/// How a plan request picks its decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanPolicy {
    /// Use recorded wisdom, benchmark when there is none.
    UseWisdomIfAvailable,
    /// Always benchmark, recording the winner.
    ForceBenchmark,
    /// Use recorded wisdom only, fail when there is none.
    StaticOnly,
    /// Take the cost model's favourite without touching the device clock.
    EstimateOnly,
}

/// Where the decomposition of a plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    Wisdom,
    Benchmark,
    Estimate,
}

/// A plan together with the cached programs of its passes.
///
/// Program references must be handed back with [`ExecutablePlan::release`].
#[derive(Debug)]
pub struct ExecutablePlan {
    plan: Plan,
    programs: Vec<ProgramCacheEntry>,
    source: PlanSource,
    measured: Option<Duration>,
}

impl ExecutablePlan {
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn source(&self) -> PlanSource {
        self.source
    }

    /// Benchmark time of the plan when it was chosen by measurement.
    pub fn measured(&self) -> Option<Duration> {
        self.measured
    }

    /// Passes paired with the programs that run them.
    pub fn steps(&self) -> impl Iterator<Item = (&Pass, ProgramHandle)> {
        self.plan
            .passes()
            .iter()
            .zip(self.programs.iter().map(|p| p.handle()))
    }

    pub fn programs(&self) -> &[ProgramCacheEntry] {
        &self.programs
    }

    /// Return every program reference to `cache`.
    pub fn release(self, cache: &ProgramCache) {
        for entry in self.programs {
            cache.release(entry);
        }
    }
}

/// Produces executable plans against one backend.
pub struct Planner {
    backend: Arc<dyn ExecutionBackend>,
    cache: Arc<ProgramCache>,
    wisdom: Arc<WisdomStore>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(backend: Arc<dyn ExecutionBackend>, config: PlannerConfig) -> Self {
        Self {
            cache: Arc::new(ProgramCache::new(backend.clone())),
            backend,
            wisdom: Arc::new(WisdomStore::new()),
            config,
        }
    }

    /// Use a shared wisdom store.
    pub fn with_wisdom(mut self, wisdom: Arc<WisdomStore>) -> Self {
        self.wisdom = wisdom;
        self
    }

    /// Use a shared program cache. It must wrap the same backend.
    pub fn with_cache(mut self, cache: Arc<ProgramCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<ProgramCache> {
        &self.cache
    }

    pub fn wisdom(&self) -> &Arc<WisdomStore> {
        &self.wisdom
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Constraints of the backend's device.
    pub fn constraints(&self) -> Constraints {
        Constraints::from_profile(self.backend.profile())
    }

    /// Wisdom key of `shape` on this backend.
    pub fn shape_key(&self, shape: &TransformShape) -> ShapeKey {
        ShapeKey::new(shape, &self.backend.profile().name)
    }

    /// Build an executable plan for `shape`.
    pub fn request_plan(
        &self,
        shape: &TransformShape,
        constraints: &Constraints,
        policy: PlanPolicy,
    ) -> Result<ExecutablePlan, PlanError> {
        self.config.validate()?;
        shape.validate()?;
        let profile = self.backend.profile();
        if shape.precision() == Precision::Half && !profile.supports_half {
            return Err(PlanError::HalfPrecisionUnsupported {
                target: profile.name.clone(),
            });
        }
        let builder = PassBuilder::new(
            &self.config,
            constraints.clone(),
            self.backend.profile().name.clone(),
        );
        let key = self.shape_key(shape);

        match policy {
            PlanPolicy::EstimateOnly => {
                let chains = self.estimate(shape, &builder)?;
                let plan = builder.build(&chains, shape)?;
                self.instantiate(plan, PlanSource::Estimate, None)
            }
            PlanPolicy::ForceBenchmark => self.benchmark(shape, &builder, key),
            PlanPolicy::UseWisdomIfAvailable | PlanPolicy::StaticOnly => {
                if let Some(plan) = self.wisdom_plan(shape, &builder, &key) {
                    return self.instantiate(plan, PlanSource::Wisdom, None);
                }
                if policy == PlanPolicy::StaticOnly {
                    return Err(PlanError::NoWisdom(key));
                }
                self.benchmark(shape, &builder, key)
            }
        }
    }

    /// Destroy programs no plan references any more.
    pub fn trim(&self) -> usize {
        self.cache.trim()
    }

    fn wisdom_plan(
        &self,
        shape: &TransformShape,
        builder: &PassBuilder,
        key: &ShapeKey,
    ) -> Option<Plan> {
        let record = self.wisdom.lookup(key)?;
        let chains = RadixChain::for_length(shape.complex_width(), &record.horizontal)
            .and_then(|h| {
                RadixChain::for_length(shape.rows(), &record.vertical)
                    .map(|v| AxisChains::new(h, v))
            });
        let built = match chains {
            Ok(chains) => builder
                .build_tuned(&chains, shape, &record.performance)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match built {
            Ok(plan) => {
                log::debug!("Using wisdom {:?} x {:?}", record.horizontal, record.vertical);
                Some(plan)
            }
            Err(reason) => {
                log::warn!("Ignoring stale wisdom for {:?}: {}", key, reason);
                None
            }
        }
    }

    fn estimate(
        &self,
        shape: &TransformShape,
        builder: &PassBuilder,
    ) -> Result<AxisChains, PlanError> {
        let factorizer = builder.factorizer();
        let constraints = builder.constraints();
        let best = |length: u32| -> Result<RadixChain, PlanError> {
            let decomposition = factorizer.enumerate(length, constraints)?;
            let best = decomposition.best().ok_or(DecompositionError::NoChain {
                length,
                radices: constraints.allowed_radices.clone(),
            })?;
            Ok(best.chain.clone())
        };
        Ok(AxisChains::new(
            best(shape.complex_width())?,
            best(shape.rows())?,
        ))
    }

    fn candidates(
        &self,
        factorizer: &RadixFactorizer,
        shape: &TransformShape,
        constraints: &Constraints,
    ) -> Result<Vec<AxisChains>, PlanError> {
        let limit = self.config.benchmark.max_candidates;
        let horizontal = factorizer.enumerate(shape.complex_width(), constraints)?;
        let vertical = factorizer.enumerate(shape.rows(), constraints)?;
        let horizontal: Vec<&RadixChain> =
            horizontal.ranked().into_iter().take(limit).map(|c| &c.chain).collect();
        let vertical: Vec<&RadixChain> =
            vertical.ranked().into_iter().take(limit).map(|c| &c.chain).collect();

        let mut candidates = Vec::with_capacity(horizontal.len() * vertical.len());
        for h in &horizontal {
            for v in &vertical {
                candidates.push(AxisChains::new((*h).clone(), (*v).clone()));
            }
        }
        Ok(candidates)
    }

    fn benchmark(
        &self,
        shape: &TransformShape,
        builder: &PassBuilder,
        key: ShapeKey,
    ) -> Result<ExecutablePlan, PlanError> {
        let candidates = self.candidates(builder.factorizer(), shape, builder.constraints())?;
        log::info!(
            "Benchmarking {} candidates for {}x{} {}",
            candidates.len(),
            shape.width(),
            shape.rows(),
            shape.direction().name()
        );

        let mut best: Option<(Duration, ExecutablePlan)> = None;
        let mut timeouts = 0;
        for chains in &candidates {
            let executable = match builder
                .build(chains, shape)
                .map_err(PlanError::from)
                .and_then(|plan| self.instantiate(plan, PlanSource::Benchmark, None))
            {
                Ok(executable) => executable,
                Err(e) => {
                    if let Some((_, previous)) = best.take() {
                        previous.release(&self.cache);
                    }
                    return Err(e);
                }
            };
            match self.backend.benchmark(&executable, &self.config.benchmark) {
                Ok(elapsed) => {
                    log::debug!(
                        "{:?} x {:?}: {:?}",
                        chains.horizontal.radices(),
                        chains.vertical.radices(),
                        elapsed
                    );
                    let better = best.as_ref().map_or(true, |(time, _)| elapsed < *time);
                    if better {
                        if let Some((_, previous)) = best.replace((elapsed, executable)) {
                            previous.release(&self.cache);
                        }
                    } else {
                        executable.release(&self.cache);
                    }
                }
                Err(BackendError::Timeout(budget)) => {
                    log::warn!(
                        "{:?} x {:?} exceeded {:?}",
                        chains.horizontal.radices(),
                        chains.vertical.radices(),
                        budget
                    );
                    timeouts += 1;
                    executable.release(&self.cache);
                }
                Err(e) => {
                    executable.release(&self.cache);
                    if let Some((_, previous)) = best.take() {
                        previous.release(&self.cache);
                    }
                    return Err(e.into());
                }
            }
        }

        let (elapsed, winner) =
            best.ok_or(PlanError::AllCandidatesTimedOut { candidates: timeouts })?;
        let (elapsed, mut winner) = if self.config.benchmark.tune_performance {
            self.tune(shape, builder, elapsed, winner)?
        } else {
            (elapsed, winner)
        };
        let plan = winner.plan();
        self.wisdom.record_tuned(
            key,
            plan.chains(),
            plan.tuning().to_vec(),
            elapsed.as_secs_f64() * 1e6,
            plan.pass_count() as u32,
        );
        log::info!(
            "Chose {:?} x {:?} ({} passes, {:?})",
            plan.horizontal().radices(),
            plan.vertical().radices(),
            plan.pass_count(),
            elapsed
        );
        winner.measured = Some(elapsed);
        Ok(winner)
    }

    /// Search performance options one pass at a time, keeping the chains of
    /// `winner` fixed. A change is kept only when it measures faster.
    fn tune(
        &self,
        shape: &TransformShape,
        builder: &PassBuilder,
        elapsed: Duration,
        winner: ExecutablePlan,
    ) -> Result<(Duration, ExecutablePlan), PlanError> {
        let chains = winner.plan().chains().clone();
        let options = PerformanceOptions::tuning_candidates(
            builder.constraints().max_work_group_invocations,
        );
        let mut tuning = vec![*builder.factorizer().performance(); winner.plan().pass_count()];
        let mut best = (elapsed, winner);

        for index in 0..tuning.len() {
            for option in &options {
                if *option == tuning[index] {
                    continue;
                }
                let mut trial = tuning.clone();
                trial[index] = *option;
                let plan = match builder.build_tuned(&chains, shape, &trial) {
                    Ok(plan) => plan,
                    Err(_) => continue,
                };
                // Options that fit to the same program give the same timing.
                if plan.passes()[index].program == best.1.plan().passes()[index].program {
                    continue;
                }
                let executable = match self.instantiate(plan, PlanSource::Benchmark, None) {
                    Ok(executable) => executable,
                    Err(e) => {
                        best.1.release(&self.cache);
                        return Err(e);
                    }
                };
                match self.backend.benchmark(&executable, &self.config.benchmark) {
                    Ok(time) if time < best.0 => {
                        log::debug!("Pass {} tuned to {:?}: {:?}", index, option, time);
                        tuning = trial;
                        let (_, previous) = std::mem::replace(&mut best, (time, executable));
                        previous.release(&self.cache);
                    }
                    Ok(_) | Err(BackendError::Timeout(_)) => executable.release(&self.cache),
                    Err(e) => {
                        executable.release(&self.cache);
                        best.1.release(&self.cache);
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(best)
    }

    /// Acquire a program for every pass of `plan`.
    fn instantiate(
        &self,
        plan: Plan,
        source: PlanSource,
        measured: Option<Duration>,
    ) -> Result<ExecutablePlan, PlanError> {
        let mut programs = Vec::with_capacity(plan.pass_count());
        for pass in plan.passes() {
            match self.cache.acquire(&pass.program) {
                Ok(entry) => programs.push(entry),
                Err(e) => {
                    for entry in programs {
                        self.cache.release(entry);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(ExecutablePlan {
            plan,
            programs,
            source,
            measured,
        })
    }
}
