//! Persisted best-known decompositions.
//!
//! The store maps a [`ShapeKey`] to the cheapest radix chains measured for
//! it, optionally with the per-pass performance options they were tuned
//! with. Records are only ever replaced by strictly cheaper ones, so the
//! store improves monotonically and repeated submissions are no-ops.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::config::PerformanceOptions;
use crate::passes::AxisChains;
use crate::shape::{Direction, Precision, TransformShape, TransformType};

/// Version written to and required from serialized stores.
///
/// Version 2 added per-pass performance options to records.
pub const WISDOM_SCHEMA_VERSION: u32 = 2;

/// Errors raised while loading or saving wisdom.
#[derive(Debug, thiserror::Error)]
pub enum WisdomError {
    #[error("Wisdom schema version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("Wisdom parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid wisdom record: {0}")]
    InvalidRecord(String),
}

/// Identity of a transform for wisdom purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeKey {
    pub width: u32,
    pub height: u32,
    pub direction: Direction,
    pub transform_type: TransformType,
    pub precision: Precision,
    /// Device profile the measurement was taken on.
    pub target: String,
}

impl ShapeKey {
    pub fn new(shape: &TransformShape, target: &str) -> Self {
        Self {
            width: shape.width(),
            height: shape.rows(),
            direction: shape.direction(),
            transform_type: shape.transform_type(),
            precision: shape.precision(),
            target: target.to_string(),
        }
    }
}

/// Best known decomposition for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WisdomRecord {
    pub key: ShapeKey,
    pub horizontal: Vec<u32>,
    pub vertical: Vec<u32>,
    /// Measured time in microseconds, or a static estimate.
    pub cost: f64,
    pub pass_count: u32,
    /// One entry per pass when the plan was tuned, empty otherwise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub performance: Vec<PerformanceOptions>,
}

impl WisdomRecord {
    fn validate(&self) -> Result<(), WisdomError> {
        if !self.cost.is_finite() || self.cost < 0.0 {
            return Err(WisdomError::InvalidRecord(format!(
                "cost {} for {:?}",
                self.cost, self.key
            )));
        }
        if self.horizontal.iter().chain(&self.vertical).any(|&r| r < 2) {
            return Err(WisdomError::InvalidRecord(format!(
                "radix below 2 for {:?}",
                self.key
            )));
        }
        if !self.performance.is_empty() && self.performance.len() != self.pass_count as usize {
            return Err(WisdomError::InvalidRecord(format!(
                "{} performance options for {} passes of {:?}",
                self.performance.len(),
                self.pass_count,
                self.key
            )));
        }
        for perf in &self.performance {
            perf.validate()
                .map_err(|e| WisdomError::InvalidRecord(format!("{} for {:?}", e, self.key)))?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct WisdomFile {
    version: u32,
    records: Vec<WisdomRecord>,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

/// Shared key-to-record map with single-writer updates.
#[derive(Debug, Default)]
pub struct WisdomStore {
    records: RwLock<BTreeMap<ShapeKey, WisdomRecord>>,
}

impl WisdomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a serialized store.
    pub fn from_json(blob: &str) -> Result<Self, WisdomError> {
        let store = Self::new();
        store.load(blob)?;
        Ok(store)
    }

    /// Load a store from a file written by [`WisdomStore::save`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WisdomError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn lookup(&self, key: &ShapeKey) -> Option<WisdomRecord> {
        self.read().get(key).cloned()
    }

    /// Record `chains` for `key` unless an equal or cheaper record exists.
    ///
    /// Returns whether the store changed.
    pub fn record(&self, key: ShapeKey, chains: &AxisChains, cost: f64, pass_count: u32) -> bool {
        self.record_tuned(key, chains, Vec::new(), cost, pass_count)
    }

    /// Record `chains` together with the performance options of each pass.
    pub fn record_tuned(
        &self,
        key: ShapeKey,
        chains: &AxisChains,
        performance: Vec<PerformanceOptions>,
        cost: f64,
        pass_count: u32,
    ) -> bool {
        self.insert(WisdomRecord {
            key,
            horizontal: chains.horizontal.radices(),
            vertical: chains.vertical.radices(),
            cost,
            pass_count,
            performance,
        })
    }

    fn insert(&self, record: WisdomRecord) -> bool {
        if !record.cost.is_finite() {
            log::warn!("Ignoring wisdom for {:?} with cost {}", record.key, record.cost);
            return false;
        }
        let mut records = self.write();
        let previous = records.get(&record.key).map(|existing| existing.cost);
        if previous.is_some_and(|cost| cost <= record.cost) {
            return false;
        }
        log::info!(
            "Wisdom for {}x{} {}: {:?} x {:?} at {:.3} (was {:?})",
            record.key.width,
            record.key.height,
            record.key.direction.name(),
            record.horizontal,
            record.vertical,
            record.cost,
            previous
        );
        records.insert(record.key.clone(), record);
        true
    }

    /// Merge a serialized store into this one under the improvement rule.
    ///
    /// The blob is fully validated before any record is applied. Returns
    /// the number of records that changed the store.
    pub fn load(&self, blob: &str) -> Result<usize, WisdomError> {
        let header: VersionHeader = serde_json::from_str(blob)?;
        if header.version != WISDOM_SCHEMA_VERSION {
            return Err(WisdomError::Version {
                found: header.version,
                expected: WISDOM_SCHEMA_VERSION,
            });
        }
        let file: WisdomFile = serde_json::from_str(blob)?;
        for record in &file.records {
            record.validate()?;
        }
        let changed = file
            .records
            .into_iter()
            .filter(|record| self.insert(record.clone()))
            .count();
        log::debug!("Loaded wisdom: {} records applied", changed);
        Ok(changed)
    }

    /// Serialize every record, sorted by key.
    pub fn serialize(&self) -> Result<String, WisdomError> {
        let file = WisdomFile {
            version: WISDOM_SCHEMA_VERSION,
            records: self.records(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    /// Write the store to `path`, replacing it atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), WisdomError> {
        let path = path.as_ref();
        let blob = self.serialize()?;
        let staging = path.with_extension("tmp");
        std::fs::write(&staging, blob)?;
        std::fs::rename(&staging, path)?;
        Ok(())
    }

    /// Snapshot of every record, sorted by key.
    pub fn records(&self) -> Vec<WisdomRecord> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ShapeKey, WisdomRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ShapeKey, WisdomRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }
}
