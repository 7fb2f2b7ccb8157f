//! Work-group geometry of radix passes.
//!
//! Large radices are computed cooperatively: `z` invocations share one
//! butterfly through shared memory. To keep the total invocation count in
//! check, `z` is folded into `y` first and then `x`.

use crate::config::PerformanceOptions;

use super::Constraints;

/// Work-group shape of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkGroupSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkGroupSize {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Total invocations per work group.
    pub fn invocations(&self) -> u32 {
        self.x * self.y * self.z
    }

    /// Shape of a radix pass before fitting it to the problem size.
    pub fn for_radix(radix: u32, perf: &PerformanceOptions) -> Self {
        let mut divisor = cooperating_invocations(radix);
        let z = divisor;
        let mut x = perf.workgroup_size_x.max(1);
        let mut y = perf.workgroup_size_y.max(1);
        reduce(&mut y, &mut divisor);
        reduce(&mut x, &mut divisor);
        Self { x, y, z }
    }

    /// Shrink `x` and `y` so they divide the invocation counts of the pass.
    ///
    /// Sizes only ever shrink, so a feasible shape stays feasible.
    pub fn fitted(self, count_x: u32, count_y: u32) -> Self {
        Self {
            x: largest_divisor_at_most(count_x, self.x),
            y: largest_divisor_at_most(count_y, self.y),
            z: self.z,
        }
    }
}

/// Invocations cooperating on one butterfly of `radix`.
pub fn cooperating_invocations(radix: u32) -> u32 {
    if radix >= 16 && radix.is_power_of_two() {
        1 << (radix.trailing_zeros() / 2)
    } else {
        1
    }
}

fn reduce(size: &mut u32, divisor: &mut u32) {
    if *divisor > 1 && *size >= *divisor {
        *size /= *divisor;
        *divisor = 1;
    } else if *divisor > 1 && *size < *divisor {
        *divisor /= *size;
        *size = 1;
    }
}

/// Largest divisor of `n` that does not exceed `limit` (at least 1).
pub fn largest_divisor_at_most(n: u32, limit: u32) -> u32 {
    if n == 0 {
        return 1;
    }
    let mut d = limit.min(n).max(1);
    while n % d != 0 {
        d -= 1;
    }
    d
}

/// Hardware footprint of one radix step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepFootprint {
    pub radix: u32,
    pub workgroup: WorkGroupSize,
    /// Elements a work group keeps in shared memory.
    pub shared_elements: u64,
}

impl StepFootprint {
    pub fn for_radix(radix: u32, perf: &PerformanceOptions) -> Self {
        let workgroup = WorkGroupSize::for_radix(radix, perf);
        let shared_elements =
            radix as u64 * perf.lanes as u64 * workgroup.x as u64 * workgroup.y as u64;
        Self {
            radix,
            workgroup,
            shared_elements,
        }
    }

    pub fn invocations(&self) -> u32 {
        self.workgroup.invocations()
    }

    /// Whether the step fits the hardware limits.
    pub fn fits(&self, constraints: &Constraints) -> bool {
        self.shared_elements <= constraints.max_shared_memory_elements as u64
            && self.invocations() <= constraints.max_work_group_invocations
    }
}
