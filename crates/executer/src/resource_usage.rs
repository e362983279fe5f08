//! Request unit accounting.

use std::time::{Duration, Instant};

use crate::stats::ConsumptionEntry;

const CPU_MICROS_PER_UNIT: u64 = 1500;
const READ_BYTES_PER_UNIT: u64 = 4096;

/// Request units for a consumption delta: the larger of the CPU and the
/// read IO cost.
pub fn calc_request_units(consumption: &ConsumptionEntry) -> u64 {
    let cpu_units = consumption.cpu_time.as_micros() as u64 / CPU_MICROS_PER_UNIT;
    let io_units = consumption.read_bytes.div_ceil(READ_BYTES_PER_UNIT);
    cpu_units.max(io_units)
}

/// Throttles usage reports to one per interval and skips small bills.
#[derive(Debug)]
pub struct ResourceUsageTracker {
    interval: Duration,
    threshold: u64,
    last_update: Option<Instant>,
}

impl ResourceUsageTracker {
    pub fn new(interval: Duration, threshold: u64) -> Self {
        Self {
            interval,
            threshold,
            last_update: None,
        }
    }

    /// Whether a report may be computed at `now`. Marks the attempt.
    pub fn begin(&mut self, now: Instant, force: bool) -> bool {
        if !force {
            if let Some(last) = self.last_update {
                if now.saturating_duration_since(last) < self.interval {
                    return false;
                }
            }
        }
        self.last_update = Some(now);
        true
    }

    /// Request units to bill for `consumption`, or `None` while the amount
    /// stays under the threshold.
    pub fn bill(&self, consumption: &ConsumptionEntry, force: bool) -> Option<u64> {
        let ru = calc_request_units(consumption);
        if ru <= self.threshold && !force {
            return None;
        }
        Some(ru)
    }
}
