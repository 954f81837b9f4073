//! Memory-pressure driven batch scaling.

use super::lifecycle::Scheduler;
use crate::runtime::monitor::ResourceMonitor;
use anyhow::Result;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const MINIMUM_BATCH_SIZE: usize = 5;
pub const CHECK_MEMORY_INTERVAL: Duration = Duration::from_secs(60);
pub const HIGH_PRESSURE_THRESHOLD: f64 = 0.85;
pub const LOW_PRESSURE_THRESHOLD: f64 = 0.60;

const FULL_SCALE_TENTHS: u8 = 10;

/// Scale factor in `[0, 1]`, kept in tenths so repeated steps stay exact.
#[derive(Debug)]
pub struct BatchScale {
    tenths: AtomicU8,
}

impl Default for BatchScale {
    fn default() -> Self {
        Self {
            tenths: AtomicU8::new(FULL_SCALE_TENTHS),
        }
    }
}

impl BatchScale {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> f64 {
        f64::from(self.tenths()) / f64::from(FULL_SCALE_TENTHS)
    }

    pub fn tenths(&self) -> u8 {
        self.tenths.load(Ordering::SeqCst)
    }

    fn set_tenths(&self, tenths: u8) {
        self.tenths
            .store(tenths.min(FULL_SCALE_TENTHS), Ordering::SeqCst);
    }
}

/// One tenth down above the high threshold, one tenth up below the low threshold.
pub fn next_scale_tenths(current: u8, pressure: f64) -> u8 {
    let current = current.min(FULL_SCALE_TENTHS);
    if pressure > HIGH_PRESSURE_THRESHOLD {
        current.saturating_sub(1)
    } else if pressure < LOW_PRESSURE_THRESHOLD {
        (current + 1).min(FULL_SCALE_TENTHS)
    } else {
        current
    }
}

/// `max(round(scale × batch_size), min(5, batch_size × 3))`.
pub fn effective_batch_size(scale: f64, batch_size: usize) -> usize {
    let scaled = (scale * batch_size as f64).round() as usize;
    scaled.max(MINIMUM_BATCH_SIZE.min(batch_size.saturating_mul(3)))
}

pub struct BatchScaleController {
    scale: Arc<BatchScale>,
    monitor: Arc<dyn ResourceMonitor>,
}

impl BatchScaleController {
    pub fn new(scale: Arc<BatchScale>, monitor: Arc<dyn ResourceMonitor>) -> Self {
        Self { scale, monitor }
    }

    /// Samples pressure once and applies at most one step. Returns the resulting scale.
    pub fn sample(&self) -> Result<f64> {
        let pressure = self.monitor.pressure_ratio()?;
        let current = self.scale.tenths();
        let next = next_scale_tenths(current, pressure);
        if next != current {
            self.scale.set_tenths(next);
            tracing::debug!(
                pressure = format!("{pressure:.2}"),
                scale = self.scale.get(),
                "adjusted batch scale"
            );
        }
        Ok(self.scale.get())
    }

    pub fn register(self: &Arc<Self>, scheduler: &mut Scheduler) {
        let controller = self.clone();
        scheduler.every("batch-scale", CHECK_MEMORY_INTERVAL, move || {
            let controller = controller.clone();
            async move {
                if let Err(err) = controller.sample() {
                    tracing::warn!(error = %err, "failed to sample memory pressure");
                }
            }
        });
    }
}
