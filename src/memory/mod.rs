// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Adaptive batch sizing under memory pressure.
//!
//! The orchestrator asks [`MemoryManager::adaptive_batch_size`] before every
//! page. Above the soft threshold the size shrinks by
//! `clamp((usage% - soft%) / 20, 0.1, 0.5)`; once usage is 20 points below
//! the soft threshold it grows back by 10% per call. It always stays within
//! `[min_batch_size, max_batch_size]`.
//!
//! At the critical threshold [`MemoryManager::check_threshold`] fails with a
//! `memory` [`ClassifiedError`]; the orchestrator stops paging and keeps what
//! it has.
//!
//! A reclaim hook (allocator trim, cache flush, ...) fires when usage crosses
//! the soft threshold and every `reclaim_every_pages` pages regardless.

pub mod pressure;
pub mod probe;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::MemoryConfig;
use crate::resilience::classifier::ClassifiedError;

pub use pressure::MemoryPressure;
pub use probe::{FixedMemoryProbe, MemoryProbe, MemoryReading, ProcessMemoryProbe};

/// Growth once pressure is gone: +10% per adjustment.
const GROWTH_FACTOR: f64 = 0.10;
/// Percentage points below the soft threshold before growing again.
const GROWTH_MARGIN: f64 = 20.0;

/// Called to ask the process to give memory back.
pub type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

/// Memory state at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub limit_bytes: Option<u64>,
    /// 0.0 - 100.0; 0 when the limit is unknown
    pub usage_percent: f64,
    pub batch_size: usize,
    #[serde(skip)]
    pub pressure: MemoryPressure,
}

pub struct MemoryManager {
    probe: Arc<dyn MemoryProbe>,
    config: MemoryConfig,
    batch_size: AtomicUsize,
    above_soft: AtomicBool,
    pages: AtomicU32,
    reclaims: AtomicU64,
    reclaim_hook: Option<ReclaimHook>,
}

impl MemoryManager {
    pub fn new(probe: Arc<dyn MemoryProbe>, config: MemoryConfig) -> Self {
        let initial = config.max_batch_size.max(config.min_batch_size);
        Self {
            probe,
            config,
            batch_size: AtomicUsize::new(initial),
            above_soft: AtomicBool::new(false),
            pages: AtomicU32::new(0),
            reclaims: AtomicU64::new(0),
            reclaim_hook: None,
        }
    }

    /// Manager over the current process.
    pub fn for_process(config: MemoryConfig) -> Self {
        Self::new(Arc::new(ProcessMemoryProbe), config)
    }

    #[must_use]
    pub fn with_reclaim_hook(mut self, hook: ReclaimHook) -> Self {
        self.reclaim_hook = Some(hook);
        self
    }

    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Current batch size without re-sampling.
    #[must_use]
    pub fn current_batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Reclaim hints issued so far.
    #[must_use]
    pub fn reclaim_count(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }

    fn soft_percent(&self) -> f64 {
        self.config.soft_threshold * 100.0
    }

    /// Read the probe. Unknown usage reads as 0%.
    #[must_use]
    pub fn sample(&self) -> MemorySample {
        let reading = self.probe.read();
        let used_bytes = reading.map_or(0, |r| r.used_bytes);
        let limit_bytes = self.config.limit_bytes.or(reading.and_then(|r| r.limit_bytes));
        let usage_percent = match limit_bytes {
            Some(limit) if limit > 0 => used_bytes as f64 / limit as f64 * 100.0,
            _ => 0.0,
        };
        MemorySample {
            used_bytes,
            limit_bytes,
            usage_percent,
            batch_size: self.current_batch_size(),
            pressure: MemoryPressure::from_usage(
                usage_percent / 100.0,
                self.config.soft_threshold,
                self.config.critical_threshold,
            ),
        }
    }

    /// Recompute the batch size for the next page.
    pub fn adaptive_batch_size(&self) -> usize {
        let sample = self.sample();
        let soft = self.soft_percent();
        let current = self.current_batch_size();
        let min = self.config.min_batch_size;
        let max = self.config.max_batch_size.max(min);

        let next = if sample.usage_percent >= soft {
            let factor = ((sample.usage_percent - soft) / 20.0).clamp(0.1, 0.5);
            ((current as f64 * (1.0 - factor)).floor() as usize).max(min)
        } else if sample.usage_percent <= soft - GROWTH_MARGIN {
            let step = ((current as f64 * GROWTH_FACTOR) as usize).max(1);
            current.saturating_add(step).min(max)
        } else {
            current
        };

        self.track_soft_crossing(&sample);
        if next != current {
            self.batch_size.store(next, Ordering::Relaxed);
            debug!(
                from = current,
                to = next,
                usage_percent = sample.usage_percent,
                "Adjusted batch size"
            );
        }
        crate::metrics::set_batch_size(next);
        next
    }

    fn track_soft_crossing(&self, sample: &MemorySample) {
        if sample.usage_percent >= self.soft_percent() {
            if !self.above_soft.swap(true, Ordering::Relaxed) {
                warn!(
                    usage_percent = sample.usage_percent,
                    threshold = self.soft_percent(),
                    "Memory usage crossed soft threshold"
                );
                self.reclaim("soft_threshold");
            }
        } else {
            self.above_soft.store(false, Ordering::Relaxed);
        }
    }

    /// Sample and report. Warns at the soft threshold, errors at the critical one.
    pub fn monitor(&self, operation: &str) -> MemorySample {
        let sample = self.sample();
        crate::metrics::set_memory_usage_percent(sample.usage_percent);
        crate::metrics::set_memory_pressure_level(sample.pressure as u8);
        match sample.pressure {
            MemoryPressure::Normal => {}
            MemoryPressure::Elevated => warn!(
                operation,
                usage_percent = sample.usage_percent,
                batch_size = sample.batch_size,
                "High memory usage"
            ),
            MemoryPressure::Critical => error!(
                operation,
                usage_percent = sample.usage_percent,
                used_bytes = sample.used_bytes,
                "Critical memory usage"
            ),
        }
        sample
    }

    /// Fail with a `memory` error at or above the critical threshold.
    pub fn check_threshold(&self, operation: &str, current_batch_len: usize) -> Result<MemorySample, ClassifiedError> {
        let sample = self.monitor(operation);
        if sample.pressure.allows_fetch() {
            return Ok(sample);
        }
        Err(ClassifiedError::out_of_memory(operation, sample.usage_percent)
            .with_context("batch_len", current_batch_len.to_string())
            .with_context("used_bytes", sample.used_bytes.to_string()))
    }

    /// Count a fetched page; fires the periodic reclaim. Returns whether it fired.
    pub fn on_page_fetched(&self) -> bool {
        let every = self.config.reclaim_every_pages;
        let pages = self.pages.fetch_add(1, Ordering::Relaxed) + 1;
        if every > 0 && pages % every == 0 {
            self.reclaim("periodic");
            return true;
        }
        false
    }

    /// Run the reclaim hook, if any.
    pub fn reclaim(&self, reason: &str) {
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_reclaim(reason);
        if let Some(hook) = &self.reclaim_hook {
            debug!(reason, "Running memory reclaim hook");
            hook();
        }
    }

    /// Back to the maximum batch size, page counter cleared.
    pub fn reset(&self) {
        self.batch_size.store(self.config.max_batch_size.max(self.config.min_batch_size), Ordering::Relaxed);
        self.pages.store(0, Ordering::Relaxed);
        self.above_soft.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::classifier::ErrorKind;

    fn config() -> MemoryConfig {
        MemoryConfig {
            limit_bytes: None,
            soft_threshold: 0.80,
            critical_threshold: 0.95,
            min_batch_size: 10,
            max_batch_size: 500,
            reclaim_every_pages: 3,
        }
    }

    fn manager(percent: f64) -> (MemoryManager, Arc<FixedMemoryProbe>) {
        let probe = Arc::new(FixedMemoryProbe::at_percent(percent));
        (MemoryManager::new(probe.clone(), config()), probe)
    }

    #[test]
    fn test_low_usage_keeps_max() {
        let (mm, _) = manager(30.0);
        assert_eq!(mm.adaptive_batch_size(), 500);
    }

    #[test]
    fn test_shrinks_proportionally_above_soft() {
        // 85% → factor 0.25
        let (mm, _) = manager(85.0);
        assert_eq!(mm.adaptive_batch_size(), 375);

        // 90%+ → factor capped at 0.5
        let (mm, _) = manager(92.0);
        assert_eq!(mm.adaptive_batch_size(), 250);

        // Just over soft → at least 10%
        let (mm, _) = manager(80.5);
        assert_eq!(mm.adaptive_batch_size(), 450);
    }

    #[test]
    fn test_never_below_min() {
        let (mm, _) = manager(94.0);
        for _ in 0..50 {
            assert!(mm.adaptive_batch_size() >= 10);
        }
        assert_eq!(mm.current_batch_size(), 10);
    }

    #[test]
    fn test_grows_back_after_pressure() {
        let (mm, probe) = manager(90.0);
        mm.adaptive_batch_size();
        mm.adaptive_batch_size();
        assert_eq!(mm.current_batch_size(), 125);

        // 70% is inside the hysteresis band: unchanged
        probe.set_percent(70.0);
        assert_eq!(mm.adaptive_batch_size(), 125);

        probe.set_percent(50.0);
        assert_eq!(mm.adaptive_batch_size(), 137);
        for _ in 0..100 {
            mm.adaptive_batch_size();
        }
        assert_eq!(mm.current_batch_size(), 500);
    }

    #[test]
    fn test_check_threshold_fails_at_critical() {
        let (mm, probe) = manager(94.0);
        assert!(mm.check_threshold("fetch deals", 200).is_ok());

        probe.set_percent(96.0);
        let err = mm.check_threshold("fetch deals", 200).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Memory);
        assert!(!err.retryable);
        assert_eq!(err.context["batch_len"], "200");
        assert_eq!(err.context["operation"], "fetch deals");
    }

    #[test]
    fn test_reclaim_on_soft_crossing_and_periodically() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = calls.clone();
        let probe = Arc::new(FixedMemoryProbe::at_percent(50.0));
        let mm = MemoryManager::new(probe.clone(), config())
            .with_reclaim_hook(Arc::new(move || {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            }));

        mm.adaptive_batch_size();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        probe.set_percent(85.0);
        mm.adaptive_batch_size();
        mm.adaptive_batch_size();
        // Only the crossing fires
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(!mm.on_page_fetched());
        assert!(!mm.on_page_fetched());
        assert!(mm.on_page_fetched());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(mm.reclaim_count(), 2);
    }

    #[test]
    fn test_configured_limit_overrides_probe() {
        let probe = Arc::new(FixedMemoryProbe::new(900, 0));
        let mm = MemoryManager::new(probe, MemoryConfig { limit_bytes: Some(1000), ..config() });
        let sample = mm.sample();
        assert!((sample.usage_percent - 90.0).abs() < 1e-9);
        assert_eq!(sample.pressure, MemoryPressure::Elevated);
    }

    #[test]
    fn test_unknown_limit_reads_as_zero() {
        let probe = Arc::new(FixedMemoryProbe::new(900, 0));
        let mm = MemoryManager::new(probe, config());
        assert_eq!(mm.sample().usage_percent, 0.0);
    }

    #[test]
    fn test_reset() {
        let (mm, _) = manager(92.0);
        mm.adaptive_batch_size();
        mm.reset();
        assert_eq!(mm.current_batch_size(), 500);
    }
}
