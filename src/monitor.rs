//! Resource monitoring for the batch orchestrator.
//!
//! Samples system memory and classifies pressure against configured soft
//! and hard thresholds. Soft pressure throttles admission of new
//! documents; hard pressure requeues the in-flight document. The monitor
//! is passed into the run as an explicit context object so the
//! orchestrator stays testable without real memory pressure.

use std::sync::Mutex;

use sysinfo::System;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Normal,
    /// Above the soft threshold: stop admitting new documents.
    Soft,
    /// Above the hard threshold: requeue in-flight work.
    Hard,
}

#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub used_mb: u64,
    pub total_mb: u64,
}

impl MemorySample {
    pub fn percent(&self) -> u64 {
        if self.total_mb == 0 {
            return 0;
        }
        self.used_mb * 100 / self.total_mb
    }
}

/// Threshold configuration, in percent of total system memory.
#[derive(Debug, Clone, Copy)]
pub struct MemoryThresholds {
    pub soft_pct: u64,
    pub hard_pct: u64,
}

/// Classify a sample against thresholds. Pure so the policy is testable
/// without a live system.
pub fn classify(sample: MemorySample, thresholds: MemoryThresholds) -> MemoryPressure {
    let pct = sample.percent();
    if pct >= thresholds.hard_pct {
        MemoryPressure::Hard
    } else if pct >= thresholds.soft_pct {
        MemoryPressure::Soft
    } else {
        MemoryPressure::Normal
    }
}

pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Live sampler backed by sysinfo.
pub struct SystemSampler {
    system: Mutex<System>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SystemSampler {
    fn sample(&self) -> MemorySample {
        let mut system = self.system.lock().expect("memory sampler mutex poisoned");
        system.refresh_memory();
        MemorySample {
            used_mb: system.used_memory() / (1024 * 1024),
            total_mb: system.total_memory() / (1024 * 1024),
        }
    }
}

/// The monitor handed to each batch run.
pub struct ResourceMonitor {
    sampler: Box<dyn MemorySampler>,
    thresholds: MemoryThresholds,
}

impl ResourceMonitor {
    pub fn new(thresholds: MemoryThresholds) -> Self {
        Self {
            sampler: Box::new(SystemSampler::new()),
            thresholds,
        }
    }

    /// Monitor with an injected sampler, for tests.
    pub fn with_sampler(sampler: Box<dyn MemorySampler>, thresholds: MemoryThresholds) -> Self {
        Self {
            sampler,
            thresholds,
        }
    }

    pub fn sample(&self) -> MemorySample {
        self.sampler.sample()
    }

    pub fn pressure(&self) -> MemoryPressure {
        classify(self.sampler.sample(), self.thresholds)
    }

    pub fn thresholds(&self) -> MemoryThresholds {
        self.thresholds
    }
}
