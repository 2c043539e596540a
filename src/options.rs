//! Collector configuration.
//!
//! Every tunable the cycle reads lives in [`GcOptions`]. Values start from
//! [`Default`], can be adjusted with the `with_*` setters, and can be
//! overridden from `REGIONGC_*` environment variables via
//! [`GcOptions::from_env`].

use std::{env, str::FromStr, time::Duration};

use crate::{
    error::{GcError, GcResult},
    types::HeapMode,
};

pub const ENV_PREFIX: &str = "REGIONGC_";

/// Tunables for heap layout, worker sizing and cycle behaviour.
///
/// ```
/// use regiongc::options::GcOptions;
/// use regiongc::types::HeapMode;
///
/// let options = GcOptions::default()
///     .with_region_count(32)
///     .with_mode(HeapMode::Generational)
///     .with_unload_classes(true);
/// assert!(options.validate().is_ok());
/// assert_eq!(options.heap_size(), 32 * options.region_size);
/// ```
#[derive(Debug, Clone)]
pub struct GcOptions {
    pub region_size: usize,
    pub region_count: usize,
    /// Workers available to stop-the-world phases.
    pub parallel_workers: usize,
    /// Workers available to concurrent phases.
    pub concurrent_workers: usize,
    pub mode: HeapMode,
    pub unload_classes: bool,
    pub verify: bool,
    /// Regions with at least this share of garbage join the collection set.
    pub garbage_threshold_percent: usize,
    /// Share of empty regions held back for evacuation.
    pub evac_reserve_percent: usize,
    /// Clear soft references in every cycle.
    pub clear_soft_refs: bool,
    /// Let the fault-injection hook fire when armed.
    pub alloc_failure_injection: bool,
    pub safepoint_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for GcOptions {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(2, |n| n.get());
        Self {
            region_size: 64 * 1024,
            region_count: 64,
            parallel_workers: cpus.clamp(1, 8),
            concurrent_workers: (cpus / 4).clamp(1, 4),
            mode: HeapMode::Satb,
            unload_classes: false,
            verify: false,
            garbage_threshold_percent: 25,
            evac_reserve_percent: 10,
            clear_soft_refs: false,
            alloc_failure_injection: true,
            safepoint_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl GcOptions {
    pub fn with_region_size(mut self, region_size: usize) -> Self {
        self.region_size = region_size;
        self
    }

    pub fn with_region_count(mut self, region_count: usize) -> Self {
        self.region_count = region_count;
        self
    }

    pub fn with_workers(mut self, parallel: usize, concurrent: usize) -> Self {
        self.parallel_workers = parallel;
        self.concurrent_workers = concurrent;
        self
    }

    pub fn with_mode(mut self, mode: HeapMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_unload_classes(mut self, unload: bool) -> Self {
        self.unload_classes = unload;
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_garbage_threshold(mut self, percent: usize) -> Self {
        self.garbage_threshold_percent = percent;
        self
    }

    pub fn with_evac_reserve(mut self, percent: usize) -> Self {
        self.evac_reserve_percent = percent;
        self
    }

    pub fn with_clear_soft_refs(mut self, clear: bool) -> Self {
        self.clear_soft_refs = clear;
        self
    }

    pub fn with_alloc_failure_injection(mut self, enabled: bool) -> Self {
        self.alloc_failure_injection = enabled;
        self
    }

    pub fn heap_size(&self) -> usize {
        self.region_size * self.region_count
    }

    pub fn max_workers(&self) -> usize {
        self.parallel_workers.max(self.concurrent_workers)
    }

    pub fn is_generational(&self) -> bool {
        self.mode == HeapMode::Generational
    }

    /// Reject combinations the heap cannot be built with.
    pub fn validate(&self) -> GcResult<()> {
        if self.region_size < 1024 || !self.region_size.is_power_of_two() {
            return Err(invalid("region_size", self.region_size));
        }
        if self.region_count < 2 {
            return Err(invalid("region_count", self.region_count));
        }
        if self.parallel_workers == 0 {
            return Err(invalid("parallel_workers", self.parallel_workers));
        }
        if self.concurrent_workers == 0 {
            return Err(invalid("concurrent_workers", self.concurrent_workers));
        }
        if self.garbage_threshold_percent > 100 {
            return Err(invalid(
                "garbage_threshold_percent",
                self.garbage_threshold_percent,
            ));
        }
        if self.evac_reserve_percent >= 100 {
            return Err(invalid("evac_reserve_percent", self.evac_reserve_percent));
        }
        Ok(())
    }

    /// Defaults with `REGIONGC_*` environment overrides applied.
    pub fn from_env() -> GcResult<Self> {
        let mut options = Self::default();
        options.apply_env(|key| env::var(key).ok())?;
        Ok(options)
    }

    /// Apply overrides looked up through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> GcResult<()> {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{}", name.to_uppercase()));
        if let Some(v) = get("region_size") {
            self.region_size = parse("region_size", &v)?;
        }
        if let Some(v) = get("region_count") {
            self.region_count = parse("region_count", &v)?;
        }
        if let Some(v) = get("parallel_workers") {
            self.parallel_workers = parse("parallel_workers", &v)?;
        }
        if let Some(v) = get("concurrent_workers") {
            self.concurrent_workers = parse("concurrent_workers", &v)?;
        }
        if let Some(v) = get("mode") {
            self.mode = match v.to_ascii_lowercase().as_str() {
                "satb" => HeapMode::Satb,
                "generational" => HeapMode::Generational,
                _ => return Err(GcError::InvalidOption { name: "mode", value: v }),
            };
        }
        if let Some(v) = get("unload_classes") {
            self.unload_classes = parse("unload_classes", &v)?;
        }
        if let Some(v) = get("verify") {
            self.verify = parse("verify", &v)?;
        }
        if let Some(v) = get("garbage_threshold_percent") {
            self.garbage_threshold_percent = parse("garbage_threshold_percent", &v)?;
        }
        if let Some(v) = get("evac_reserve_percent") {
            self.evac_reserve_percent = parse("evac_reserve_percent", &v)?;
        }
        if let Some(v) = get("clear_soft_refs") {
            self.clear_soft_refs = parse("clear_soft_refs", &v)?;
        }
        if let Some(v) = get("alloc_failure_injection") {
            self.alloc_failure_injection = parse("alloc_failure_injection", &v)?;
        }
        self.validate()
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> GcResult<T> {
    value.trim().parse().map_err(|_| GcError::InvalidOption {
        name,
        value: value.to_string(),
    })
}

fn invalid(name: &'static str, value: impl ToString) -> GcError {
    GcError::InvalidOption {
        name,
        value: value.to_string(),
    }
}
