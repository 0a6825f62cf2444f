//! Host-aware defaults for rate limiter configuration.
//!
//! [`MachineProfileAdvisor`] maps the host's core count and memory onto one
//! of four static [`RateLimiterProfile`]s. [`RateLimiterOptions`] uses the
//! profile only for the sub-configuration the caller left unset.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::debug;

use crate::Result;
use crate::rate_limit::{
    FixedWindowConfig, RateLimiterConfig, RateLimiterKind, RateLimiterPolicy,
    SlidingWindowConfig, TokenBucketConfig,
};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineCapability {
    pub cpu_cores: usize,
    pub memory_bytes: u64,
}

pub trait MachineProbe: Send + Sync {
    /// `None` when the host could not be inspected.
    fn probe(&self) -> Option<MachineCapability>;
}

/// Reads core count from the standard library and available memory from
/// `/proc/meminfo`. Hosts without procfs report `None`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMachineProbe;

impl MachineProbe for SystemMachineProbe {
    fn probe(&self) -> Option<MachineCapability> {
        let cpu_cores = std::thread::available_parallelism().ok()?.get();
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let memory_bytes = parse_meminfo_bytes(&meminfo, "MemAvailable:")?;
        Some(MachineCapability {
            cpu_cores,
            memory_bytes,
        })
    }
}

fn parse_meminfo_bytes(meminfo: &str, field: &str) -> Option<u64> {
    let line = meminfo.lines().find(|line| line.starts_with(field))?;
    let mut fields = line[field.len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    let multiplier = match fields.next() {
        Some(unit) if unit.eq_ignore_ascii_case("kb") => 1024,
        Some(unit) if unit.eq_ignore_ascii_case("mb") => 1024 * 1024,
        Some(unit) if unit.eq_ignore_ascii_case("gb") => GIB,
        None => 1,
        Some(_) => return None,
    };
    value.checked_mul(multiplier)
}

/// Fixed answer, for tests and hosts where detection is configured externally.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticMachineProbe(pub Option<MachineCapability>);

impl MachineProbe for StaticMachineProbe {
    fn probe(&self) -> Option<MachineCapability> {
        self.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RateLimiterProfile {
    Low,
    Medium,
    High,
    /// Detection failed.
    #[default]
    Default,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProfileDefaults {
    pub fixed_window: FixedWindowConfig,
    pub sliding_window: SlidingWindowConfig,
    pub token_bucket: TokenBucketConfig,
}

impl RateLimiterProfile {
    pub fn classify(capability: MachineCapability) -> Self {
        if capability.cpu_cores <= 2 || capability.memory_bytes <= 4 * GIB {
            Self::Low
        } else if capability.cpu_cores <= 4 || capability.memory_bytes <= 8 * GIB {
            Self::Medium
        } else {
            Self::High
        }
    }

    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::Low => ProfileDefaults {
                fixed_window: FixedWindowConfig::new(20, Duration::from_secs(1)).queue_limit(10),
                sliding_window: SlidingWindowConfig::new(20, Duration::from_secs(1), 4)
                    .queue_limit(10),
                token_bucket: TokenBucketConfig::new(20, 10.0).queue_limit(10),
            },
            Self::Medium => ProfileDefaults {
                fixed_window: FixedWindowConfig::new(50, Duration::from_secs(1)).queue_limit(25),
                sliding_window: SlidingWindowConfig::new(50, Duration::from_secs(1), 5)
                    .queue_limit(25),
                token_bucket: TokenBucketConfig::new(50, 25.0).queue_limit(25),
            },
            Self::High => ProfileDefaults {
                fixed_window: FixedWindowConfig::new(100, Duration::from_secs(1)).queue_limit(50),
                sliding_window: SlidingWindowConfig::new(100, Duration::from_secs(1), 10)
                    .queue_limit(50),
                token_bucket: TokenBucketConfig::new(100, 50.0).queue_limit(50),
            },
            Self::Default => ProfileDefaults {
                fixed_window: FixedWindowConfig::new(30, Duration::from_secs(1)).queue_limit(15),
                sliding_window: SlidingWindowConfig::new(30, Duration::from_secs(1), 4)
                    .queue_limit(15),
                token_bucket: TokenBucketConfig::new(30, 15.0).queue_limit(15),
            },
        }
    }
}

/// Probes the host on first use and keeps the resulting profile. Clones
/// share the detected profile.
#[derive(Clone)]
pub struct MachineProfileAdvisor {
    probe: Arc<dyn MachineProbe>,
    detected: Arc<OnceLock<RateLimiterProfile>>,
}

impl std::fmt::Debug for MachineProfileAdvisor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MachineProfileAdvisor")
            .field("detected", &self.detected.get())
            .finish_non_exhaustive()
    }
}

impl MachineProfileAdvisor {
    pub fn new(probe: Arc<dyn MachineProbe>) -> Self {
        Self {
            probe,
            detected: Arc::new(OnceLock::new()),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemMachineProbe))
    }

    pub fn profile(&self) -> RateLimiterProfile {
        *self.detected.get_or_init(|| self.detect())
    }

    fn detect(&self) -> RateLimiterProfile {
        match self.probe.probe() {
            Some(capability) => {
                let profile = RateLimiterProfile::classify(capability);
                debug!(
                    cpu_cores = capability.cpu_cores,
                    memory_bytes = capability.memory_bytes,
                    profile = ?profile,
                    "selected rate limiter profile"
                );
                profile
            }
            None => {
                debug!("machine capability unavailable; using default rate limiter profile");
                RateLimiterProfile::Default
            }
        }
    }

    pub fn defaults(&self) -> ProfileDefaults {
        self.profile().defaults()
    }
}

impl Default for MachineProfileAdvisor {
    fn default() -> Self {
        Self::system()
    }
}

/// Rate limiter selection where each algorithm's parameters are optional.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimiterOptions {
    pub kind: RateLimiterKind,
    pub fixed_window: Option<FixedWindowConfig>,
    pub sliding_window: Option<SlidingWindowConfig>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl RateLimiterOptions {
    pub const fn new(kind: RateLimiterKind) -> Self {
        Self {
            kind,
            fixed_window: None,
            sliding_window: None,
            token_bucket: None,
        }
    }

    pub const fn fixed_window(mut self, config: FixedWindowConfig) -> Self {
        self.fixed_window = Some(config);
        self
    }

    pub const fn sliding_window(mut self, config: SlidingWindowConfig) -> Self {
        self.sliding_window = Some(config);
        self
    }

    pub const fn token_bucket(mut self, config: TokenBucketConfig) -> Self {
        self.token_bucket = Some(config);
        self
    }

    /// Config for the selected kind, taking the profile value only when the
    /// caller supplied none. The advisor is consulted only in that case.
    pub fn resolve(&self, advisor: &MachineProfileAdvisor) -> RateLimiterConfig {
        match self.kind {
            RateLimiterKind::FixedWindow => self
                .fixed_window
                .unwrap_or_else(|| advisor.defaults().fixed_window)
                .into(),
            RateLimiterKind::SlidingWindow => self
                .sliding_window
                .unwrap_or_else(|| advisor.defaults().sliding_window)
                .into(),
            RateLimiterKind::TokenBucket => self
                .token_bucket
                .unwrap_or_else(|| advisor.defaults().token_bucket)
                .into(),
        }
    }

    pub fn build(&self, advisor: &MachineProfileAdvisor) -> Result<RateLimiterPolicy> {
        RateLimiterPolicy::new(self.resolve(advisor))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::{
        GIB, MachineCapability, MachineProbe, MachineProfileAdvisor, RateLimiterOptions,
        RateLimiterProfile, StaticMachineProbe, parse_meminfo_bytes,
    };
    use crate::rate_limit::{FixedWindowConfig, RateLimiterConfig, RateLimiterKind};

    fn capability(cpu_cores: usize, memory_gib: u64) -> MachineCapability {
        MachineCapability {
            cpu_cores,
            memory_bytes: memory_gib * GIB,
        }
    }

    #[test]
    fn hosts_are_classified_by_cores_or_memory() {
        assert_eq!(RateLimiterProfile::classify(capability(2, 64)), RateLimiterProfile::Low);
        assert_eq!(RateLimiterProfile::classify(capability(16, 4)), RateLimiterProfile::Low);
        assert_eq!(RateLimiterProfile::classify(capability(4, 64)), RateLimiterProfile::Medium);
        assert_eq!(RateLimiterProfile::classify(capability(16, 8)), RateLimiterProfile::Medium);
        assert_eq!(RateLimiterProfile::classify(capability(8, 16)), RateLimiterProfile::High);
    }

    #[test]
    fn failed_detection_selects_default_profile() {
        let advisor = MachineProfileAdvisor::new(Arc::new(StaticMachineProbe(None)));
        assert_eq!(advisor.profile(), RateLimiterProfile::Default);
    }

    #[test]
    fn missing_sub_config_is_filled_from_the_profile() {
        let advisor = MachineProfileAdvisor::new(Arc::new(StaticMachineProbe(Some(
            capability(16, 32),
        ))));
        let resolved = RateLimiterOptions::new(RateLimiterKind::TokenBucket).resolve(&advisor);
        assert_eq!(
            resolved,
            RateLimiterConfig::TokenBucket(RateLimiterProfile::High.defaults().token_bucket)
        );
    }

    struct CountingProbe(AtomicUsize);

    impl MachineProbe for CountingProbe {
        fn probe(&self) -> Option<MachineCapability> {
            self.0.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    #[test]
    fn explicit_sub_config_is_never_overridden() {
        let probe = Arc::new(CountingProbe(AtomicUsize::new(0)));
        let advisor = MachineProfileAdvisor::new(probe.clone());
        let explicit = FixedWindowConfig::new(7, Duration::from_secs(3)).queue_limit(2);

        let resolved = RateLimiterOptions::new(RateLimiterKind::FixedWindow)
            .fixed_window(explicit)
            .resolve(&advisor);
        assert_eq!(resolved, RateLimiterConfig::FixedWindow(explicit));
        assert_eq!(probe.0.load(Ordering::SeqCst), 0, "advisor should not be consulted");
    }

    #[test]
    fn host_is_probed_once_across_resolves_and_clones() {
        let probe = Arc::new(CountingProbe(AtomicUsize::new(0)));
        let advisor = MachineProfileAdvisor::new(probe.clone());
        let options = RateLimiterOptions::new(RateLimiterKind::TokenBucket);

        for _ in 0..3 {
            options.resolve(&advisor);
        }
        let clone = advisor.clone();
        options.resolve(&clone);
        assert_eq!(clone.profile(), RateLimiterProfile::Default);
        assert_eq!(probe.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_profile_yields_valid_configs() {
        for profile in [
            RateLimiterProfile::Low,
            RateLimiterProfile::Medium,
            RateLimiterProfile::High,
            RateLimiterProfile::Default,
        ] {
            let defaults = profile.defaults();
            defaults.fixed_window.validate().expect("fixed window defaults");
            defaults.sliding_window.validate().expect("sliding window defaults");
            defaults.token_bucket.validate().expect("token bucket defaults");
        }
    }

    #[test]
    fn meminfo_available_is_parsed_in_bytes() {
        let meminfo = "MemTotal:       16318412 kB\nMemAvailable:    8159206 kB\n";
        assert_eq!(
            parse_meminfo_bytes(meminfo, "MemAvailable:"),
            Some(8_159_206 * 1024)
        );
        assert_eq!(parse_meminfo_bytes("MemFree: 1 kB", "MemAvailable:"), None);
    }
}
