// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduling configuration shared by workers.
//!
//! Process-wide knobs: the voluntary-yield time slice, switch logging,
//! and which worker (if any) owns the preemption timer. Workers on
//! different threads may share one instance, so every field is atomic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::SchedError;
use crate::worker::WorkerId;

/// Default minimum spacing between unforced switches.
pub const DEFAULT_TIME_SLICE: Duration = Duration::from_millis(100);

/// Env var overriding the time slice of the global config (milliseconds).
pub const ENV_TIME_SLICE_MS: &str = "FIBRIL_TIME_SLICE_MS";

/// Env var toggling switch logging of the global config.
pub const ENV_LOG: &str = "FIBRIL_LOG";

/// No worker holds the preemption timer.
const NO_OWNER: u64 = 0;

#[derive(Debug)]
pub struct SchedConfig {
    time_slice_nanos: AtomicU64,
    log_enabled: AtomicBool,
    preempt_owner: AtomicU64,
}

impl SchedConfig {
    /// Fresh configuration with defaults: 100ms slice, logging on,
    /// preemption off.
    pub fn new() -> Self {
        Self {
            time_slice_nanos: AtomicU64::new(duration_nanos(DEFAULT_TIME_SLICE)),
            log_enabled: AtomicBool::new(true),
            preempt_owner: AtomicU64::new(NO_OWNER),
        }
    }

    /// Defaults overridden by `FIBRIL_TIME_SLICE_MS` and `FIBRIL_LOG`.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let config = Self::new();
        if let Some(ms) = var(ENV_TIME_SLICE_MS).and_then(|v| v.trim().parse::<u64>().ok()) {
            config.set_time_slice(Duration::from_millis(ms));
        }
        if let Some(on) = var(ENV_LOG).as_deref().and_then(parse_flag) {
            config.set_logging(on);
        }
        config
    }

    /// The process-wide instance used by [`Worker::new`](crate::Worker::new).
    /// Built from the environment on first use.
    pub fn global() -> Arc<SchedConfig> {
        static GLOBAL: OnceLock<Arc<SchedConfig>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(SchedConfig::from_env()))
            .clone()
    }

    pub fn time_slice(&self) -> Duration {
        Duration::from_nanos(self.time_slice_nanos.load(Ordering::Relaxed))
    }

    pub fn set_time_slice(&self, slice: Duration) {
        self.time_slice_nanos.store(duration_nanos(slice), Ordering::Relaxed);
    }

    pub fn log_enabled(&self) -> bool {
        self.log_enabled.load(Ordering::Relaxed)
    }

    pub fn set_logging(&self, enabled: bool) {
        self.log_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Worker currently holding the preemption timer.
    pub fn preemption_owner(&self) -> Option<WorkerId> {
        match self.preempt_owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            raw => Some(WorkerId::from_raw(raw)),
        }
    }

    pub fn preemption_enabled(&self) -> bool {
        self.preemption_owner().is_some()
    }

    /// Designate `worker` as the preemption target. Re-claiming by the
    /// current owner succeeds.
    pub(crate) fn claim_preemption(&self, worker: WorkerId) -> Result<(), SchedError> {
        match self.preempt_owner.compare_exchange(
            NO_OWNER,
            worker.as_raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) if current == worker.as_raw() => Ok(()),
            Err(current) => Err(SchedError::PreemptionHeld {
                owner: WorkerId::from_raw(current),
                requested: worker,
            }),
        }
    }

    /// Drop `worker`'s claim. Releasing when nobody holds it is a no-op.
    pub(crate) fn release_preemption(&self, worker: WorkerId) -> Result<(), SchedError> {
        match self.preempt_owner.compare_exchange(
            worker.as_raw(),
            NO_OWNER,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) | Err(NO_OWNER) => Ok(()),
            Err(current) => Err(SchedError::PreemptionHeld {
                owner: WorkerId::from_raw(current),
                requested: worker,
            }),
        }
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SchedConfig::new();
        assert_eq!(config.time_slice(), DEFAULT_TIME_SLICE);
        assert!(config.log_enabled());
        assert!(!config.preemption_enabled());
    }

    #[test]
    fn slice_and_logging_setters() {
        let config = SchedConfig::new();
        config.set_time_slice(Duration::from_millis(7));
        config.set_logging(false);
        assert_eq!(config.time_slice(), Duration::from_millis(7));
        assert!(!config.log_enabled());
    }

    #[test]
    fn huge_slice_saturates() {
        let config = SchedConfig::new();
        config.set_time_slice(Duration::MAX);
        assert_eq!(config.time_slice(), Duration::from_nanos(u64::MAX));
    }

    #[test]
    fn flag_parsing() {
        assert_eq!(parse_flag("ON"), Some(true));
        assert_eq!(parse_flag(" 0 "), Some(false));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn from_env_reads_slice_and_logging() {
        std::env::set_var(ENV_TIME_SLICE_MS, " 25 ");
        std::env::set_var(ENV_LOG, "off");
        let config = SchedConfig::from_env();
        assert_eq!(config.time_slice(), Duration::from_millis(25));
        assert!(!config.log_enabled());

        std::env::set_var(ENV_TIME_SLICE_MS, "soon");
        std::env::set_var(ENV_LOG, "maybe");
        let config = SchedConfig::from_env();
        assert_eq!(config.time_slice(), DEFAULT_TIME_SLICE);
        assert!(config.log_enabled());

        std::env::remove_var(ENV_TIME_SLICE_MS);
        std::env::remove_var(ENV_LOG);
        let config = SchedConfig::from_env();
        assert_eq!(config.time_slice(), DEFAULT_TIME_SLICE);
        assert!(config.log_enabled());
    }

    #[test]
    fn from_vars_ignores_unset() {
        let config = SchedConfig::from_vars(|name| (name == ENV_LOG).then(|| "0".to_string()));
        assert_eq!(config.time_slice(), DEFAULT_TIME_SLICE);
        assert!(!config.log_enabled());
    }

    #[test]
    fn preemption_claim_is_exclusive() {
        let config = SchedConfig::new();
        let a = WorkerId::from_raw(10);
        let b = WorkerId::from_raw(11);

        config.claim_preemption(a).unwrap();
        config.claim_preemption(a).unwrap();
        assert_eq!(config.preemption_owner(), Some(a));

        match config.claim_preemption(b) {
            Err(SchedError::PreemptionHeld { owner, requested }) => {
                assert_eq!(owner, a);
                assert_eq!(requested, b);
            }
            other => panic!("expected PreemptionHeld, got {:?}", other),
        }
        assert!(config.release_preemption(b).is_err());

        config.release_preemption(a).unwrap();
        assert!(!config.preemption_enabled());
        config.release_preemption(b).unwrap();
        config.claim_preemption(b).unwrap();
        assert_eq!(config.preemption_owner(), Some(b));
    }
}
