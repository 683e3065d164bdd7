// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Global configuration - single source of truth for runtime tunables.
//!
//! Mirrors the teacher's two-level `hdds::config` layout:
//!
//! - **Level 1 (static)**: compile-time constants for defaults.
//! - **Level 2 (dynamic)**: [`RuntimeConfig`], loaded once at startup from
//!   environment variables, layered on top of the static defaults.
//!
//! Process bootstrap and config-file loading are out of scope for this
//! crate (see spec §1); `RuntimeConfig::from_env` is the narrow surface
//! that remains.

use std::env;

/// Default ring capacity (must be a power of 2).
pub const DEFAULT_BLOCK_NUM: usize = 64;

/// Default per-slot payload size in bytes.
pub const DEFAULT_BLOCK_BUF_SIZE: usize = 4096;

/// Default coroutine stack size, in KiB.
pub const DEFAULT_STACK_SIZE_KB: usize = 256;

/// Default number of scheduler worker threads.
pub const DEFAULT_NUM_WORKERS: usize = 4;

/// Default per-reader `DataVisitor` queue depth.
pub const DEFAULT_CHANNEL_DEPTH: usize = 16;

/// Default aging threshold before a starved coroutine is bumped to the
/// head of its runqueue.
pub const DEFAULT_STARVATION_NS: u64 = 5_000_000; // 5ms

/// Scheduling policy selector (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Fixed worker affinity, FIFO with aging.
    Classic,
    /// Coroutines grouped by `group_id`, pinned to one worker.
    Choreography,
    /// EWMA-weighted load balancing across workers.
    Capacity,
}

impl SchedPolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "classic" => Some(Self::Classic),
            "choreography" => Some(Self::Choreography),
            "capacity" => Some(Self::Capacity),
            _ => None,
        }
    }
}

impl Default for SchedPolicy {
    fn default() -> Self {
        Self::Classic
    }
}

/// Runtime configuration, read once at `Scheduler`/`Node` construction.
///
/// Each field layers an environment-variable override on top of the
/// static default; unset or unparsable variables fall back silently
/// (logged at debug level) rather than failing startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub num_workers: usize,
    pub sched_policy: SchedPolicy,
    pub stack_size_kb: usize,
    pub channel_default_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_NUM_WORKERS,
            sched_policy: SchedPolicy::default(),
            stack_size_kb: DEFAULT_STACK_SIZE_KB,
            channel_default_depth: DEFAULT_CHANNEL_DEPTH,
        }
    }
}

impl RuntimeConfig {
    /// Build a `RuntimeConfig` by layering environment overrides on the
    /// static defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(raw) = env::var("CORE_NUM_WORKERS") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => cfg.num_workers = n,
                _ => {
                    #[cfg(feature = "logging")]
                    log::debug!("[config] ignoring invalid CORE_NUM_WORKERS={raw:?}");
                }
            }
        }

        if let Ok(raw) = env::var("CORE_SCHED_POLICY") {
            match SchedPolicy::parse(&raw) {
                Some(policy) => cfg.sched_policy = policy,
                None => {
                    #[cfg(feature = "logging")]
                    log::debug!("[config] ignoring invalid CORE_SCHED_POLICY={raw:?}");
                }
            }
        }

        if let Ok(raw) = env::var("CORE_STACK_SIZE_KB") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => cfg.stack_size_kb = n,
                _ => {
                    #[cfg(feature = "logging")]
                    log::debug!("[config] ignoring invalid CORE_STACK_SIZE_KB={raw:?}");
                }
            }
        }

        if let Ok(raw) = env::var("CORE_CHANNEL_DEFAULT_DEPTH") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => cfg.channel_default_depth = n,
                _ => {
                    #[cfg(feature = "logging")]
                    log::debug!("[config] ignoring invalid CORE_CHANNEL_DEFAULT_DEPTH={raw:?}");
                }
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_classic() {
        assert_eq!(SchedPolicy::default(), SchedPolicy::Classic);
    }

    #[test]
    fn parse_rejects_unknown_policy() {
        assert!(SchedPolicy::parse("quantum").is_none());
        assert_eq!(SchedPolicy::parse("capacity"), Some(SchedPolicy::Capacity));
    }

    #[test]
    fn defaults_match_static_constants() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.num_workers, DEFAULT_NUM_WORKERS);
        assert_eq!(cfg.stack_size_kb, DEFAULT_STACK_SIZE_KB);
        assert_eq!(cfg.channel_default_depth, DEFAULT_CHANNEL_DEPTH);
    }
}
