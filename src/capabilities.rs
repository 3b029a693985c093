//! Environment capability probe.

use std::sync::OnceLock;

/// What the host environment offers for parallel evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether isolated workers can run truly in parallel.
    pub multi_threading: bool,
    pub logical_cores: usize,
}

impl Capabilities {
    /// Capabilities of an environment with no parallel workers.
    pub fn single_threaded() -> Self {
        Self { multi_threading: false, logical_cores: 1 }
    }
}

fn detect() -> Capabilities {
    let logical_cores = num_cpus::get().max(1);
    Capabilities {
        multi_threading: cfg!(not(target_family = "wasm")),
        logical_cores,
    }
}

/// Probe once per process; later calls return the cached answer.
pub fn probe() -> Capabilities {
    static CACHED: OnceLock<Capabilities> = OnceLock::new();
    *CACHED.get_or_init(detect)
}

/// Default pool size: one worker per logical core.
pub fn default_pool_size() -> usize {
    probe().logical_cores
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_is_stable() {
        assert_eq!(probe(), probe());
        assert!(probe().logical_cores >= 1);
    }

    #[test]
    fn test_native_targets_support_threads() {
        assert!(probe().multi_threading);
    }

    #[test]
    fn test_default_pool_size_matches_cores() {
        assert_eq!(default_pool_size(), num_cpus::get().max(1));
    }
}
