//! Tunable constants the design leaves as policy rather than invariant.
//!
//! `GcConfig` carries no environment or on-disk binding: the collector core
//! reads neither, by design. Embedders pass a `GcConfig` explicitly to
//! [`crate::GarbageCollector::new`] or use [`GcConfig::default`].
use std::time::Duration;

/// Collector/session tuning knobs.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Bound passed to [`crate::GarbageCollector::wait_for_handshake`]. Not
    /// read by `run_cycle`/`run_until`, which never block on a session:
    /// this is for an embedder that drives the collector from a thread it
    /// knows is never itself a mutator, and wants to wake promptly on a
    /// publish rather than spin-polling.
    pub handshake_timeout: Duration,
    /// Number of consecutive handshakes a tracing bit must go un-shaded
    /// before it is promoted to the deleting mask. The design calls for 3;
    /// tests shrink this to reach S6's recycling scenario in fewer cycles.
    pub stability_handshakes: u8,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            handshake_timeout: Duration::from_secs(1),
            stability_handshakes: 3,
        }
    }
}

impl GcConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_stability_handshakes(mut self, count: u8) -> Self {
        self.stability_handshakes = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_compose() {
        let config = GcConfig::default()
            .with_stability_handshakes(1)
            .with_handshake_timeout(Duration::from_millis(10));
        assert_eq!(config.stability_handshakes, 1);
        assert_eq!(config.handshake_timeout, Duration::from_millis(10));
    }
}
