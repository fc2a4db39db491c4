//! Cooperative progress / cancellation signal
//!
//! The native library evaluates images on its own worker threads and only
//! looks at this signal between tiles. The binding writes `kill`, the native
//! side writes `percent` and `eta`; neither side blocks on the other and no
//! latency is promised for a kill request.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// One-way progress signal shared between the binding and the native side.
#[derive(Debug, Default)]
pub struct ProgressSignal {
    percent: AtomicU32,
    eta: AtomicU32,
    tiles: AtomicU64,
    kill: AtomicBool,
}

impl ProgressSignal {
    /// Create a fresh signal (0%, not killed)
    pub fn new() -> Self {
        Self::default()
    }

    /// Percent complete of the most recent evaluation
    pub fn percent(&self) -> u32 {
        self.percent.load(Ordering::Acquire)
    }

    /// Estimated seconds remaining, as reported by the native side
    pub fn eta(&self) -> u32 {
        self.eta.load(Ordering::Acquire)
    }

    /// Number of progress reports received so far
    pub fn reports(&self) -> u64 {
        self.tiles.load(Ordering::Acquire)
    }

    /// Ask the native side to stop at its next tile boundary
    pub fn request_kill(&self) {
        self.kill.store(true, Ordering::Release);
    }

    /// Clear a previous kill request
    pub fn reset(&self) {
        self.kill.store(false, Ordering::Release);
        self.percent.store(0, Ordering::Release);
        self.eta.store(0, Ordering::Release);
    }

    /// Whether a kill has been requested
    pub fn is_killed(&self) -> bool {
        self.kill.load(Ordering::Acquire)
    }

    /// Called by the native side at tile boundaries.
    ///
    /// Returns `true` if evaluation should continue.
    pub fn report(&self, percent: u32, eta: u32) -> bool {
        self.percent.store(percent.min(100), Ordering::Release);
        self.eta.store(eta, Ordering::Release);
        self.tiles.fetch_add(1, Ordering::AcqRel);
        !self.is_killed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_and_kill() {
        let signal = ProgressSignal::new();
        assert!(signal.report(40, 3));
        assert_eq!(signal.percent(), 40);
        assert_eq!(signal.eta(), 3);

        signal.request_kill();
        assert!(!signal.report(50, 2));
        assert_eq!(signal.reports(), 2);

        signal.reset();
        assert!(!signal.is_killed());
        assert_eq!(signal.percent(), 0);
    }

    #[test]
    fn test_percent_is_clamped() {
        let signal = ProgressSignal::new();
        signal.report(250, 0);
        assert_eq!(signal.percent(), 100);
    }
}
