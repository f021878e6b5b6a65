//! Rolling-window circuit breaker for remote-error bursts.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::warn;

/// Trips when at least half of the recent item outcomes were remote
/// errors. Shared across the metadata workers; once open it stays open for
/// the rest of the run (the stage halts rather than hammering a service
/// that is answering garbage).
pub struct FailureBreaker {
    window: Mutex<BreakerState>,
    capacity: usize,
    min_samples: usize,
    threshold: f64,
}

#[derive(Debug, Default)]
struct BreakerState {
    outcomes: VecDeque<bool>,
    tripped: bool,
}

impl FailureBreaker {
    pub fn new(capacity: usize, min_samples: usize, threshold: f64) -> Self {
        Self {
            window: Mutex::new(BreakerState::default()),
            capacity: capacity.max(1),
            min_samples: min_samples.max(1),
            threshold,
        }
    }

    /// Record one item outcome; `failed` means a remote error.
    pub fn record(&self, failed: bool) {
        let Ok(mut state) = self.window.lock() else {
            return;
        };
        if state.outcomes.len() == self.capacity {
            state.outcomes.pop_front();
        }
        state.outcomes.push_back(failed);

        if state.outcomes.len() >= self.min_samples && !state.tripped {
            let failures = state.outcomes.iter().filter(|&&f| f).count();
            let ratio = failures as f64 / state.outcomes.len() as f64;
            if ratio >= self.threshold {
                warn!(
                    failures,
                    window = state.outcomes.len(),
                    "remote error ratio {ratio:.2} tripped the circuit breaker"
                );
                state.tripped = true;
            }
        }
    }

    /// True once the failure ratio has crossed the threshold.
    pub fn tripped(&self) -> bool {
        self.window.lock().map(|s| s.tripped).unwrap_or(false)
    }
}

impl Default for FailureBreaker {
    fn default() -> Self {
        // Half of the last twenty items, judged only once ten are seen.
        Self::new(20, 10, 0.5)
    }
}
