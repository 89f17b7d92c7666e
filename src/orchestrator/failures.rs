//! Consecutive-failure tracking for escalation

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::events::ErrorKind;

/// Tracks the current streak of same-kind failures inside a rolling window
#[derive(Debug)]
pub struct FailureTracker {
    window: Duration,
    threshold: u32,
    kind: Option<ErrorKind>,
    streak: VecDeque<Instant>,
}

impl FailureTracker {
    /// Escalate after `threshold` same-kind failures within `window`
    #[must_use]
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            kind: None,
            streak: VecDeque::new(),
        }
    }

    /// Record a failure; returns true if it escalates
    pub fn record_failure(&mut self, kind: ErrorKind, now: Instant) -> bool {
        if !kind.escalates() {
            return false;
        }

        if self.kind != Some(kind) {
            self.kind = Some(kind);
            self.streak.clear();
        }

        while self
            .streak
            .front()
            .is_some_and(|&at| now.duration_since(at) > self.window)
        {
            self.streak.pop_front();
        }
        self.streak.push_back(now);

        let count = u32::try_from(self.streak.len()).unwrap_or(u32::MAX);
        tracing::debug!(?kind, count, threshold = self.threshold, "failure recorded");

        if count >= self.threshold {
            self.reset();
            return true;
        }
        false
    }

    /// A success of the operation that fails with `kind` ends its streak
    pub fn record_success(&mut self, kind: ErrorKind) {
        if self.kind == Some(kind) {
            self.reset();
        }
    }

    /// Current streak length for `kind`
    #[must_use]
    pub fn streak(&self, kind: ErrorKind) -> usize {
        if self.kind == Some(kind) {
            self.streak.len()
        } else {
            0
        }
    }

    fn reset(&mut self) {
        self.kind = None;
        self.streak.clear();
    }
}
