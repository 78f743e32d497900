//! Per-agent circuit breaker over a rolling outcome window.
//!
//! The breaker is advisory: dispatch to a pinned agent is still allowed
//! while its circuit is open (the task queues), but `auto` selection and
//! the admin surface honor it.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::BreakerConfig;
use crate::domain::AgentId;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    records: VecDeque<(Instant, bool)>,
    state: BreakerState,
    state_changed_at: Instant,
    half_open_successes: u32,
}

impl Breaker {
    fn new(now: Instant) -> Self {
        Self {
            records: VecDeque::new(),
            state: BreakerState::Closed,
            state_changed_at: now,
            half_open_successes: 0,
        }
    }

    fn evict_before(&mut self, cutoff: Instant) {
        while let Some(&(ts, _)) = self.records.front() {
            if ts < cutoff {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_percentage(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        let failures = self.records.iter().filter(|(_, ok)| !ok).count();
        (failures as f64 / self.records.len() as f64) * 100.0
    }
}

/// Admin-facing breaker view.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub agent_id: String,
    pub state: BreakerState,
    pub window_total: usize,
    pub failure_percentage: f64,
}

/// Rolling-window health tracker, one breaker per agent.
pub struct HealthTracker {
    config: BreakerConfig,
    breakers: DashMap<AgentId, Breaker>,
}

impl HealthTracker {
    /// Creates the tracker with the given breaker tuning.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_size_ms)
    }

    fn recovery(&self) -> Duration {
        Duration::from_millis(self.config.recovery_timeout_ms)
    }

    /// Records a terminal task outcome for an agent.
    pub fn record_outcome(&self, agent: &AgentId, success: bool) {
        self.record_outcome_at(agent, success, Instant::now());
    }

    fn record_outcome_at(&self, agent: &AgentId, success: bool, now: Instant) {
        let mut breaker = self
            .breakers
            .entry(agent.clone())
            .or_insert_with(|| Breaker::new(now));

        match breaker.state {
            BreakerState::Closed => {
                breaker.records.push_back((now, success));
                if let Some(cutoff) = now.checked_sub(self.window()) {
                    breaker.evict_before(cutoff);
                }
                let total = breaker.records.len();
                if total >= self.config.minimum_request_count
                    && breaker.failure_percentage()
                        >= f64::from(self.config.failure_percentage_threshold.into_inner())
                {
                    breaker.state = BreakerState::Open;
                    breaker.state_changed_at = now;
                }
            }
            BreakerState::HalfOpen => {
                if success {
                    breaker.half_open_successes += 1;
                    if breaker.half_open_successes >= self.config.success_threshold_count {
                        breaker.state = BreakerState::Closed;
                        breaker.state_changed_at = now;
                        breaker.half_open_successes = 0;
                        breaker.records.clear();
                    }
                } else {
                    breaker.state = BreakerState::Open;
                    breaker.state_changed_at = now;
                    breaker.half_open_successes = 0;
                }
            }
            BreakerState::Open => {
                // Outcomes of tasks dispatched before the trip still land
                // here; they neither extend nor shorten the open period.
            }
        }
    }

    /// Whether a new dispatch should be offered to the agent. An open
    /// breaker past its recovery timeout transitions to half-open and
    /// allows the probe.
    pub fn allow_request(&self, agent: &AgentId) -> bool {
        self.allow_request_at(agent, Instant::now())
    }

    fn allow_request_at(&self, agent: &AgentId, now: Instant) -> bool {
        let Some(mut breaker) = self.breakers.get_mut(agent) else {
            return true;
        };
        match breaker.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if now.duration_since(breaker.state_changed_at) >= self.recovery() {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.state_changed_at = now;
                    breaker.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Current state for an agent (closed when unknown).
    #[must_use]
    pub fn state(&self, agent: &AgentId) -> BreakerState {
        self.breakers
            .get(agent)
            .map_or(BreakerState::Closed, |b| b.state)
    }

    /// Admin snapshot of every tracked breaker.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| BreakerSnapshot {
                agent_id: entry.key().as_str().to_string(),
                state: entry.state,
                window_total: entry.records.len(),
                failure_percentage: entry.failure_percentage(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentId {
        AgentId::try_new("worker-1".to_string()).unwrap()
    }

    fn tracker(minimum: usize, window_ms: u64, recovery_ms: u64) -> HealthTracker {
        HealthTracker::new(BreakerConfig {
            minimum_request_count: minimum,
            window_size_ms: window_ms,
            recovery_timeout_ms: recovery_ms,
            ..BreakerConfig::default()
        })
    }

    #[test]
    fn opens_exactly_at_threshold_with_minimum_count() {
        let tracker = tracker(10, 60_000, 60_000);
        let a = agent();
        let now = Instant::now();

        for _ in 0..5 {
            tracker.record_outcome_at(&a, true, now);
        }
        for i in 0..5 {
            tracker.record_outcome_at(&a, false, now);
            if i < 4 {
                // At count 9 the breaker must stay closed even at 50%+.
                assert_eq!(tracker.state(&a), BreakerState::Closed, "i={i}");
            }
        }
        // Count 10, failure rate exactly 50%: opens.
        assert_eq!(tracker.state(&a), BreakerState::Open);
    }

    #[test]
    fn stays_closed_below_minimum_count() {
        let tracker = tracker(10, 60_000, 60_000);
        let a = agent();
        let now = Instant::now();
        for _ in 0..9 {
            tracker.record_outcome_at(&a, false, now);
        }
        assert_eq!(tracker.state(&a), BreakerState::Closed);
    }

    #[test]
    fn open_rejects_until_recovery_then_half_opens() {
        let tracker = tracker(2, 60_000, 1_000);
        let a = agent();
        let now = Instant::now();
        tracker.record_outcome_at(&a, false, now);
        tracker.record_outcome_at(&a, false, now);
        assert_eq!(tracker.state(&a), BreakerState::Open);

        assert!(!tracker.allow_request_at(&a, now + Duration::from_millis(500)));
        assert!(tracker.allow_request_at(&a, now + Duration::from_millis(1_100)));
        assert_eq!(tracker.state(&a), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_success_threshold_and_reopens_on_failure() {
        let tracker = tracker(2, 60_000, 0);
        let a = agent();
        let now = Instant::now();
        tracker.record_outcome_at(&a, false, now);
        tracker.record_outcome_at(&a, false, now);
        assert!(tracker.allow_request_at(&a, now));
        assert_eq!(tracker.state(&a), BreakerState::HalfOpen);

        tracker.record_outcome_at(&a, true, now);
        tracker.record_outcome_at(&a, true, now);
        assert_eq!(tracker.state(&a), BreakerState::HalfOpen);
        tracker.record_outcome_at(&a, true, now);
        assert_eq!(tracker.state(&a), BreakerState::Closed);

        // Trip again, probe, then fail the probe: straight back to open.
        tracker.record_outcome_at(&a, false, now);
        tracker.record_outcome_at(&a, false, now);
        assert_eq!(tracker.state(&a), BreakerState::Open);
        assert!(tracker.allow_request_at(&a, now));
        tracker.record_outcome_at(&a, false, now);
        assert_eq!(tracker.state(&a), BreakerState::Open);
    }

    #[test]
    fn records_older_than_window_are_evicted() {
        let tracker = tracker(3, 1_000, 60_000);
        let a = agent();
        let start = Instant::now();
        tracker.record_outcome_at(&a, false, start);
        tracker.record_outcome_at(&a, false, start);
        // Two seconds later the old failures have aged out of the window.
        let later = start + Duration::from_secs(2);
        tracker.record_outcome_at(&a, false, later);
        tracker.record_outcome_at(&a, false, later);
        tracker.record_outcome_at(&a, true, later);
        // Window holds 3 records, 2 failures = 66% >= 50% at minimum 3.
        assert_eq!(tracker.state(&a), BreakerState::Open);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot[0].window_total, 3);
    }
}
