//! Per-task tool-use progress trackers.
//!
//! One consolidated chat message per task holding the last eight step
//! descriptions: the newest step renders in-progress, the earlier ones as
//! done. The map is bounded (LRU eviction at the cap) and TTL-swept so
//! abandoned tasks cannot grow it without bound.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::TaskId;
use crate::notifier::Notifier;

const MAX_STEPS: usize = 8;

struct TrackerEntry {
    channel_id: String,
    thread_ts: Option<String>,
    message_ts: Option<String>,
    steps: VecDeque<String>,
    created_at: Instant,
    last_update: Instant,
}

impl TrackerEntry {
    fn render(&self) -> String {
        let mut lines = Vec::with_capacity(self.steps.len() + 1);
        lines.push("*Working…*".to_string());
        for (i, step) in self.steps.iter().enumerate() {
            let icon = if i + 1 == self.steps.len() { "🔄" } else { "✅" };
            lines.push(format!("{icon} {step}"));
        }
        lines.join("\n")
    }
}

/// Bounded task → progress-message map.
pub struct ProgressTrackers {
    notifier: Arc<Notifier>,
    map: Mutex<HashMap<TaskId, TrackerEntry>>,
    max_trackers: usize,
    ttl: Duration,
}

impl ProgressTrackers {
    /// Creates the tracker map.
    #[must_use]
    pub fn new(notifier: Arc<Notifier>, max_trackers: usize, ttl: Duration) -> Self {
        Self {
            notifier,
            map: Mutex::new(HashMap::new()),
            max_trackers,
            ttl,
        }
    }

    /// Appends a step for a task and posts or updates its consolidated
    /// message.
    pub async fn record_step(
        &self,
        task: TaskId,
        channel_id: &str,
        thread_ts: Option<&str>,
        description: &str,
    ) {
        let (text, message_ts, channel, thread) = {
            let mut map = self.map.lock().expect("progress map lock");

            if !map.contains_key(&task) && map.len() >= self.max_trackers {
                // Evict the oldest tracker by creation time.
                if let Some(oldest) = map
                    .iter()
                    .min_by_key(|(_, entry)| entry.created_at)
                    .map(|(id, _)| *id)
                {
                    debug!(task = %oldest, "progress tracker evicted (map full)");
                    map.remove(&oldest);
                }
            }

            let now = Instant::now();
            let entry = map.entry(task).or_insert_with(|| TrackerEntry {
                channel_id: channel_id.to_string(),
                thread_ts: thread_ts.map(ToString::to_string),
                message_ts: None,
                steps: VecDeque::new(),
                created_at: now,
                last_update: now,
            });
            if entry.steps.len() >= MAX_STEPS {
                entry.steps.pop_front();
            }
            entry.steps.push_back(description.to_string());
            entry.last_update = now;
            (
                entry.render(),
                entry.message_ts.clone(),
                entry.channel_id.clone(),
                entry.thread_ts.clone(),
            )
        };

        match message_ts {
            Some(ts) => {
                if let Err(err) = self.notifier.update_message(&channel, &ts, &text).await {
                    warn!(task = %task, error = %err, "progress update failed");
                }
            }
            None => match self
                .notifier
                .post_message(&channel, thread.as_deref(), &text)
                .await
            {
                Ok(ts) => {
                    let mut map = self.map.lock().expect("progress map lock");
                    if let Some(entry) = map.get_mut(&task) {
                        entry.message_ts = Some(ts);
                    }
                }
                Err(err) => warn!(task = %task, error = %err, "progress post failed"),
            },
        }
    }

    /// Drops the tracker for a finished task.
    pub fn remove(&self, task: TaskId) {
        self.map.lock().expect("progress map lock").remove(&task);
    }

    /// Number of live trackers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().expect("progress map lock").len()
    }

    /// True when no tracker is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops trackers idle past the TTL. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let mut map = self.map.lock().expect("progress map lock");
        let before = map.len();
        map.retain(|_, entry| entry.last_update.elapsed() < self.ttl);
        before - map.len()
    }

    /// Sweep loop, one pass per `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = self.sweep_expired();
                    if swept > 0 {
                        debug!(swept, "expired progress trackers dropped");
                    }
                }
                () = cancel.cancelled() => return,
            }
        }
    }
}

/// Builds the human-readable line for a tool-use progress message.
///
/// The agent already formats most descriptors; this normalizes whatever
/// arrives so the consolidated message stays single-line per step.
#[must_use]
pub fn step_description(raw: &str) -> String {
    let line = raw.lines().next().unwrap_or("");
    if line.chars().count() > 160 {
        let truncated: String = line.chars().take(159).collect();
        format!("{truncated}…")
    } else {
        line.to_string()
    }
}
