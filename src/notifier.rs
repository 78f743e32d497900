//! Chat API wrapper: retries, failed-send queue, metrics.
//!
//! The workspace API itself is external; [`ChatApi`] is its capability
//! contract and tests drive a recording mock. Every call runs under the
//! same retry policy: exponential backoff with jitter and a bounded
//! attempt count, with known terminal errors short-circuiting immediately.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Chat API failure classes.
#[derive(Debug, Error, Clone)]
pub enum ChatApiError {
    /// Retryable: rate limits, 5xx, connection resets.
    #[error("chat api transient failure: {message}")]
    Transient { message: String },

    /// Not retryable: the API rejected the request outright.
    #[error("chat api terminal error: {code}")]
    Terminal { code: String },
}

impl ChatApiError {
    /// Reaction races the API reports as already settled.
    #[must_use]
    pub fn is_benign_reaction_race(&self) -> bool {
        matches!(
            self,
            Self::Terminal { code } if code == "already_reacted" || code == "no_reaction"
        )
    }
}

/// Capability contract of the chat workspace.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Posts a message, returning its timestamp id.
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<String, ChatApiError>;

    /// Posts a block-kit message, returning its timestamp id.
    async fn post_blocks(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        fallback_text: &str,
        blocks: &serde_json::Value,
    ) -> Result<String, ChatApiError>;

    /// Replaces the text of an existing message.
    async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        text: &str,
    ) -> Result<(), ChatApiError>;

    /// Adds a reaction to a message.
    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatApiError>;

    /// Removes a reaction from a message.
    async fn remove_reaction(
        &self,
        channel: &str,
        ts: &str,
        name: &str,
    ) -> Result<(), ChatApiError>;

    /// Posts a message visible only to one user.
    async fn post_ephemeral(
        &self,
        channel: &str,
        user: &str,
        text: &str,
    ) -> Result<(), ChatApiError>;

    /// Uploads a file into a channel.
    async fn upload_file(
        &self,
        channel: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<(), ChatApiError>;
}

/// Notifier failure after retry exhaustion.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("chat send failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ChatApiError },

    #[error("chat send rejected: {source}")]
    Rejected {
        #[source]
        source: ChatApiError,
    },
}

/// A send that exhausted its retries, kept for admin inspection.
#[derive(Debug, Clone, Serialize)]
pub struct FailedNotification {
    pub kind: String,
    pub channel: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Send counters plus a coarse latency histogram (ms buckets).
#[derive(Debug, Default)]
pub struct NotifierMetrics {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    /// Buckets: <100ms, <500ms, <2000ms, >=2000ms.
    pub latency_buckets: [AtomicU64; 4],
}

impl NotifierMetrics {
    fn observe(&self, elapsed: Duration) {
        let ms = elapsed.as_millis();
        let idx = if ms < 100 {
            0
        } else if ms < 500 {
            1
        } else if ms < 2_000 {
            2
        } else {
            3
        };
        self.latency_buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Serializable view for the admin API.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "sent": self.sent.load(Ordering::Relaxed),
            "failed": self.failed.load(Ordering::Relaxed),
            "latencyMsBuckets": {
                "lt100": self.latency_buckets[0].load(Ordering::Relaxed),
                "lt500": self.latency_buckets[1].load(Ordering::Relaxed),
                "lt2000": self.latency_buckets[2].load(Ordering::Relaxed),
                "gte2000": self.latency_buckets[3].load(Ordering::Relaxed),
            }
        })
    }
}

/// Retrying wrapper around a [`ChatApi`].
pub struct Notifier {
    api: std::sync::Arc<dyn ChatApi>,
    max_attempts: u32,
    base_delay: Duration,
    metrics: NotifierMetrics,
    failed: Mutex<VecDeque<FailedNotification>>,
    failed_cap: usize,
}

impl Notifier {
    /// Wraps a chat API with the given retry policy.
    #[must_use]
    pub fn new(
        api: std::sync::Arc<dyn ChatApi>,
        max_attempts: u32,
        base_delay: Duration,
        failed_cap: usize,
    ) -> Self {
        Self {
            api,
            max_attempts: max_attempts.max(1),
            base_delay,
            metrics: NotifierMetrics::default(),
            failed: Mutex::new(VecDeque::new()),
            failed_cap,
        }
    }

    /// Send/latency counters.
    #[must_use]
    pub fn metrics(&self) -> &NotifierMetrics {
        &self.metrics
    }

    /// Drained copy of the failed-send queue.
    #[must_use]
    pub fn failed_notifications(&self) -> Vec<FailedNotification> {
        self.failed
            .lock()
            .expect("failed queue lock")
            .iter()
            .cloned()
            .collect()
    }

    fn record_failure(&self, kind: &str, channel: &str, error: &ChatApiError) {
        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
        let mut failed = self.failed.lock().expect("failed queue lock");
        if failed.len() >= self.failed_cap {
            failed.pop_front();
        }
        failed.push_back(FailedNotification {
            kind: kind.to_string(),
            channel: channel.to_string(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    async fn with_retry<T, F, Fut>(
        &self,
        kind: &str,
        channel: &str,
        mut call: F,
    ) -> Result<T, NotifyError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ChatApiError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = std::time::Instant::now();
            match call().await {
                Ok(value) => {
                    self.metrics.sent.fetch_add(1, Ordering::Relaxed);
                    self.metrics.observe(started.elapsed());
                    return Ok(value);
                }
                Err(err @ ChatApiError::Terminal { .. }) => {
                    debug!(kind, channel, error = %err, "terminal chat error, not retrying");
                    self.record_failure(kind, channel, &err);
                    return Err(NotifyError::Rejected { source: err });
                }
                Err(err) => {
                    if attempt >= self.max_attempts {
                        warn!(kind, channel, attempts = attempt, error = %err, "chat send exhausted");
                        self.record_failure(kind, channel, &err);
                        return Err(NotifyError::Exhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }
                    let backoff = self.base_delay * 2u32.saturating_pow(attempt - 1);
                    let jitter =
                        Duration::from_millis(rand::thread_rng().gen_range(0..=backoff.as_millis().min(250) as u64));
                    tokio::time::sleep(backoff + jitter).await;
                }
            }
        }
    }

    /// Posts a message with retries, returning its timestamp id.
    pub async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<String, NotifyError> {
        self.with_retry("post_message", channel, || {
            self.api.post_message(channel, thread_ts, text)
        })
        .await
    }

    /// Posts a block message with retries.
    pub async fn post_blocks(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        fallback_text: &str,
        blocks: &serde_json::Value,
    ) -> Result<String, NotifyError> {
        self.with_retry("post_blocks", channel, || {
            self.api.post_blocks(channel, thread_ts, fallback_text, blocks)
        })
        .await
    }

    /// Updates a message with retries.
    pub async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        text: &str,
    ) -> Result<(), NotifyError> {
        self.with_retry("update_message", channel, || {
            self.api.update_message(channel, ts, text)
        })
        .await
    }

    /// Adds a reaction; an `already_reacted` response counts as success.
    pub async fn add_reaction(
        &self,
        channel: &str,
        ts: &str,
        name: &str,
    ) -> Result<(), NotifyError> {
        match self
            .with_retry("add_reaction", channel, || {
                self.api.add_reaction(channel, ts, name)
            })
            .await
        {
            Err(NotifyError::Rejected { source }) if source.is_benign_reaction_race() => Ok(()),
            other => other,
        }
    }

    /// Removes a reaction; a `no_reaction` response counts as success.
    pub async fn remove_reaction(
        &self,
        channel: &str,
        ts: &str,
        name: &str,
    ) -> Result<(), NotifyError> {
        match self
            .with_retry("remove_reaction", channel, || {
                self.api.remove_reaction(channel, ts, name)
            })
            .await
        {
            Err(NotifyError::Rejected { source }) if source.is_benign_reaction_race() => Ok(()),
            other => other,
        }
    }

    /// Removes one reaction and adds another on the same message.
    pub async fn swap_reaction(
        &self,
        channel: &str,
        ts: &str,
        from: &str,
        to: &str,
    ) -> Result<(), NotifyError> {
        self.remove_reaction(channel, ts, from).await?;
        self.add_reaction(channel, ts, to).await
    }

    /// Posts an ephemeral message with retries.
    pub async fn post_ephemeral(
        &self,
        channel: &str,
        user: &str,
        text: &str,
    ) -> Result<(), NotifyError> {
        self.with_retry("post_ephemeral", channel, || {
            self.api.post_ephemeral(channel, user, text)
        })
        .await
    }

    /// Uploads a file with retries.
    pub async fn upload_file(
        &self,
        channel: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<(), NotifyError> {
        self.with_retry("upload_file", channel, || {
            self.api.upload_file(channel, filename, content)
        })
        .await
    }
}
