//! Per-task stream buffer with rate-limited flush to the chat surface.
//!
//! One live-updated chat message per active stream. Deltas append to a
//! per-task buffer; a single ticker flushes every dirty stream, posting the
//! message on first flush and updating it afterwards. Content is append-only
//! so the chat message is always a prefix-consistent snapshot — deltas
//! appear in call order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::TaskId;
use crate::notifier::Notifier;

struct StreamState {
    channel_id: String,
    thread_ts: Option<String>,
    content: String,
    message_ts: Option<String>,
    dirty: bool,
    /// A flush is in flight for this stream; the ticker skips it.
    flushing: bool,
}

/// Accumulates stream deltas and flushes them on a fixed tick.
pub struct StreamAccumulator {
    notifier: Arc<Notifier>,
    streams: Mutex<HashMap<TaskId, StreamState>>,
}

impl StreamAccumulator {
    /// Creates an empty accumulator over a notifier.
    #[must_use]
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            notifier,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Appends a delta for a task, creating its stream on first sight.
    pub fn add_delta(&self, task: TaskId, delta: &str, channel_id: &str, thread_ts: Option<&str>) {
        let mut streams = self.streams.lock().expect("stream map lock");
        let state = streams.entry(task).or_insert_with(|| StreamState {
            channel_id: channel_id.to_string(),
            thread_ts: thread_ts.map(ToString::to_string),
            content: String::new(),
            message_ts: None,
            dirty: false,
            flushing: false,
        });
        state.content.push_str(delta);
        state.dirty = true;
    }

    /// Drops a task's stream, returning the buffered text (which the caller
    /// discards — the terminal block is a separate message). Must run
    /// before the terminal block is posted.
    pub fn remove(&self, task: TaskId) -> Option<String> {
        self.streams
            .lock()
            .expect("stream map lock")
            .remove(&task)
            .map(|state| state.content)
    }

    /// Number of active streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.lock().expect("stream map lock").len()
    }

    /// True when no stream is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes every dirty stream once. Exposed separately from the ticker
    /// so tests and shutdown can drive flushes deterministically.
    pub async fn flush_now(&self) {
        let work: Vec<(TaskId, String, Option<String>, String, Option<String>)> = {
            let mut streams = self.streams.lock().expect("stream map lock");
            streams
                .iter_mut()
                .filter(|(_, s)| s.dirty && !s.flushing)
                .map(|(task, s)| {
                    s.dirty = false;
                    s.flushing = true;
                    (
                        *task,
                        s.channel_id.clone(),
                        s.thread_ts.clone(),
                        s.content.clone(),
                        s.message_ts.clone(),
                    )
                })
                .collect()
        };

        for (task, channel, thread, content, message_ts) in work {
            let outcome = match &message_ts {
                Some(ts) => self
                    .notifier
                    .update_message(&channel, ts, &content)
                    .await
                    .map(|()| None),
                None => self
                    .notifier
                    .post_message(&channel, thread.as_deref(), &content)
                    .await
                    .map(Some),
            };

            let mut streams = self.streams.lock().expect("stream map lock");
            if let Some(state) = streams.get_mut(&task) {
                state.flushing = false;
                match outcome {
                    Ok(Some(ts)) => state.message_ts = Some(ts),
                    Ok(None) => {}
                    Err(err) => {
                        // Leave the buffer dirty; the next tick retries with
                        // the full accumulated content.
                        state.dirty = true;
                        warn!(task = %task, error = %err, "stream flush failed");
                    }
                }
            } else {
                debug!(task = %task, "stream removed mid-flush");
            }
        }
    }

    /// Ticker loop: flush every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush_now().await,
                () = cancel.cancelled() => {
                    // Final flush so nothing buffered is lost on shutdown.
                    self.flush_now().await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{ChatApi, ChatApiError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct RecordingApi {
        posts: Mutex<Vec<(String, String)>>,
        updates: Mutex<Vec<(String, String)>>,
        ts_seq: AtomicU64,
    }

    #[async_trait]
    impl ChatApi for RecordingApi {
        async fn post_message(
            &self,
            channel: &str,
            _thread_ts: Option<&str>,
            text: &str,
        ) -> Result<String, ChatApiError> {
            self.posts
                .lock()
                .unwrap()
                .push((channel.to_string(), text.to_string()));
            Ok(format!("ts-{}", self.ts_seq.fetch_add(1, Ordering::SeqCst)))
        }

        async fn post_blocks(
            &self,
            channel: &str,
            thread_ts: Option<&str>,
            fallback_text: &str,
            _blocks: &serde_json::Value,
        ) -> Result<String, ChatApiError> {
            self.post_message(channel, thread_ts, fallback_text).await
        }

        async fn update_message(
            &self,
            _channel: &str,
            ts: &str,
            text: &str,
        ) -> Result<(), ChatApiError> {
            self.updates
                .lock()
                .unwrap()
                .push((ts.to_string(), text.to_string()));
            Ok(())
        }

        async fn add_reaction(&self, _: &str, _: &str, _: &str) -> Result<(), ChatApiError> {
            Ok(())
        }
        async fn remove_reaction(&self, _: &str, _: &str, _: &str) -> Result<(), ChatApiError> {
            Ok(())
        }
        async fn post_ephemeral(&self, _: &str, _: &str, _: &str) -> Result<(), ChatApiError> {
            Ok(())
        }
        async fn upload_file(&self, _: &str, _: &str, _: &[u8]) -> Result<(), ChatApiError> {
            Ok(())
        }
    }

    fn accumulator() -> (Arc<RecordingApi>, StreamAccumulator) {
        let api = Arc::new(RecordingApi::default());
        let notifier = Arc::new(Notifier::new(
            api.clone(),
            3,
            Duration::from_millis(1),
            10,
        ));
        (api, StreamAccumulator::new(notifier))
    }

    #[tokio::test]
    async fn first_flush_posts_then_updates() {
        let (api, acc) = accumulator();
        let task = TaskId::generate();

        acc.add_delta(task, "A", "C1", None);
        acc.flush_now().await;
        acc.add_delta(task, "B", "C1", None);
        acc.add_delta(task, "C", "C1", None);
        acc.flush_now().await;

        let posts = api.posts.lock().unwrap().clone();
        let updates = api.updates.lock().unwrap().clone();
        assert_eq!(posts, vec![("C1".to_string(), "A".to_string())]);
        assert_eq!(updates, vec![("ts-0".to_string(), "ABC".to_string())]);
    }

    #[tokio::test]
    async fn final_content_equals_concatenation_in_call_order() {
        let (api, acc) = accumulator();
        let task = TaskId::generate();

        for i in 0..20 {
            acc.add_delta(task, &format!("{i},"), "C1", None);
            if i % 3 == 0 {
                acc.flush_now().await;
            }
        }
        acc.flush_now().await;

        let expected: String = (0..20).map(|i| format!("{i},")).collect();
        let updates = api.updates.lock().unwrap();
        let last = updates.last().map(|(_, text)| text.clone()).unwrap();
        assert_eq!(last, expected);
    }

    #[tokio::test]
    async fn clean_streams_are_not_reflushed() {
        let (api, acc) = accumulator();
        let task = TaskId::generate();
        acc.add_delta(task, "A", "C1", None);
        acc.flush_now().await;
        acc.flush_now().await;
        acc.flush_now().await;

        assert_eq!(api.posts.lock().unwrap().len(), 1);
        assert!(api.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_drops_the_buffer() {
        let (api, acc) = accumulator();
        let task = TaskId::generate();
        acc.add_delta(task, "partial", "C1", None);
        let dropped = acc.remove(task);
        assert_eq!(dropped.as_deref(), Some("partial"));
        acc.flush_now().await;
        assert!(api.posts.lock().unwrap().is_empty());
        assert!(acc.is_empty());
    }
}
