//! Attachment materialization on the worker host.
//!
//! Each attachment lands in a task-scoped directory under a sanitized
//! name prefixed with the last eight characters of the task id. Writes go
//! to a temp file first and rename into place; transient failures retry
//! with exponential backoff.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::TaskId;
use crate::protocol::{AttachmentPayload, AttachmentResult};

/// Materialized attachments: the saved paths (for the prompt) and the
/// per-attachment outcomes (for the terminal frame).
#[derive(Debug, Default)]
pub struct Materialized {
    pub saved_paths: Vec<PathBuf>,
    pub results: Vec<AttachmentResult>,
}

/// Strips directory components and shell-hostile characters from a
/// client-supplied filename.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("attachment");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.').to_string();
    if trimmed.is_empty() {
        "attachment".to_string()
    } else {
        trimmed
    }
}

/// Writes every attachment under `dir`, retrying transient failures up to
/// `max_attempts` per attachment. Never fails the task: per-attachment
/// outcomes travel back in the terminal frame.
pub async fn materialize(
    dir: &Path,
    task_id: TaskId,
    attachments: &[AttachmentPayload],
    max_attempts: u32,
) -> Materialized {
    let mut out = Materialized::default();
    if attachments.is_empty() {
        return out;
    }
    if let Err(err) = tokio::fs::create_dir_all(dir).await {
        warn!(error = %err, "attachment directory unavailable");
        for attachment in attachments {
            out.results.push(AttachmentResult {
                name: attachment.name.clone(),
                success: false,
                saved_path: None,
                retries: 0,
                error: Some(format!("create dir: {err}")),
            });
        }
        return out;
    }

    for attachment in attachments {
        let file_name = format!("{}-{}", task_id.short(), sanitize_filename(&attachment.name));
        let target = dir.join(&file_name);

        let bytes = match BASE64.decode(attachment.base64.as_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => {
                out.results.push(AttachmentResult {
                    name: attachment.name.clone(),
                    success: false,
                    saved_path: None,
                    retries: 0,
                    error: Some(format!("base64 decode: {err}")),
                });
                continue;
            }
        };

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match write_atomic(&target, &bytes).await {
                Ok(()) => break Ok(()),
                Err(err) if attempt < max_attempts => {
                    debug!(name = %attachment.name, attempt, error = %err, "attachment write retry");
                    tokio::time::sleep(Duration::from_millis(100 * 2u64.saturating_pow(attempt - 1)))
                        .await;
                }
                Err(err) => break Err(err),
            }
        };

        match outcome {
            Ok(()) => {
                out.saved_paths.push(target.clone());
                out.results.push(AttachmentResult {
                    name: attachment.name.clone(),
                    success: true,
                    saved_path: Some(target.to_string_lossy().into_owned()),
                    retries: attempt - 1,
                    error: None,
                });
            }
            Err(err) => {
                out.results.push(AttachmentResult {
                    name: attachment.name.clone(),
                    success: false,
                    saved_path: None,
                    retries: attempt - 1,
                    error: Some(err.to_string()),
                });
            }
        }
    }
    out
}

/// Temp-then-rename so a crash can never leave a half-written attachment
/// at the final path.
async fn write_atomic(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = target.with_extension("tmp-write");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, target).await
}

/// Removes every file this task materialized.
pub async fn sweep(paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = tokio::fs::remove_file(path).await {
            debug!(path = %path.display(), error = %err, "attachment sweep skipped");
        }
    }
}

/// Prompt suffix listing the saved attachment paths.
#[must_use]
pub fn prompt_suffix(saved: &[PathBuf]) -> Option<String> {
    if saved.is_empty() {
        return None;
    }
    let list = saved
        .iter()
        .map(|p| format!("- {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");
    Some(format!("\n\nAttached files saved on this machine:\n{list}"))
}
