//! Block-kit payload builders for the chat surface.
//!
//! Terminal blocks are always a fresh message, never an update of the
//! stream message, so a late stream flush can never clobber them.

use serde_json::{Value, json};

use crate::domain::Task;
use crate::protocol::TaskComplete;

fn section(text: String) -> Value {
    json!({ "type": "section", "text": { "type": "mrkdwn", "text": text } })
}

fn context(text: String) -> Value {
    json!({ "type": "context", "elements": [{ "type": "mrkdwn", "text": text }] })
}

/// Posted when a task is parked in the offline queue.
#[must_use]
pub fn queued(task: &Task, agent: &str, ttl_hours: u64) -> Value {
    json!([
        section(format!(
            "📥 Task queued for `{agent}` (offline). It will run when the agent reconnects."
        )),
        context(format!(
            "task `{}` · bot `{}` · expires in {ttl_hours}h",
            task.id, task.bot_name
        )),
    ])
}

/// Terminal success blocks.
#[must_use]
pub fn completed(task: &Task, payload: &TaskComplete) -> Value {
    let mut lines = vec![section(format!("✅ *Task complete*\n{}", payload.result))];
    if !payload.files_changed.is_empty() {
        let files = payload
            .files_changed
            .iter()
            .map(|f| format!("`{f}`"))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(section(format!("*Files changed:* {files}")));
    }
    if !payload.commands_run.is_empty() {
        let cmds = payload
            .commands_run
            .iter()
            .map(|c| format!("`{c}`"))
            .collect::<Vec<_>>()
            .join("\n");
        lines.push(section(format!("*Commands run:*\n{cmds}")));
    }
    lines.push(context(format!(
        "task `{}` · {} in / {} out tokens · ${:.4} · {}ms · {} continuation(s)",
        task.id,
        payload.input_tokens,
        payload.output_tokens,
        payload.estimated_cost,
        payload.duration_ms,
        payload.continuations,
    )));
    Value::Array(lines)
}

/// Terminal failure blocks.
#[must_use]
pub fn failed(task: &Task, error: &str, recoverable: bool) -> Value {
    let hint = if recoverable {
        "\nThe session is preserved — resubmit to continue where it stopped."
    } else {
        ""
    };
    json!([
        section(format!("❌ *Task failed*\n{error}{hint}")),
        context(format!("task `{}` · bot `{}`", task.id, task.bot_name)),
    ])
}

/// Posted when a task-ack rejects the task.
#[must_use]
pub fn rejected(task: &Task, reason: &str) -> Value {
    json!([
        section(format!("❌ *Task rejected by agent*\n{reason}")),
        context(format!("task `{}`", task.id)),
    ])
}

/// Aggregate summary posted once every subtask of a parent is terminal.
#[must_use]
pub fn parent_summary(parent: &Task, children: &[Task]) -> Value {
    let completed = children
        .iter()
        .filter(|c| c.status == crate::domain::TaskStatus::Completed)
        .count();
    let failed = children
        .iter()
        .filter(|c| c.status == crate::domain::TaskStatus::Failed)
        .count();
    let cancelled = children.len() - completed - failed;
    let total_cost: f64 = children.iter().map(|c| c.estimated_cost).sum();

    let mut merged_files: Vec<String> = Vec::new();
    for child in children {
        for file in &child.files_changed {
            crate::domain::task::push_unique(&mut merged_files, file.clone());
        }
    }
    let files_line = if merged_files.is_empty() {
        "none".to_string()
    } else {
        merged_files
            .iter()
            .map(|f| format!("`{f}`"))
            .collect::<Vec<_>>()
            .join(", ")
    };

    json!([
        section(format!(
            "📋 *Subtasks finished* — {completed} completed, {failed} failed, {cancelled} cancelled"
        )),
        section(format!("*Files changed:* {files_line}")),
        context(format!(
            "parent `{}` · {} subtask(s) · total ${total_cost:.4}",
            parent.id,
            children.len()
        )),
    ])
}

/// Deploy outcome message for the originating chat location.
#[must_use]
pub fn deploy_outcome(success: bool, output: &str, logs_url: Option<&str>) -> Value {
    let head = if success {
        "🚀 *Deploy succeeded*"
    } else {
        "❌ *Deploy failed*"
    };
    let mut lines = vec![section(format!("{head}\n```{output}```"))];
    if let Some(url) = logs_url {
        lines.push(context(format!("<{url}|build logs>")));
    }
    Value::Array(lines)
}
