//! End-to-end component scenarios: submit → dispatch → agent frames →
//! router effects, with the chat API and agent connection mocked at their
//! seams.

mod common;

use chrono::Utc;
use common::{Harness, drain_frames, submit_request};
use foreman::domain::{BotName, ChatUserId, TaskStatus};
use foreman::protocol::{Frame, TaskAck, TaskComplete, TaskError, TaskStream};

fn ack(task_id: foreman::domain::TaskId) -> Frame {
    Frame::TaskAck(TaskAck {
        task_id,
        accepted: true,
        reason: None,
    })
}

fn complete(task_id: foreman::domain::TaskId, result: &str, cost: f64) -> Frame {
    Frame::TaskComplete(TaskComplete {
        task_id,
        result: result.to_string(),
        session_id: Some("s1".to_string()),
        input_tokens: 100,
        output_tokens: 200,
        estimated_cost: cost,
        files_changed: vec!["src/login.rs".to_string()],
        commands_run: vec!["cargo test".to_string()],
        duration_ms: 1_500,
        continuations: 0,
        attachment_results: None,
    })
}

fn stream(task_id: foreman::domain::TaskId, delta: &str) -> Frame {
    Frame::TaskStream(TaskStream {
        task_id,
        delta: delta.to_string(),
        timestamp: Utc::now(),
    })
}

#[tokio::test]
async fn s1_happy_path_streams_then_completes() {
    let harness = Harness::new().await;
    let project = harness.project("C0123", "worker-1").await;
    let (agent, mut rx, _) = harness.connect_agent("worker-1");

    let task_id = harness
        .commands
        .submit(submit_request(&project, "fix the login bug"))
        .await
        .unwrap();
    assert_eq!(harness.task(task_id).await.status, TaskStatus::Pending);

    let frames = drain_frames(&mut rx);
    assert_eq!(frames.len(), 1);
    let Frame::TaskSubmit(submit) = &frames[0] else {
        panic!("expected task-submit, got {frames:?}");
    };
    assert_eq!(submit.task_id, task_id);
    assert_eq!(submit.prompt, "fix the login bug");

    harness.router.handle_frame(&agent, ack(task_id)).await;
    assert_eq!(harness.task(task_id).await.status, TaskStatus::Running);

    for delta in ["A", "B", "C"] {
        harness.router.handle_frame(&agent, stream(task_id, delta)).await;
    }
    harness.accumulator.flush_now().await;

    harness
        .router
        .handle_frame(&agent, complete(task_id, "AB C", 0.003))
        .await;

    let task = harness.task(task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.session_id.as_deref(), Some("s1"));
    assert!((task.estimated_cost - 0.003).abs() < f64::EPSILON);
    assert_eq!(task.files_changed, vec!["src/login.rs".to_string()]);
    assert!(task.completed_at.is_some());

    // The live stream message holds the concatenated deltas.
    let streamed_ts = harness.api.post_timestamps();
    assert_eq!(
        harness.api.message_text(&streamed_ts[0]).as_deref(),
        Some("ABC")
    );
    // The terminal block is a separate message, and the reaction is ✅.
    assert!(harness
        .api
        .block_fallbacks()
        .contains(&"Task complete".to_string()));
    assert!(harness
        .api
        .reactions_added()
        .contains(&"white_check_mark".to_string()));

    // Exactly one task:completed audit entry.
    let audits = harness.stores.audit.recent(50).await.unwrap();
    assert_eq!(
        audits.iter().filter(|a| a.action == "task:completed").count(),
        1
    );
}

#[tokio::test]
async fn terminal_state_is_immutable_after_completion() {
    let harness = Harness::new().await;
    let project = harness.project("C0123", "worker-1").await;
    let (agent, mut rx, _) = harness.connect_agent("worker-1");

    let task_id = harness
        .commands
        .submit(submit_request(&project, "one"))
        .await
        .unwrap();
    drain_frames(&mut rx);

    harness.router.handle_frame(&agent, ack(task_id)).await;
    harness
        .router
        .handle_frame(&agent, complete(task_id, "done", 0.01))
        .await;

    // Late duplicate completion and a late error both bounce off.
    harness
        .router
        .handle_frame(&agent, complete(task_id, "other result", 9.9))
        .await;
    harness
        .router
        .handle_frame(
            &agent,
            Frame::TaskError(TaskError {
                task_id,
                error: "late failure".to_string(),
                recoverable: false,
                session_id: None,
            }),
        )
        .await;

    let task = harness.task(task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some("done"));
    assert!((task.estimated_cost - 0.01).abs() < f64::EPSILON);
}

#[tokio::test]
async fn s2_offline_dispatch_queues_then_drains_in_order() {
    let harness = Harness::new().await;
    let project = harness.project("C0123", "worker-1").await;

    // Agent offline at submit time: the task parks.
    let task_id = harness
        .commands
        .submit(submit_request(&project, "fix the login bug"))
        .await
        .unwrap();

    let task = harness.task(task_id).await;
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.agent_id.as_ref().unwrap().as_str(), "worker-1");
    assert!(harness.api.reactions_added().contains(&"inbox_tray".to_string()));
    assert!(harness.api.block_fallbacks().contains(&"Task queued".to_string()));

    let agent_id = foreman::domain::AgentId::try_new("worker-1".to_string()).unwrap();
    let pending = harness
        .stores
        .offline_queue
        .find_pending_by_agent(&agent_id)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_type, "task-submit");

    // Reconnect and drain: the frame arrives and the run proceeds as S1.
    let (agent, mut rx, _) = harness.connect_agent("worker-1");
    let outcome = harness.offline_queue.drain_agent(&agent).await.unwrap();
    assert_eq!(outcome.delivered, 1);

    let frames = drain_frames(&mut rx);
    assert!(matches!(frames[0], Frame::TaskSubmit(_)));

    harness.router.handle_frame(&agent, ack(task_id)).await;
    harness
        .router
        .handle_frame(&agent, complete(task_id, "done", 0.002))
        .await;
    assert_eq!(harness.task(task_id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn s3_decomposition_spawns_children_and_aggregates() {
    let harness = Harness::new().await;
    let project = harness.project("C0123", "worker-1").await;
    let (agent, mut rx, _) = harness.connect_agent("worker-1");

    let long_prompt = format!("feature: build {}", "x".repeat(200));
    let mut request = submit_request(&project, &long_prompt);
    request.command = "feature".to_string();
    let parent_id = harness
        .commands
        .submit_with_decomposition(request)
        .await
        .unwrap();

    let parent = harness.task(parent_id).await;
    assert_eq!(parent.command, "decompose");

    // The planning submit is read-only with a zero continuation budget.
    let frames = drain_frames(&mut rx);
    let Frame::TaskSubmit(planning) = &frames[0] else {
        panic!("expected planning submit");
    };
    assert_eq!(planning.allowed_tools, vec!["Read", "Grep", "Glob"]);
    assert_eq!(planning.max_continuations, Some(0));

    harness.router.handle_frame(&agent, ack(parent_id)).await;

    let planning_result = r#"Plan ready.
```json:subtasks
[{"title": "models", "prompt": "add the models", "command": "build"},
 {"title": "api", "prompt": "add the endpoints", "command": "build"},
 {"title": "tests", "prompt": "cover it with tests", "command": "test"}]
```"#;
    harness
        .router
        .handle_frame(&agent, complete(parent_id, planning_result, 0.001))
        .await;

    // Three children dispatched, all bound to the parent.
    let children = harness.stores.tasks.children_of(parent_id).await.unwrap();
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|c| c.parent_task_id == Some(parent_id)));
    // The parent is still open until the children land.
    assert_eq!(harness.task(parent_id).await.status, TaskStatus::Running);

    let child_frames = drain_frames(&mut rx);
    assert_eq!(child_frames.len(), 3);

    // Two complete, one fails.
    for (i, child) in children.iter().enumerate() {
        harness.router.handle_frame(&agent, ack(child.id)).await;
        if i < 2 {
            let mut frame = complete(child.id, "child done", 0.01);
            if let Frame::TaskComplete(payload) = &mut frame {
                payload.files_changed = vec![format!("src/part{i}.rs")];
            }
            harness.router.handle_frame(&agent, frame).await;
        } else {
            harness
                .router
                .handle_frame(
                    &agent,
                    Frame::TaskError(TaskError {
                        task_id: child.id,
                        error: "boom".to_string(),
                        recoverable: true,
                        session_id: None,
                    }),
                )
                .await;
        }
    }

    let parent = harness.task(parent_id).await;
    assert_eq!(parent.status, TaskStatus::Completed);
    assert!((parent.estimated_cost - 0.02).abs() < 1e-9);
    assert_eq!(
        parent.files_changed,
        vec!["src/part0.rs".to_string(), "src/part1.rs".to_string()]
    );
    assert!(harness
        .api
        .block_fallbacks()
        .contains(&"Subtasks finished".to_string()));
}

#[tokio::test]
async fn decomposition_fallback_direct_submits_once() {
    let harness = Harness::new().await;
    let project = harness.project("C0123", "worker-1").await;
    let (agent, mut rx, _) = harness.connect_agent("worker-1");

    let long_prompt = format!("feature: build {}", "y".repeat(200));
    let mut request = submit_request(&project, &long_prompt);
    request.command = "feature".to_string();
    let parent_id = harness
        .commands
        .submit_with_decomposition(request)
        .await
        .unwrap();
    drain_frames(&mut rx);

    harness.router.handle_frame(&agent, ack(parent_id)).await;
    harness
        .router
        .handle_frame(
            &agent,
            complete(parent_id, "I could not produce a plan for this.", 0.001),
        )
        .await;

    // Exactly one direct submit of the original prompt, as a child.
    let children = harness.stores.tasks.children_of(parent_id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].prompt, long_prompt);

    harness.router.handle_frame(&agent, ack(children[0].id)).await;
    harness
        .router
        .handle_frame(&agent, complete(children[0].id, "direct done", 0.05))
        .await;

    let parent = harness.task(parent_id).await;
    assert_eq!(parent.status, TaskStatus::Completed);
    assert!((parent.estimated_cost - 0.05).abs() < 1e-9);
}

#[tokio::test]
async fn s6_cancel_cascades_and_late_frames_bounce() {
    let harness = Harness::new().await;
    let project = harness.project("C0123", "worker-1").await;
    let (agent, mut rx, _) = harness.connect_agent("worker-1");

    let parent_id = harness
        .commands
        .submit(submit_request(&project, "parent work"))
        .await
        .unwrap();
    harness.router.handle_frame(&agent, ack(parent_id)).await;

    let mut child_request = submit_request(&project, "child one");
    child_request.parent_task_id = Some(parent_id);
    child_request.message_ts = None;
    let c1 = harness.commands.submit(child_request.clone()).await.unwrap();

    child_request.prompt = "child two".to_string();
    let c2 = harness.commands.submit(child_request).await.unwrap();
    harness.router.handle_frame(&agent, ack(c2)).await;
    drain_frames(&mut rx);

    let cancelled = harness
        .commands
        .cancel(
            parent_id,
            "user requested",
            Some(&ChatUserId::try_new("U1".to_string()).unwrap()),
        )
        .await
        .unwrap();
    assert_eq!(cancelled, 3);

    for id in [parent_id, c1, c2] {
        assert_eq!(harness.task(id).await.status, TaskStatus::Cancelled);
    }

    // One task-cancel broadcast per cancelled task.
    let frames = drain_frames(&mut rx);
    let cancels = frames
        .iter()
        .filter(|f| matches!(f, Frame::TaskCancel(_)))
        .count();
    assert_eq!(cancels, 3);

    // Late terminal frames for the children no longer mutate state.
    harness
        .router
        .handle_frame(&agent, complete(c2, "too late", 1.0))
        .await;
    let c2_task = harness.task(c2).await;
    assert_eq!(c2_task.status, TaskStatus::Cancelled);
    assert!(c2_task.result.is_none());
}

#[tokio::test]
async fn rejected_ack_fails_the_task() {
    let harness = Harness::new().await;
    let project = harness.project("C0123", "worker-1").await;
    let (agent, mut rx, _) = harness.connect_agent("worker-1");

    let task_id = harness
        .commands
        .submit(submit_request(&project, "work"))
        .await
        .unwrap();
    drain_frames(&mut rx);

    harness
        .router
        .handle_frame(
            &agent,
            Frame::TaskAck(TaskAck {
                task_id,
                accepted: false,
                reason: Some("workspace is locked".to_string()),
            }),
        )
        .await;

    let task = harness.task(task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_message.as_deref(), Some("workspace is locked"));
    assert!(harness
        .api
        .block_fallbacks()
        .contains(&"Task rejected".to_string()));
    assert!(harness.api.reactions_added().contains(&"x".to_string()));
}

#[tokio::test]
async fn session_id_survives_failure_for_resume() {
    let harness = Harness::new().await;
    let project = harness.project("C0123", "worker-1").await;
    let (agent, mut rx, _) = harness.connect_agent("worker-1");

    let task_id = harness
        .commands
        .submit(submit_request(&project, "risky work"))
        .await
        .unwrap();
    drain_frames(&mut rx);
    harness.router.handle_frame(&agent, ack(task_id)).await;

    harness
        .router
        .handle_frame(
            &agent,
            Frame::TaskError(TaskError {
                task_id,
                error: "exploded midway".to_string(),
                recoverable: true,
                session_id: Some("sess-resume".to_string()),
            }),
        )
        .await;

    let task = harness.task(task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.session_id.as_deref(), Some("sess-resume"));

    // Resubmit picks the session up.
    let resubmitted = harness.commands.resubmit(&task, &project).await.unwrap();
    let frames = drain_frames(&mut rx);
    let Frame::TaskSubmit(submit) = &frames[0] else {
        panic!("expected resubmit frame");
    };
    assert_eq!(submit.task_id, resubmitted);
    assert_eq!(submit.resume_session_id.as_deref(), Some("sess-resume"));
}

#[tokio::test]
async fn progress_frames_consolidate_into_one_message() {
    let harness = Harness::new().await;
    let project = harness.project("C0123", "worker-1").await;
    let (agent, mut rx, _) = harness.connect_agent("worker-1");

    let task_id = harness
        .commands
        .submit(submit_request(&project, "work"))
        .await
        .unwrap();
    drain_frames(&mut rx);
    harness.router.handle_frame(&agent, ack(task_id)).await;

    for message in ["Reading `src/a.rs`", "Running: `cargo test`"] {
        harness
            .router
            .handle_frame(
                &agent,
                Frame::TaskProgress(foreman::protocol::TaskProgress {
                    task_id,
                    kind: foreman::protocol::ProgressKind::ToolUse,
                    message: message.to_string(),
                    timestamp: Utc::now(),
                }),
            )
            .await;
    }

    let posts = harness.api.post_timestamps();
    assert_eq!(posts.len(), 1, "one consolidated progress message");
    let text = harness.api.message_text(&posts[0]).unwrap();
    assert!(text.contains("✅ Reading `src/a.rs`"));
    assert!(text.contains("🔄 Running: `cargo test`"));
}

#[tokio::test]
async fn unknown_bot_is_a_domain_error() {
    let harness = Harness::new().await;
    let project = harness.project("C0123", "worker-1").await;
    let mut request = submit_request(&project, "work");
    request.bot = BotName::try_new("plumber".to_string()).unwrap();
    let err = harness.commands.submit(request).await.unwrap_err();
    assert!(err.to_string().contains("unknown bot"));
}
