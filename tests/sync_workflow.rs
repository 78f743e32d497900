//! Sync orchestrator scenarios: leg ordering, two-phase restart, deploy
//! completion and the safety timeouts.

mod common;

use common::{Harness, drain_frames};
use foreman::domain::{ChatUserId, SyncStatus};
use foreman::protocol::{DeployResult, Frame, TaskComplete, TaskError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn complete(task_id: foreman::domain::TaskId) -> Frame {
    Frame::TaskComplete(TaskComplete {
        task_id,
        result: "ok".to_string(),
        session_id: None,
        input_tokens: 10,
        output_tokens: 10,
        estimated_cost: 0.001,
        files_changed: Vec::new(),
        commands_run: Vec::new(),
        duration_ms: 10,
        continuations: 0,
        attachment_results: None,
    })
}

async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("frame within deadline")
        .expect("channel open")
}

async fn start(harness: &Harness) -> (foreman::domain::WorkflowId, foreman::domain::SyncWorkflow) {
    let project = harness.project("C0123", "worker-1").await;
    let id = harness
        .sync
        .start_sync(
            &harness.commands,
            &project,
            project.channel_id.clone(),
            None,
            ChatUserId::try_new("U1".to_string()).unwrap(),
        )
        .await
        .unwrap();
    let workflow = harness.sync.workflow(id).unwrap();
    (id, workflow)
}

async fn wait_for_status(
    harness: &Harness,
    id: foreman::domain::WorkflowId,
    wanted: SyncStatus,
) -> bool {
    for _ in 0..100 {
        if harness.sync.workflow(id).map(|w| w.status) == Some(wanted) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn restart_waits_for_both_legs_in_either_order() {
    for build_first in [false, true] {
        let harness = Harness::new().await;
        let (agent, mut rx, conn_id) = harness.connect_agent("worker-1");
        let (id, workflow) = start(&harness).await;
        let test_task = workflow.test_task_id.unwrap();
        let build_task = workflow.build_task_id.unwrap();

        // Two submits, one per leg.
        let submits = [next_frame(&mut rx).await, next_frame(&mut rx).await];
        assert!(submits.iter().all(|f| matches!(f, Frame::TaskSubmit(_))));

        let order = if build_first {
            [build_task, test_task]
        } else {
            [test_task, build_task]
        };

        harness.router.handle_frame(&agent, complete(order[0])).await;
        // One leg done: no restart yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain_frames(&mut rx).is_empty(), "no restart after one leg");

        harness.router.handle_frame(&agent, complete(order[1])).await;
        let restart = next_frame(&mut rx).await;
        assert!(matches!(restart, Frame::SystemRestart(_)));

        // Two-phase restart: falling edge, then rising edge.
        harness.registry.deregister(&agent, conn_id);
        let (agent, mut rx2, _) = harness.connect_agent("worker-1");

        let deploy = next_frame(&mut rx2).await;
        let Frame::DeployRequest(request) = deploy else {
            panic!("expected deploy-request, got {deploy:?}");
        };
        assert_eq!(request.local_path, "/srv/projects/webapp");

        harness
            .router
            .handle_frame(
                &agent,
                Frame::DeployResult(DeployResult {
                    request_id: request.request_id,
                    success: true,
                    output: "deployed".to_string(),
                    build_logs_url: Some("https://ci/logs/1".to_string()),
                }),
            )
            .await;

        assert!(wait_for_status(&harness, id, SyncStatus::Completed).await);
        let audits = harness.stores.audit.recent(50).await.unwrap();
        assert!(audits.iter().any(|a| a.action == "sync:completed"));
    }
}

#[tokio::test]
async fn failed_leg_aborts_before_restart() {
    let harness = Harness::new().await;
    let (agent, mut rx, _) = harness.connect_agent("worker-1");
    let (id, workflow) = start(&harness).await;
    drain_frames(&mut rx);

    harness
        .router
        .handle_frame(
            &agent,
            Frame::TaskError(TaskError {
                task_id: workflow.test_task_id.unwrap(),
                error: "3 tests failed".to_string(),
                recoverable: false,
                session_id: None,
            }),
        )
        .await;

    assert!(wait_for_status(&harness, id, SyncStatus::Failed).await);
    // The build leg finishing afterwards cannot revive the workflow.
    harness
        .router
        .handle_frame(&agent, complete(workflow.build_task_id.unwrap()))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        harness.sync.workflow(id).unwrap().status,
        SyncStatus::Failed
    );
    assert!(
        !drain_frames(&mut rx)
            .iter()
            .any(|f| matches!(f, Frame::SystemRestart(_))),
        "no restart after an aborted workflow"
    );
}

#[tokio::test]
async fn missing_falling_edge_fails_the_restart_phase() {
    let harness = Harness::with_timeouts(Duration::from_millis(200), Duration::from_secs(5)).await;
    let (agent, mut rx, _) = harness.connect_agent("worker-1");
    let (id, workflow) = start(&harness).await;
    drain_frames(&mut rx);

    harness
        .router
        .handle_frame(&agent, complete(workflow.test_task_id.unwrap()))
        .await;
    harness
        .router
        .handle_frame(&agent, complete(workflow.build_task_id.unwrap()))
        .await;

    // The agent never disconnects; the workflow must fail rather than
    // deploy into the old connection.
    assert!(wait_for_status(&harness, id, SyncStatus::Failed).await);
    let workflow = harness.sync.workflow(id).unwrap();
    assert!(workflow.error.unwrap().contains("restart"));
}

#[tokio::test]
async fn silent_deploy_fails_after_the_safety_timeout() {
    let harness = Harness::with_timeouts(Duration::from_secs(2), Duration::from_millis(200)).await;
    let (agent, mut rx, conn_id) = harness.connect_agent("worker-1");
    let (id, workflow) = start(&harness).await;
    drain_frames(&mut rx);

    harness
        .router
        .handle_frame(&agent, complete(workflow.test_task_id.unwrap()))
        .await;
    harness
        .router
        .handle_frame(&agent, complete(workflow.build_task_id.unwrap()))
        .await;
    let _ = next_frame(&mut rx).await; // system-restart

    harness.registry.deregister(&agent, conn_id);
    let (_agent, mut rx2, _) = harness.connect_agent("worker-1");
    let deploy = next_frame(&mut rx2).await;
    assert!(matches!(deploy, Frame::DeployRequest(_)));

    // No deploy-result ever arrives.
    assert!(wait_for_status(&harness, id, SyncStatus::Failed).await);
    assert!(harness
        .sync
        .workflow(id)
        .unwrap()
        .error
        .unwrap()
        .contains("deploy"));
}

#[tokio::test]
async fn sync_requires_a_pinned_agent() {
    let harness = Harness::new().await;
    let project = harness.project("C9", "auto").await;
    let err = harness
        .sync
        .start_sync(
            &harness.commands,
            &project,
            project.channel_id.clone(),
            None,
            ChatUserId::try_new("U1".to_string()).unwrap(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("pinned"));
}

#[tokio::test]
async fn manual_deploy_result_reaches_chat_without_a_workflow() {
    let harness = Harness::new().await;
    let (agent, _rx, _) = harness.connect_agent("worker-1");

    let request_id = foreman::domain::RequestId::generate();
    harness.deploys.register(
        request_id,
        foreman::pending::DeployRegistration {
            channel_id: "C0123".to_string(),
            thread_ts: None,
            requested_by: "U1".to_string(),
            workflow_id: None,
        },
    );

    harness
        .router
        .handle_frame(
            &agent,
            Frame::DeployResult(DeployResult {
                request_id,
                success: false,
                output: "build exploded".to_string(),
                build_logs_url: None,
            }),
        )
        .await;

    assert!(harness
        .api
        .block_fallbacks()
        .contains(&"Deploy failed".to_string()));

    // A duplicate result finds no registration and is discarded.
    harness
        .router
        .handle_frame(
            &agent,
            Frame::DeployResult(DeployResult {
                request_id,
                success: true,
                output: "late".to_string(),
                build_logs_url: None,
            }),
        )
        .await;
    let fallbacks = harness.api.block_fallbacks();
    assert_eq!(
        fallbacks.iter().filter(|f| f.contains("Deploy")).count(),
        1
    );
}
