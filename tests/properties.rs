//! Property tests over the pure cores: the task state graph, `auto`
//! resolution, subtask parsing, and offline-queue ordering.

use proptest::prelude::*;
use std::collections::HashSet;

use foreman::commands::parse_subtasks;
use foreman::domain::{AgentId, TaskStatus};
use foreman::registry::pick_auto;

fn any_status() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Pending),
        Just(TaskStatus::Queued),
        Just(TaskStatus::Running),
        Just(TaskStatus::Completed),
        Just(TaskStatus::Failed),
        Just(TaskStatus::Cancelled),
    ]
}

proptest! {
    /// Walking the graph from pending, a terminal state is absorbing and
    /// every accepted edge is one of the declared ones.
    #[test]
    fn task_status_walks_stay_on_the_declared_graph(
        attempts in proptest::collection::vec(any_status(), 0..24)
    ) {
        let mut current = TaskStatus::Pending;
        let mut seen_terminal = false;
        for next in attempts {
            let allowed = current.can_transition_to(next);
            if seen_terminal {
                prop_assert!(!allowed, "terminal {current:?} accepted {next:?}");
            }
            if allowed {
                let declared = matches!(
                    (current, next),
                    (TaskStatus::Pending, TaskStatus::Queued | TaskStatus::Running | TaskStatus::Cancelled)
                        | (TaskStatus::Queued, TaskStatus::Running | TaskStatus::Cancelled)
                        | (TaskStatus::Running, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
                );
                prop_assert!(declared);
                current = next;
                seen_terminal = current.is_terminal();
            }
        }
    }

    /// `auto` picks only online agents, and picks one whenever any agent
    /// in the order is online.
    #[test]
    fn pick_auto_honors_the_online_set(
        names in proptest::collection::vec("[a-z]{1,8}", 0..8),
        online_mask in proptest::collection::vec(any::<bool>(), 0..8),
        cursor in 0usize..32
    ) {
        let order: Vec<AgentId> = names
            .iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .map(|n| AgentId::try_new(n.clone()).unwrap())
            .collect();
        let online: HashSet<AgentId> = order
            .iter()
            .zip(online_mask.iter().chain(std::iter::repeat(&false)))
            .filter_map(|(agent, on)| on.then(|| agent.clone()))
            .collect();

        let picked = pick_auto(&order, &online, cursor);
        match picked {
            Some(agent) => prop_assert!(online.contains(&agent)),
            None => prop_assert!(online.is_empty()),
        }
    }

    /// The subtask parser is total: arbitrary text never panics, and text
    /// without an array cannot produce subtasks.
    #[test]
    fn parse_subtasks_is_total(text in ".{0,400}") {
        let specs = parse_subtasks(&text);
        if !text.contains('[') {
            prop_assert!(specs.is_empty());
        }
    }

    /// Well-formed fenced plans parse exactly.
    #[test]
    fn generated_subtask_blocks_round_trip(
        subtasks in proptest::collection::vec(("[a-z ]{1,20}", "[a-z ]{1,40}", "[a-z]{1,10}"), 1..6)
    ) {
        let array: Vec<serde_json::Value> = subtasks
            .iter()
            .map(|(title, prompt, command)| {
                serde_json::json!({ "title": title, "prompt": prompt, "command": command })
            })
            .collect();
        let text = format!(
            "Here is the plan:\n```json:subtasks\n{}\n```\n",
            serde_json::Value::Array(array).to_string()
        );
        let parsed = parse_subtasks(&text);
        prop_assert_eq!(parsed.len(), subtasks.len());
        for (spec, (title, prompt, command)) in parsed.iter().zip(subtasks.iter()) {
            prop_assert_eq!(&spec.title, title);
            prop_assert_eq!(&spec.prompt, prompt);
            prop_assert_eq!(&spec.command, command);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Offline-queue delivery preserves enqueue order for any batch of
    /// frames and marks each row delivered at most once.
    #[test]
    fn offline_queue_preserves_order(count in 1usize..20) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            use foreman::database::Database;
            use foreman::storage::OfflineQueueStore;
            use std::time::Duration;

            let db = Database::in_memory().await.unwrap();
            let store = OfflineQueueStore::new(db);
            store.ensure_schema().await.unwrap();
            let agent = AgentId::try_new("worker-1".to_string()).unwrap();

            for i in 0..count {
                store
                    .enqueue(&agent, "task-submit", format!("frame-{i}").as_bytes(), Duration::from_secs(60))
                    .await
                    .unwrap();
            }

            let pending = store.find_pending_by_agent(&agent).await.unwrap();
            assert_eq!(pending.len(), count);
            for (i, entry) in pending.iter().enumerate() {
                assert_eq!(entry.payload, format!("frame-{i}").into_bytes());
                assert!(store.mark_delivered(entry.id).await.unwrap());
                assert!(!store.mark_delivered(entry.id).await.unwrap());
            }
            assert!(store.find_pending_by_agent(&agent).await.unwrap().is_empty());
        });
    }
}
