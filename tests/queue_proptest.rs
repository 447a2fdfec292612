mod common;

use std::collections::VecDeque;
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use common::{harness, test_config};
use fieldsync::storage::{OperationType, SledStore};
use fieldsync::sync::{NewOperation, OperationQueue, StopReason};

#[derive(Debug, Clone)]
enum QueueOp {
    Enqueue { table: u8 },
    Remove,
    Fail,
}

fn queue_op_strategy() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        3 => (0u8..4).prop_map(|table| QueueOp::Enqueue { table }),
        1 => Just(QueueOp::Remove),
        2 => Just(QueueOp::Fail),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn queue_matches_fifo_model(
        ops in proptest::collection::vec(queue_op_strategy(), 1..40),
        max_retries in 1u32..5,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let store = Arc::new(SledStore::temporary().expect("store"));
            let queue = OperationQueue::new(store, max_retries);
            // (id, retry_count) in expected dequeue order
            let mut shadow: VecDeque<(u64, u32)> = VecDeque::new();
            let mut next = 0u32;

            for op in ops {
                match op {
                    QueueOp::Enqueue { table } => {
                        let stored = queue
                            .enqueue(NewOperation::new(
                                OperationType::Upsert,
                                format!("table_{table}"),
                                json!({"id": next}),
                            ))
                            .await
                            .expect("enqueue");
                        next += 1;
                        prop_assert_eq!(stored.retry_count, 0);
                        shadow.push_back((stored.id, 0));
                    }
                    QueueOp::Remove => {
                        if let Some(head) = queue.dequeue().await.expect("dequeue") {
                            queue.remove(head.id).await.expect("remove");
                            let expected = shadow.pop_front().map(|(id, _)| id);
                            prop_assert_eq!(Some(head.id), expected);
                        } else {
                            prop_assert!(shadow.is_empty());
                        }
                    }
                    QueueOp::Fail => {
                        if let Some(head) = queue.dequeue().await.expect("dequeue") {
                            prop_assert!(queue.should_retry(&head));
                            let updated = queue.update_retry_count(&head).await.expect("update");
                            prop_assert_eq!(updated.retry_count, head.retry_count + 1);
                            if queue.should_retry(&updated) {
                                if let Some(front) = shadow.front_mut() {
                                    front.1 = updated.retry_count;
                                }
                            } else {
                                queue.remove(updated.id).await.expect("remove");
                                shadow.pop_front();
                            }
                        }
                    }
                }

                let pending = queue.pending().await.expect("pending");
                let actual: Vec<(u64, u32)> =
                    pending.iter().map(|op| (op.id, op.retry_count)).collect();
                let expected: Vec<(u64, u32)> = shadow.iter().copied().collect();
                prop_assert_eq!(actual, expected);
                prop_assert!(pending.iter().all(|op| op.retry_count < max_retries));
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn drain_attempts_each_failing_operation_exactly_max_retries_times(
        rejected in proptest::collection::vec(any::<bool>(), 1..8),
        max_retries in 1u32..4,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let mut config = test_config();
            config.sync.max_retries = max_retries;
            config.sync.max_consecutive_failures = 100;
            let h = harness(config, true);

            for (i, reject) in rejected.iter().enumerate() {
                let id = format!("op-{i}");
                if *reject {
                    h.remote.reject(&id);
                }
                h.engine
                    .enqueue(NewOperation::new(OperationType::Create, "samples", json!({"id": id})))
                    .await
                    .expect("enqueue");
            }

            let report = h.engine.sync_now().await;
            prop_assert_eq!(report.stop, StopReason::QueueEmpty);
            prop_assert!(h.engine.pending_operations().await.expect("pending").is_empty());

            let failing = rejected.iter().filter(|r| **r).count() as u64;
            prop_assert_eq!(report.dead_lettered, failing);
            prop_assert_eq!(report.failed, failing * u64::from(max_retries));
            prop_assert_eq!(report.succeeded, rejected.len() as u64 - failing);

            // First attempts follow enqueue order.
            let mut first_seen: Vec<String> = Vec::new();
            for call in h.remote.writes() {
                if !first_seen.contains(&call) {
                    first_seen.push(call);
                }
            }
            let expected: Vec<String> = (0..rejected.len())
                .map(|i| format!("create samples/op-{i}"))
                .collect();
            prop_assert_eq!(first_seen, expected);

            for (i, reject) in rejected.iter().enumerate() {
                let attempts = h.remote.count(&format!("create samples/op-{i}"));
                let want = if *reject { max_retries as usize } else { 1 };
                prop_assert_eq!(attempts, want);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
