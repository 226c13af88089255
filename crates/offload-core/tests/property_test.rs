//! Property tests for the task lifecycle.

use chrono::{Duration, Utc};
use offload_core::{StatusUpdate, Task, TaskStatus, Workload, Sha256Workload};
use proptest::prelude::*;

fn status_strategy() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Pending),
        Just(TaskStatus::Running),
        Just(TaskStatus::Succeeded),
        Just(TaskStatus::Failed),
    ]
}

fn rank(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::Pending => 0,
        TaskStatus::Running => 1,
        TaskStatus::Succeeded | TaskStatus::Failed => 2,
    }
}

proptest! {
    #[test]
    fn status_never_moves_backwards(
        steps in prop::collection::vec((status_strategy(), -10i64..10), 0..20)
    ) {
        let submitted = Utc::now();
        let mut task = Task::new_sync("x", 1, submitted);

        for (target, skew) in steps {
            let before = task.status;
            let update = StatusUpdate {
                status: target,
                result: None,
                error: None,
                duration_ms: None,
                at: submitted + Duration::seconds(skew),
            };
            let applied = task.apply(&update).is_ok();

            prop_assert_eq!(applied, before.can_transition_to(target));
            prop_assert!(rank(task.status) >= rank(before));
            if before.is_terminal() {
                prop_assert_eq!(task.status, before);
            }
        }

        if let Some(started) = task.started_at {
            prop_assert!(started >= task.submitted_at);
            if let Some(completed) = task.completed_at {
                prop_assert!(completed >= started);
            }
        }
        if let Some(completed) = task.completed_at {
            prop_assert!(completed >= task.submitted_at);
        }
    }

    #[test]
    fn workload_is_deterministic(input in ".{0,64}", iterations in 1u32..50) {
        let a = Sha256Workload.run(&input, iterations).unwrap();
        let b = Sha256Workload.run(&input, iterations).unwrap();
        prop_assert_eq!(a.result.len(), 64);
        prop_assert_eq!(a.result, b.result);
        prop_assert_eq!(a.iterations, iterations);
    }
}
