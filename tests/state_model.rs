// tests/state_model.rs

use batchdag::dag::DagGraph;
use batchdag::errors::BatchdagError;
use batchdag::state::{
    BatchStats, BatchStatus, DisplayStatus, SourceRef, TaskStatus, TaskUpdate, create_initial,
};
use batchdag_test_utils::BatchBuilder;

#[test]
fn lifecycle_allows_only_forward_moves_and_retry() {
    use TaskStatus::*;

    assert!(Pending.can_transition_to(Running));
    assert!(Running.can_transition_to(Completed));
    assert!(Running.can_transition_to(Failed));
    assert!(Running.can_transition_to(Cancelled));
    assert!(Failed.can_transition_to(Pending));

    assert!(!Pending.can_transition_to(Completed));
    assert!(!Completed.can_transition_to(Pending));
    assert!(!Completed.can_transition_to(Running));
    assert!(!Cancelled.can_transition_to(Pending));

    assert!(!Pending.is_terminal());
    assert!(!Running.is_terminal());
    assert!(Completed.is_terminal() && Failed.is_terminal() && Cancelled.is_terminal());

    assert!(!BatchStatus::Running.is_terminal());
    assert!(BatchStatus::Cancelled.is_terminal());
}

#[test]
fn transition_rejects_forbidden_moves() {
    let mut state = create_initial("b", "b", SourceRef::default(), ["A".to_string()]);

    let err = state.transition("A", TaskStatus::Completed).unwrap_err();
    assert!(matches!(
        err,
        BatchdagError::InvalidTransition {
            from: TaskStatus::Pending,
            to: TaskStatus::Completed,
            ..
        }
    ));
    assert_eq!(state.task("A").unwrap().status, TaskStatus::Pending);

    assert!(matches!(
        state.transition("nope", TaskStatus::Running),
        Err(BatchdagError::TaskNotFound(_))
    ));
}

#[test]
fn retry_keeps_session_and_cost() {
    let mut state = create_initial("b", "b", SourceRef::default(), ["A".to_string()]);
    state.transition("A", TaskStatus::Running).unwrap();
    state
        .apply(
            "A",
            TaskUpdate {
                session_token: Some(Some("tok".into())),
                cost: Some(0.5),
                attempts: Some(1),
                ..TaskUpdate::default()
            },
        )
        .unwrap();
    state.transition("A", TaskStatus::Failed).unwrap();
    state
        .apply(
            "A",
            TaskUpdate {
                error: Some(Some("boom".into())),
                ..TaskUpdate::default()
            },
        )
        .unwrap();

    state.reset_for_retry("A").unwrap();
    let a = state.task("A").unwrap();
    assert_eq!(a.status, TaskStatus::Pending);
    assert_eq!(a.error, None);
    assert_eq!(a.session_token.as_deref(), Some("tok"));
    assert_eq!(a.cost, 0.5);
    assert_eq!(a.attempts, 1);
    assert_eq!(state.total_cost, 0.5);

    assert!(matches!(
        state.reset_for_retry("A"),
        Err(BatchdagError::InvalidTransition { from: TaskStatus::Pending, .. })
    ));
}

#[test]
fn total_cost_tracks_every_update() {
    let ids = ["A", "B"].map(String::from);
    let mut state = create_initial("b", "b", SourceRef::default(), ids);
    for (id, cost) in [("A", 0.25), ("B", 1.0), ("A", 0.75)] {
        state
            .apply(
                id,
                TaskUpdate {
                    cost: Some(cost),
                    ..TaskUpdate::default()
                },
            )
            .unwrap();
    }
    assert_eq!(state.total_cost, 1.75);
    assert_eq!(BatchStats::from_state(&state).total_cost, 1.75);
}

#[test]
fn pending_tasks_display_as_blocked_or_queued() {
    let tasks = BatchBuilder::new().task("A", &[]).task("B", &["A"]).build();
    let graph = DagGraph::new(&tasks);
    let mut state = create_initial(
        "b",
        "b",
        SourceRef::default(),
        tasks.iter().map(|t| t.id.clone()),
    );

    assert_eq!(state.display_status(&graph, "A"), Some(DisplayStatus::Queued));
    assert_eq!(state.display_status(&graph, "B"), Some(DisplayStatus::Blocked));

    state.transition("A", TaskStatus::Running).unwrap();
    assert_eq!(state.display_status(&graph, "A"), Some(DisplayStatus::Running));
    assert_eq!(state.display_status(&graph, "B"), Some(DisplayStatus::Blocked));

    state.transition("A", TaskStatus::Completed).unwrap();
    assert_eq!(state.display_status(&graph, "B"), Some(DisplayStatus::Queued));
    assert_eq!(state.display_status(&graph, "C"), None);
    assert_eq!(DisplayStatus::Queued.to_string(), "queued");
}

#[test]
fn source_digest_detects_edits() {
    let source = SourceRef::from_bytes("Batchdag.toml", b"[[task]]\nid = \"A\"\n");
    assert_eq!(source.digest.len(), 64);
    assert!(source.matches(b"[[task]]\nid = \"A\"\n"));
    assert!(!source.matches(b"[[task]]\nid = \"B\"\n"));
}

#[test]
fn statuses_serialize_lowercase() {
    assert_eq!(
        serde_json::to_string(&TaskStatus::Cancelled).unwrap(),
        "\"cancelled\""
    );
    assert_eq!(
        serde_json::from_str::<BatchStatus>("\"failed\"").unwrap(),
        BatchStatus::Failed
    );
    assert_eq!(TaskStatus::Running.to_string(), "running");
}
