// tests/escalation.rs

use batchdag::errors::BatchdagError;
use batchdag::escalation::{EscalationCoordinator, EscalationRequest, EscalationResponse};
use batchdag_test_utils::with_timeout;

async fn wait_until_pending(coordinator: &EscalationCoordinator, task: &str) {
    with_timeout(async {
        while coordinator.pending(task).is_none() {
            tokio::task::yield_now().await;
        }
    })
    .await
}

#[tokio::test]
async fn raise_waits_for_the_matching_resolution() {
    let coordinator = EscalationCoordinator::new();
    let waiter = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .raise(EscalationRequest::new("A", "which?").with_choices(["left", "right"]))
                .await
        })
    };
    wait_until_pending(&coordinator, "A").await;

    assert_eq!(coordinator.outstanding(), vec!["A"]);
    assert_eq!(coordinator.pending("A").unwrap().choices, vec!["left", "right"]);

    coordinator
        .resolve("A", EscalationResponse::Choice("right".into()))
        .unwrap();
    let response = with_timeout(waiter).await.unwrap().unwrap();
    assert_eq!(response, EscalationResponse::Choice("right".into()));
    assert!(coordinator.outstanding().is_empty());
}

#[tokio::test]
async fn one_task_waiting_does_not_block_another() {
    let coordinator = EscalationCoordinator::new();
    let a = coordinator
        .register(EscalationRequest::new("A", "a?"))
        .unwrap();
    let b = coordinator
        .register(EscalationRequest::new("B", "b?"))
        .unwrap();
    assert_ne!(a.ticket, b.ticket);

    coordinator
        .resolve("B", EscalationResponse::FreeText("go".into()))
        .unwrap();
    assert_eq!(
        with_timeout(b.response).await.unwrap(),
        EscalationResponse::FreeText("go".into())
    );
    assert_eq!(coordinator.outstanding(), vec!["A"]);

    coordinator.resolve("A", EscalationResponse::Skip).unwrap();
    assert_eq!(with_timeout(a.response).await.unwrap(), EscalationResponse::Skip);
}

#[test]
fn resolving_without_a_request_is_stale() {
    let coordinator = EscalationCoordinator::new();
    let result = coordinator.resolve("A", EscalationResponse::AgentDecide);
    assert!(matches!(
        result,
        Err(BatchdagError::StaleEscalationResolution(id)) if id == "A"
    ));
}

#[test]
fn second_request_for_the_same_task_is_rejected() {
    let coordinator = EscalationCoordinator::new();
    let _first = coordinator
        .register(EscalationRequest::new("A", "first?"))
        .unwrap();

    let second = coordinator.register(EscalationRequest::new("A", "second?"));
    assert!(matches!(
        second,
        Err(BatchdagError::EscalationAlreadyPending(id)) if id == "A"
    ));
    assert_eq!(coordinator.pending("A").unwrap().question, "first?");
}

#[test]
fn abandoned_request_can_be_replaced() {
    let coordinator = EscalationCoordinator::new();
    let first = coordinator
        .register(EscalationRequest::new("A", "first?"))
        .unwrap();
    drop(first);

    let second = coordinator
        .register(EscalationRequest::new("A", "second?"))
        .unwrap();
    assert_eq!(coordinator.pending("A").unwrap().question, "second?");
    drop(second);
}

#[tokio::test]
async fn cancel_releases_the_waiter_with_skip() {
    let coordinator = EscalationCoordinator::new();
    let registration = coordinator
        .register(EscalationRequest::new("A", "proceed?"))
        .unwrap();

    assert!(coordinator.cancel("A"));
    assert!(!coordinator.cancel("A"));
    assert_eq!(
        with_timeout(registration.response).await.unwrap(),
        EscalationResponse::Skip
    );
    assert!(coordinator.pending_requests().is_empty());
}

#[tokio::test]
async fn ticket_resolution_ignores_superseded_requests() {
    let coordinator = EscalationCoordinator::new();
    let first = coordinator
        .register(EscalationRequest::new("A", "first?"))
        .unwrap();
    coordinator
        .resolve("A", EscalationResponse::FreeText("done".into()))
        .unwrap();
    let _ = first.response.await;

    let second = coordinator
        .register(EscalationRequest::new("A", "second?"))
        .unwrap();

    // A late timer for the first request must not answer the second.
    assert!(
        coordinator
            .resolve_ticket("A", first.ticket, EscalationResponse::AgentDecide)
            .is_err()
    );
    assert!(coordinator.pending("A").is_some());

    coordinator
        .resolve_ticket("A", second.ticket, EscalationResponse::AgentDecide)
        .unwrap();
    assert_eq!(
        with_timeout(second.response).await.unwrap(),
        EscalationResponse::AgentDecide
    );
}

#[test]
fn pending_requests_are_sorted_by_task() {
    let coordinator = EscalationCoordinator::new();
    let _b = coordinator.register(EscalationRequest::new("B", "b?")).unwrap();
    let _a = coordinator.register(EscalationRequest::new("A", "a?")).unwrap();

    let tasks: Vec<String> = coordinator
        .pending_requests()
        .into_iter()
        .map(|r| r.task_id)
        .collect();
    assert_eq!(tasks, vec!["A", "B"]);
}

#[test]
fn responses_serialize_with_a_kind_tag() {
    let json = serde_json::to_string(&EscalationResponse::Choice("x".into())).unwrap();
    assert_eq!(json, r#"{"kind":"choice","value":"x"}"#);
    let json = serde_json::to_string(&EscalationResponse::Skip).unwrap();
    assert_eq!(json, r#"{"kind":"skip"}"#);

    let request: EscalationRequest =
        serde_json::from_str(r#"{"question":"pick","choices":["a","b"]}"#).unwrap();
    assert_eq!(request.task_id, "");
    assert_eq!(request.choices, vec!["a", "b"]);
}
