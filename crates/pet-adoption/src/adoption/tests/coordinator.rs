use std::sync::Arc;

use super::common::*;

use crate::adoption::coordinator::{
    AdoptionCoordinator, ApprovalStep, CoordinatorError, Decided, Decision, TransitionConflict,
};
use crate::adoption::domain::{AdoptionStatus, AnimalId, AnimalPatch, AnimalStatus, Scope};
use crate::adoption::memory::MemoryStore;
use crate::adoption::repository::{AdoptionLedger, AnimalStore};

fn coordinator() -> (AdoptionCoordinator<MemoryStore>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::default());
    (AdoptionCoordinator::new(store.clone()), store)
}

async fn status_of<L: AdoptionLedger>(
    ledger: &L,
    id: crate::adoption::domain::RequestId,
) -> AdoptionStatus {
    ledger
        .get_request(id)
        .await
        .expect("get")
        .expect("request exists")
        .status
}

#[tokio::test]
async fn approval_denies_siblings_and_closes_animal() {
    let (coordinator, store) = coordinator();
    list_dog(store.as_ref(), 1).await;
    let winner = apply(store.as_ref(), AnimalId(1), "Ana").await;
    let sibling = apply(store.as_ref(), AnimalId(1), "Bruno").await;

    let approval = coordinator
        .approve(AnimalId(1), winner.id)
        .await
        .expect("approve");

    assert_eq!(approval.request.status, AdoptionStatus::Approved);
    assert_eq!(approval.animal.status, AnimalStatus::Unavailable);
    assert_eq!(approval.denied_siblings, 1);
    assert_eq!(status_of(store.as_ref(), sibling.id).await, AdoptionStatus::Denied);
}

#[tokio::test]
async fn approving_a_denied_sibling_conflicts() {
    let (coordinator, store) = coordinator();
    list_dog(store.as_ref(), 1).await;
    let winner = apply(store.as_ref(), AnimalId(1), "Ana").await;
    let sibling = apply(store.as_ref(), AnimalId(1), "Bruno").await;
    coordinator
        .approve(AnimalId(1), winner.id)
        .await
        .expect("approve");

    let err = coordinator
        .approve(AnimalId(1), sibling.id)
        .await
        .expect_err("already denied");
    assert!(matches!(
        err,
        CoordinatorError::InvalidTransition {
            conflict: TransitionConflict::AlreadyDecided(AdoptionStatus::Denied),
            ..
        }
    ));
}

#[tokio::test]
async fn approval_is_refused_for_unavailable_animals() {
    let (coordinator, store) = coordinator();
    list_dog(store.as_ref(), 1).await;
    let request = apply(store.as_ref(), AnimalId(1), "Ana").await;
    store
        .update_fields(
            AnimalId(1),
            AnimalPatch::status(AnimalStatus::Unavailable),
            Scope::Any,
        )
        .await
        .expect("close");

    let err = coordinator
        .approve(AnimalId(1), request.id)
        .await
        .expect_err("closed");
    assert!(matches!(
        err,
        CoordinatorError::InvalidTransition {
            conflict: TransitionConflict::AnimalClosed,
            ..
        }
    ));
    assert_eq!(status_of(store.as_ref(), request.id).await, AdoptionStatus::Pending);
}

#[tokio::test]
async fn denial_leaves_animal_open() {
    let (coordinator, store) = coordinator();
    list_dog(store.as_ref(), 1).await;
    let request = apply(store.as_ref(), AnimalId(1), "Ana").await;

    let denied = coordinator
        .deny(AnimalId(1), request.id)
        .await
        .expect("deny");
    assert_eq!(denied.status, AdoptionStatus::Denied);

    let animal = store
        .get_animal(AnimalId(1))
        .await
        .expect("get")
        .expect("animal");
    assert_eq!(animal.status, AnimalStatus::Adoptable);

    let err = coordinator
        .deny(AnimalId(1), request.id)
        .await
        .expect_err("terminal");
    assert!(matches!(err, CoordinatorError::InvalidTransition { .. }));
}

#[tokio::test]
async fn deciding_against_the_wrong_animal_is_not_found() {
    let (coordinator, store) = coordinator();
    list_dog(store.as_ref(), 1).await;
    list_dog(store.as_ref(), 2).await;
    let request = apply(store.as_ref(), AnimalId(1), "Ana").await;

    let err = coordinator
        .decide(request.id, Some(AnimalId(2)), Decision::Deny, Scope::Any)
        .await
        .expect_err("mismatch");
    assert!(matches!(
        err,
        CoordinatorError::RequestNotFound {
            animal: AnimalId(2),
            ..
        }
    ));
    assert_eq!(status_of(store.as_ref(), request.id).await, AdoptionStatus::Pending);
}

#[tokio::test]
async fn deciding_outside_the_callers_scope_is_not_found() {
    let (coordinator, store) = coordinator();
    list_dog(store.as_ref(), 1).await;
    let request = apply(store.as_ref(), AnimalId(1), "Ana").await;

    let err = coordinator
        .decide(request.id, None, Decision::Approve, Scope::Organization(RIVAL))
        .await
        .expect_err("foreign animal");
    assert!(matches!(err, CoordinatorError::RequestNotFound { .. }));

    let decided = coordinator
        .decide(request.id, None, Decision::Approve, Scope::Organization(SHELTER))
        .await
        .expect("owner decides");
    assert!(matches!(decided, Decided::Approved(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_leave_exactly_one_winner() {
    let (coordinator, store) = coordinator();
    list_dog(store.as_ref(), 1).await;
    let mut ids = Vec::new();
    for name in ["Ana", "Bruno", "Carla", "Davi", "Elis", "Fábio"] {
        ids.push(apply(store.as_ref(), AnimalId(1), name).await.id);
    }

    let handles: Vec<_> = ids
        .iter()
        .map(|&id| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.approve(AnimalId(1), id).await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.expect("task") {
            Ok(_) => successes += 1,
            Err(CoordinatorError::InvalidTransition { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(successes, 1);

    let requests = store.list_by_animal(AnimalId(1)).await.expect("list");
    let approved = requests
        .iter()
        .filter(|request| request.status == AdoptionStatus::Approved)
        .count();
    let denied = requests
        .iter()
        .filter(|request| request.status == AdoptionStatus::Denied)
        .count();
    assert_eq!(approved, 1);
    assert_eq!(denied, ids.len() - 1);

    let animal = store
        .get_animal(AnimalId(1))
        .await
        .expect("get")
        .expect("animal");
    assert_eq!(animal.status, AnimalStatus::Unavailable);
}

#[tokio::test]
async fn retrying_a_completed_approval_changes_nothing() {
    let (coordinator, store) = coordinator();
    list_dog(store.as_ref(), 1).await;
    let winner = apply(store.as_ref(), AnimalId(1), "Ana").await;
    apply(store.as_ref(), AnimalId(1), "Bruno").await;
    coordinator
        .approve(AnimalId(1), winner.id)
        .await
        .expect("first approval");

    let animal_before = store.get_animal(AnimalId(1)).await.expect("get");
    let requests_before = store.list_by_animal(AnimalId(1)).await.expect("list");

    let err = coordinator
        .approve(AnimalId(1), winner.id)
        .await
        .expect_err("already approved");
    assert!(matches!(
        err,
        CoordinatorError::InvalidTransition {
            conflict: TransitionConflict::AlreadyDecided(AdoptionStatus::Approved),
            ..
        }
    ));

    assert_eq!(store.get_animal(AnimalId(1)).await.expect("get"), animal_before);
    assert_eq!(
        store.list_by_animal(AnimalId(1)).await.expect("list"),
        requests_before
    );
}

#[tokio::test]
async fn failed_close_is_reported_with_its_step_and_finished_on_retry() {
    let store = Arc::new(FlakyStore::default());
    let coordinator = AdoptionCoordinator::new(store.clone());
    list_dog(store.as_ref(), 1).await;
    let winner = apply(store.as_ref(), AnimalId(1), "Ana").await;
    let sibling = apply(store.as_ref(), AnimalId(1), "Bruno").await;

    store.arm(FailPoint::CloseAnimal);
    let err = coordinator
        .approve(AnimalId(1), winner.id)
        .await
        .expect_err("close fails");
    assert!(matches!(
        err,
        CoordinatorError::Step {
            step: ApprovalStep::CloseAnimal,
            ..
        }
    ));
    assert_eq!(status_of(store.as_ref(), winner.id).await, AdoptionStatus::Approved);
    let animal = store.get_animal(AnimalId(1)).await.expect("get").expect("animal");
    assert_eq!(animal.status, AnimalStatus::Adoptable);

    store.heal();
    let retry = coordinator
        .approve(AnimalId(1), winner.id)
        .await
        .expect_err("already approved");
    assert!(matches!(
        retry,
        CoordinatorError::InvalidTransition {
            conflict: TransitionConflict::AlreadyDecided(AdoptionStatus::Approved),
            ..
        }
    ));

    let animal = store.get_animal(AnimalId(1)).await.expect("get").expect("animal");
    assert_eq!(animal.status, AnimalStatus::Unavailable);
    assert_eq!(status_of(store.as_ref(), sibling.id).await, AdoptionStatus::Denied);
}

#[tokio::test]
async fn claim_failure_changes_nothing() {
    let store = Arc::new(FlakyStore::default());
    let coordinator = AdoptionCoordinator::new(store.clone());
    list_dog(store.as_ref(), 1).await;
    let request = apply(store.as_ref(), AnimalId(1), "Ana").await;

    store.arm(FailPoint::Claim);
    let err = coordinator
        .approve(AnimalId(1), request.id)
        .await
        .expect_err("claim fails");
    assert!(matches!(
        err,
        CoordinatorError::Step {
            step: ApprovalStep::Claim,
            ..
        }
    ));
    assert_eq!(status_of(store.as_ref(), request.id).await, AdoptionStatus::Pending);
}

#[tokio::test]
async fn competing_approval_after_partial_failure_denies_the_loser() {
    let store = Arc::new(FlakyStore::default());
    let coordinator = AdoptionCoordinator::new(store.clone());
    list_dog(store.as_ref(), 1).await;
    let winner = apply(store.as_ref(), AnimalId(1), "Ana").await;
    let loser = apply(store.as_ref(), AnimalId(1), "Bruno").await;

    store.arm(FailPoint::DenySiblings);
    coordinator
        .approve(AnimalId(1), winner.id)
        .await
        .expect_err("deny siblings fails");
    assert_eq!(status_of(store.as_ref(), loser.id).await, AdoptionStatus::Pending);

    store.heal();
    let err = coordinator
        .approve(AnimalId(1), loser.id)
        .await
        .expect_err("animal already claimed");
    assert!(matches!(
        err,
        CoordinatorError::InvalidTransition {
            conflict: TransitionConflict::AnimalClosed,
            ..
        }
    ));
    assert_eq!(status_of(store.as_ref(), loser.id).await, AdoptionStatus::Denied);
    let animal = store.get_animal(AnimalId(1)).await.expect("get").expect("animal");
    assert_eq!(animal.status, AnimalStatus::Unavailable);
}

#[tokio::test]
async fn reconcile_repairs_half_applied_approvals() {
    let store = Arc::new(FlakyStore::default());
    let coordinator = AdoptionCoordinator::new(store.clone());
    list_dog(store.as_ref(), 1).await;
    let winner = apply(store.as_ref(), AnimalId(1), "Ana").await;
    apply(store.as_ref(), AnimalId(1), "Bruno").await;

    store.arm(FailPoint::DenySiblings);
    coordinator
        .approve(AnimalId(1), winner.id)
        .await
        .expect_err("partial");
    store.heal();

    let outcome = coordinator.reconcile(AnimalId(1)).await.expect("reconcile");
    assert_eq!(outcome.approved_request, Some(winner.id));
    assert_eq!(outcome.denied_pending, 1);
    assert!(outcome.closed_animal);
    assert!(outcome.repaired());

    let again = coordinator.reconcile(AnimalId(1)).await.expect("reconcile");
    assert!(!again.repaired());
}

#[tokio::test]
async fn reconcile_leaves_open_animals_alone() {
    let (coordinator, store) = coordinator();
    list_dog(store.as_ref(), 1).await;
    apply(store.as_ref(), AnimalId(1), "Ana").await;

    let outcome = coordinator.reconcile(AnimalId(1)).await.expect("reconcile");
    assert_eq!(outcome.approved_request, None);
    assert!(!outcome.repaired());

    let err = coordinator
        .reconcile(AnimalId(99))
        .await
        .expect_err("missing animal");
    assert!(matches!(err, CoordinatorError::AnimalNotFound(AnimalId(99))));
}

#[tokio::test]
async fn reconcile_all_covers_every_animal_in_scope() {
    let (coordinator, store) = coordinator();
    list_dog(store.as_ref(), 1).await;
    list_dog(store.as_ref(), 2).await;
    let approved = apply(store.as_ref(), AnimalId(2), "Ana").await;
    store
        .set_status(approved.id, AdoptionStatus::Approved)
        .await
        .expect("force approval");

    let outcomes = coordinator
        .reconcile_all(Scope::Organization(SHELTER))
        .await
        .expect("sweep");
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes.iter().filter(|outcome| outcome.repaired()).count(), 1);

    let foreign = coordinator
        .reconcile_all(Scope::Organization(RIVAL))
        .await
        .expect("sweep");
    assert!(foreign.is_empty());
}
