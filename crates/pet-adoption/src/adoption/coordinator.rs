//! Approval protocol for adoption requests.
//!
//! Approving a request runs three writes in a fixed order:
//!
//! 1. claim: the request moves `pending -> approved` in one atomic check-and-write that also
//!    refuses when the animal is already closed;
//! 2. the animal's other pending requests are denied;
//! 3. the animal is marked unavailable.
//!
//! A crash between writes leaves "request approved, animal still adoptable" at worst. There is
//! no rollback: retrying the approval, or running [`AdoptionCoordinator::reconcile`], finishes
//! steps 2 and 3 from whichever approved request holds the animal.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use super::domain::{
    AdoptionRequest, AdoptionStatus, Animal, AnimalId, AnimalPatch, AnimalStatus, RequestId,
    Scope,
};
use super::repository::{AdoptionBackend, StoreError, Transition};

/// Write sequence position reported when a persistence call fails mid-approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStep {
    Claim,
    DenySiblings,
    CloseAnimal,
}

impl ApprovalStep {
    pub const fn label(self) -> &'static str {
        match self {
            ApprovalStep::Claim => "claim",
            ApprovalStep::DenySiblings => "deny_siblings",
            ApprovalStep::CloseAnimal => "close_animal",
        }
    }
}

impl fmt::Display for ApprovalStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionConflict {
    AlreadyDecided(AdoptionStatus),
    AnimalClosed,
}

impl fmt::Display for TransitionConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionConflict::AlreadyDecided(status) => write!(f, "request is already {status}"),
            TransitionConflict::AnimalClosed => write!(f, "animal is no longer open for adoption"),
        }
    }
}

/// Administrative decision on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny,
}

impl TryFrom<AdoptionStatus> for Decision {
    type Error = AdoptionStatus;

    fn try_from(value: AdoptionStatus) -> Result<Self, Self::Error> {
        match value {
            AdoptionStatus::Approved => Ok(Decision::Approve),
            AdoptionStatus::Denied => Ok(Decision::Deny),
            AdoptionStatus::Pending => Err(value),
        }
    }
}

/// Outcome of a successful approval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Approval {
    pub request: AdoptionRequest,
    pub animal: Animal,
    pub denied_siblings: u64,
}

/// Outcome of a successful decision through [`AdoptionCoordinator::decide`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decided {
    Approved(Approval),
    Denied(AdoptionRequest),
}

impl Decided {
    pub fn request(&self) -> &AdoptionRequest {
        match self {
            Decided::Approved(approval) => &approval.request,
            Decided::Denied(request) => request,
        }
    }
}

/// What a reconciliation pass found and repaired for one animal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub animal_id: AnimalId,
    pub approved_request: Option<RequestId>,
    pub denied_pending: u64,
    pub closed_animal: bool,
}

impl Reconciliation {
    pub fn repaired(&self) -> bool {
        self.denied_pending > 0 || self.closed_animal
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("adoption request {request} not found for animal {animal}")]
    RequestNotFound { animal: AnimalId, request: RequestId },
    #[error("adoption request {0} not found")]
    UnknownRequest(RequestId),
    #[error("animal {0} not found")]
    AnimalNotFound(AnimalId),
    #[error("cannot change adoption request {request}: {conflict}")]
    InvalidTransition {
        request: RequestId,
        conflict: TransitionConflict,
    },
    #[error("animal {animal}, request {request}: {step} failed: {source}")]
    Step {
        animal: AnimalId,
        request: RequestId,
        step: ApprovalStep,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The only component allowed to approve adoption requests.
pub struct AdoptionCoordinator<B> {
    backend: Arc<B>,
}

impl<B> Clone for AdoptionCoordinator<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
        }
    }
}

impl<B> AdoptionCoordinator<B>
where
    B: AdoptionBackend + 'static,
{
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub async fn approve(
        &self,
        animal: AnimalId,
        request: RequestId,
    ) -> Result<Approval, CoordinatorError> {
        let step_failed = |step: ApprovalStep| {
            move |source: StoreError| {
                error!(
                    animal_id = %animal,
                    request_id = %request,
                    step = step.label(),
                    error = %source,
                    "approval write failed; retry or reconcile to finish"
                );
                CoordinatorError::Step {
                    animal,
                    request,
                    step,
                    source,
                }
            }
        };

        let claimed = match self
            .backend
            .transition_pending(animal, request, AdoptionStatus::Approved)
            .await
            .map_err(step_failed(ApprovalStep::Claim))?
        {
            Transition::Applied(claimed) => claimed,
            Transition::Missing => {
                return Err(CoordinatorError::RequestNotFound { animal, request })
            }
            Transition::AlreadyDecided(current) => {
                if current.status == AdoptionStatus::Approved {
                    // A previous attempt may have stopped after the claim.
                    self.finish_closure(animal, request)
                        .await
                        .map_err(|(step, source)| step_failed(step)(source))?;
                }
                return Err(CoordinatorError::InvalidTransition {
                    request,
                    conflict: TransitionConflict::AlreadyDecided(current.status),
                });
            }
            Transition::AnimalClosed { approved } => {
                if let Some(winner) = approved {
                    self.finish_closure(animal, winner)
                        .await
                        .map_err(|(step, source)| step_failed(step)(source))?;
                }
                return Err(CoordinatorError::InvalidTransition {
                    request,
                    conflict: TransitionConflict::AnimalClosed,
                });
            }
        };
        info!(animal_id = %animal, request_id = %request, "adoption request approved");

        let denied_siblings = self
            .backend
            .deny_all_pending_except(animal, request)
            .await
            .map_err(step_failed(ApprovalStep::DenySiblings))?;

        let closed = self
            .backend
            .update_fields(animal, AnimalPatch::status(AnimalStatus::Unavailable), Scope::Any)
            .await
            .map_err(step_failed(ApprovalStep::CloseAnimal))?
            .ok_or(CoordinatorError::AnimalNotFound(animal))?;

        info!(
            animal_id = %animal,
            request_id = %request,
            denied_siblings,
            "animal closed for adoption"
        );

        Ok(Approval {
            request: claimed,
            animal: closed,
            denied_siblings,
        })
    }

    pub async fn deny(
        &self,
        animal: AnimalId,
        request: RequestId,
    ) -> Result<AdoptionRequest, CoordinatorError> {
        match self
            .backend
            .transition_pending(animal, request, AdoptionStatus::Denied)
            .await?
        {
            Transition::Applied(denied) => {
                info!(animal_id = %animal, request_id = %request, "adoption request denied");
                Ok(denied)
            }
            Transition::Missing => Err(CoordinatorError::RequestNotFound { animal, request }),
            Transition::AlreadyDecided(current) => Err(CoordinatorError::InvalidTransition {
                request,
                conflict: TransitionConflict::AlreadyDecided(current.status),
            }),
            Transition::AnimalClosed { .. } => Err(CoordinatorError::InvalidTransition {
                request,
                conflict: TransitionConflict::AnimalClosed,
            }),
        }
    }

    /// Resolves the request's animal, checks the caller's scope, then approves or denies.
    ///
    /// When `animal` is given it must match the request's animal.
    pub async fn decide(
        &self,
        request: RequestId,
        animal: Option<AnimalId>,
        decision: Decision,
        scope: Scope,
    ) -> Result<Decided, CoordinatorError> {
        let record = self
            .backend
            .get_request(request)
            .await?
            .ok_or(CoordinatorError::UnknownRequest(request))?;
        let animal_id = record.animal_id;
        if animal.is_some_and(|expected| expected != animal_id) {
            return Err(CoordinatorError::RequestNotFound {
                animal: animal.unwrap_or(animal_id),
                request,
            });
        }

        let visible = self
            .backend
            .get_animal(animal_id)
            .await?
            .is_some_and(|listed| scope.permits(&listed));
        if !visible {
            return Err(CoordinatorError::RequestNotFound {
                animal: animal_id,
                request,
            });
        }

        match decision {
            Decision::Approve => self.approve(animal_id, request).await.map(Decided::Approved),
            Decision::Deny => self.deny(animal_id, request).await.map(Decided::Denied),
        }
    }

    /// Recomputes closure from the presence of an approved request and repairs the animal.
    ///
    /// Animals without an approved request are left as they are.
    pub async fn reconcile(&self, animal: AnimalId) -> Result<Reconciliation, CoordinatorError> {
        if self.backend.get_animal(animal).await?.is_none() {
            return Err(CoordinatorError::AnimalNotFound(animal));
        }

        let requests = self.backend.list_by_animal(animal).await?;
        let mut approved = requests
            .iter()
            .filter(|request| request.status == AdoptionStatus::Approved)
            .map(|request| request.id);
        let Some(winner) = approved.next() else {
            return Ok(Reconciliation {
                animal_id: animal,
                approved_request: None,
                denied_pending: 0,
                closed_animal: false,
            });
        };
        if approved.next().is_some() {
            error!(animal_id = %animal, "animal has more than one approved adoption request");
        }

        let (denied_pending, closed_animal) = self
            .finish_closure(animal, winner)
            .await
            .map_err(|(step, source)| CoordinatorError::Step {
                animal,
                request: winner,
                step,
                source,
            })?;

        Ok(Reconciliation {
            animal_id: animal,
            approved_request: Some(winner),
            denied_pending,
            closed_animal,
        })
    }

    /// Reconciles every animal in `scope`.
    pub async fn reconcile_all(
        &self,
        scope: Scope,
    ) -> Result<Vec<Reconciliation>, CoordinatorError> {
        let mut outcomes = Vec::new();
        for animal in self.backend.list_animals(scope).await? {
            match self.reconcile(animal.id).await {
                Ok(outcome) => outcomes.push(outcome),
                // Deleted between the listing and the pass.
                Err(CoordinatorError::AnimalNotFound(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        Ok(outcomes)
    }

    /// Denies stray pending requests and makes sure the animal is unavailable.
    ///
    /// The animal is only written when it is still adoptable, so an already-consistent animal
    /// keeps its `status_changed_at`.
    async fn finish_closure(
        &self,
        animal: AnimalId,
        approved: RequestId,
    ) -> Result<(u64, bool), (ApprovalStep, StoreError)> {
        let denied = self
            .backend
            .deny_all_pending_except(animal, approved)
            .await
            .map_err(|source| (ApprovalStep::DenySiblings, source))?;

        let needs_close = self
            .backend
            .get_animal(animal)
            .await
            .map_err(|source| (ApprovalStep::CloseAnimal, source))?
            .is_some_and(|record| record.status != AnimalStatus::Unavailable);
        if needs_close {
            self.backend
                .update_fields(animal, AnimalPatch::status(AnimalStatus::Unavailable), Scope::Any)
                .await
                .map_err(|source| (ApprovalStep::CloseAnimal, source))?;
        }

        if denied > 0 || needs_close {
            warn!(
                animal_id = %animal,
                request_id = %approved,
                denied_pending = denied,
                closed_animal = needs_close,
                "repaired partially applied approval"
            );
        }
        Ok((denied, needs_close))
    }
}
