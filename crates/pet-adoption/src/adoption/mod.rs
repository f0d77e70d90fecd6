//! Adoption request lifecycle: intake, the approval protocol, and the animal registry it closes.
//!
//! Persistence sits behind [`AnimalStore`] and [`AdoptionLedger`]; [`AdoptionCoordinator`] is the
//! only place that approves requests.

pub mod auth;
pub mod coordinator;
pub mod domain;
pub mod export;
pub mod images;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod router;

#[cfg(test)]
mod tests;

pub use auth::{AuthError, OrganizationAuthenticator, StaticTokenAuthenticator};
pub use coordinator::{
    AdoptionCoordinator, Approval, ApprovalStep, CoordinatorError, Decided, Decision,
    Reconciliation, TransitionConflict,
};
pub use domain::{
    AdoptionRequest, AdoptionStatus, Animal, AnimalId, AnimalKind, AnimalPatch, AnimalStatus,
    ApplicantDetails, NewAdoptionRequest, NewAnimal, OrganizationId, Photo, PhotoId, RequestId,
    Scope, UnknownLabel,
};
pub use export::write_requests_csv;
pub use images::{ImageHost, ImageHostError, LocalImageHost, MAX_IMAGE_BYTES};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use repository::{AdoptionBackend, AdoptionLedger, AnimalStore, StoreError, Transition};
pub use router::{adoption_router, AdoptionDesk, ApiError};
