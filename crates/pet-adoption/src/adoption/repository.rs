use async_trait::async_trait;

use super::domain::{
    AdoptionRequest, AdoptionStatus, Animal, AnimalId, AnimalPatch, NewAdoptionRequest,
    NewAnimal, Photo, RequestId, Scope,
};

/// Durable storage of animals and their photos.
///
/// Reads always reflect the latest committed write; there is no caching layer.
#[async_trait]
pub trait AnimalStore: Send + Sync {
    async fn get_animal(&self, id: AnimalId) -> Result<Option<Animal>, StoreError>;

    async fn list_animals(&self, scope: Scope) -> Result<Vec<Animal>, StoreError>;

    /// Inserts with `status_changed_at = now`; status defaults to adoptable.
    async fn create_animal(&self, animal: NewAnimal) -> Result<Animal, StoreError>;

    /// Returns `None` when no animal matches `id` within `scope`.
    async fn update_fields(
        &self,
        id: AnimalId,
        patch: AnimalPatch,
        scope: Scope,
    ) -> Result<Option<Animal>, StoreError>;

    /// Deletes photos and adoption requests first, then the animal row.
    async fn remove_animal(&self, id: AnimalId, scope: Scope) -> Result<bool, StoreError>;

    /// The first photo stored for an animal becomes its primary photo.
    async fn attach_photo(
        &self,
        id: AnimalId,
        url: String,
        scope: Scope,
    ) -> Result<Option<Photo>, StoreError>;

    async fn photos(&self, id: AnimalId) -> Result<Vec<Photo>, StoreError>;
}

/// Storage of adoption requests plus the status primitives used by the coordinator.
#[async_trait]
pub trait AdoptionLedger: Send + Sync {
    /// Fails with [`StoreError::UnknownAnimal`] when the animal does not exist.
    async fn create_request(&self, request: NewAdoptionRequest) -> Result<AdoptionRequest, StoreError>;

    async fn get_request(&self, id: RequestId) -> Result<Option<AdoptionRequest>, StoreError>;

    /// Newest-created first.
    async fn list_by_animal(&self, animal: AnimalId) -> Result<Vec<AdoptionRequest>, StoreError>;

    /// Unconditional status write. Does not guard the single-approved invariant.
    async fn set_status(
        &self,
        id: RequestId,
        status: AdoptionStatus,
    ) -> Result<Option<AdoptionRequest>, StoreError>;

    /// Denies every pending request of `animal` other than `except`, returning how many changed.
    async fn deny_all_pending_except(
        &self,
        animal: AnimalId,
        except: RequestId,
    ) -> Result<u64, StoreError>;

    async fn remove_request(&self, id: RequestId) -> Result<bool, StoreError>;

    /// Atomically moves a pending request of `animal` to `target`.
    ///
    /// For an approval the animal must still be adoptable and have no approved request; the
    /// check and the write happen under one lock or transaction, so two concurrent approvals
    /// for the same animal cannot both apply.
    async fn transition_pending(
        &self,
        animal: AnimalId,
        id: RequestId,
        target: AdoptionStatus,
    ) -> Result<Transition, StoreError>;
}

/// Everything the coordinator needs from a persistence backend.
pub trait AdoptionBackend: AnimalStore + AdoptionLedger {}

impl<T> AdoptionBackend for T where T: AnimalStore + AdoptionLedger {}

/// Result of [`AdoptionLedger::transition_pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied(AdoptionRequest),
    /// The request does not exist or belongs to another animal.
    Missing,
    /// The request already reached a terminal state.
    AlreadyDecided(AdoptionRequest),
    /// Approval refused: the animal is unavailable or another request holds the approval.
    AnimalClosed { approved: Option<RequestId> },
}

/// Error enumeration for persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("animal {0} does not exist")]
    UnknownAnimal(AnimalId),
    #[error("record already exists")]
    Conflict,
    #[error("stored value is invalid: {0}")]
    Corrupt(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        match &value {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(value.to_string())
            }
            _ => StoreError::Unavailable(value.to_string()),
        }
    }
}
