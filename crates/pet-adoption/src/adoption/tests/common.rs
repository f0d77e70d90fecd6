use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request};
use axum::response::Response;
use serde_json::Value;

use crate::adoption::auth::StaticTokenAuthenticator;
use crate::adoption::domain::{
    AdoptionRequest, AdoptionStatus, Animal, AnimalId, AnimalKind, AnimalPatch, AnimalStatus,
    ApplicantDetails, NewAdoptionRequest, NewAnimal, OrganizationId, Photo, RequestId, Scope,
};
use crate::adoption::images::{validate_png, ImageHost, ImageHostError};
use crate::adoption::memory::MemoryStore;
use crate::adoption::repository::{AdoptionLedger, AnimalStore, StoreError, Transition};
use crate::adoption::router::{adoption_router, AdoptionDesk};

pub(super) const SHELTER: OrganizationId = OrganizationId(1);
pub(super) const RIVAL: OrganizationId = OrganizationId(2);
pub(super) const SHELTER_TOKEN: &str = "shelter-token";
pub(super) const RIVAL_TOKEN: &str = "rival-token";

pub(super) const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n', 0, 0];

pub(super) fn dog(id: i64) -> NewAnimal {
    NewAnimal {
        id: Some(AnimalId(id)),
        organization_id: Some(SHELTER),
        name: Some("Caramelo".to_string()),
        ..NewAnimal::of_kind(AnimalKind::Dog)
    }
}

pub(super) fn applicant(name: &str) -> ApplicantDetails {
    ApplicantDetails {
        name: name.to_string(),
        email: format!("{}@example.org", name.to_lowercase()),
        phone: "+55 11 99999-0000".to_string(),
        address: "Rua das Flores, 10".to_string(),
        experience: "Two dogs before".to_string(),
        message: "Big yard".to_string(),
    }
}

pub(super) async fn list_dog<S: AnimalStore>(store: &S, id: i64) -> Animal {
    store.create_animal(dog(id)).await.expect("animal listed")
}

pub(super) async fn apply<L: AdoptionLedger>(
    ledger: &L,
    animal: AnimalId,
    name: &str,
) -> AdoptionRequest {
    ledger
        .create_request(NewAdoptionRequest {
            animal_id: animal,
            applicant: applicant(name),
        })
        .await
        .expect("request stored")
}

/// Which write [`FlakyStore`] should refuse while armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FailPoint {
    Claim,
    DenySiblings,
    CloseAnimal,
    /// `attach_photo` answers as if the animal was removed after the upload started.
    PhotoTargetGone,
}

/// Memory store that fails one chosen write until healed.
#[derive(Default)]
pub(super) struct FlakyStore {
    pub(super) inner: MemoryStore,
    armed: Mutex<Option<FailPoint>>,
}

impl FlakyStore {
    pub(super) fn arm(&self, point: FailPoint) {
        *self.armed.lock().expect("flaky mutex poisoned") = Some(point);
    }

    pub(super) fn heal(&self) {
        *self.armed.lock().expect("flaky mutex poisoned") = None;
    }

    fn check(&self, point: FailPoint) -> Result<(), StoreError> {
        if *self.armed.lock().expect("flaky mutex poisoned") == Some(point) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AnimalStore for FlakyStore {
    async fn get_animal(&self, id: AnimalId) -> Result<Option<Animal>, StoreError> {
        self.inner.get_animal(id).await
    }

    async fn list_animals(&self, scope: Scope) -> Result<Vec<Animal>, StoreError> {
        self.inner.list_animals(scope).await
    }

    async fn create_animal(&self, animal: NewAnimal) -> Result<Animal, StoreError> {
        self.inner.create_animal(animal).await
    }

    async fn update_fields(
        &self,
        id: AnimalId,
        patch: AnimalPatch,
        scope: Scope,
    ) -> Result<Option<Animal>, StoreError> {
        if patch.status == Some(AnimalStatus::Unavailable) {
            self.check(FailPoint::CloseAnimal)?;
        }
        self.inner.update_fields(id, patch, scope).await
    }

    async fn remove_animal(&self, id: AnimalId, scope: Scope) -> Result<bool, StoreError> {
        self.inner.remove_animal(id, scope).await
    }

    async fn attach_photo(
        &self,
        id: AnimalId,
        url: String,
        scope: Scope,
    ) -> Result<Option<Photo>, StoreError> {
        if self.check(FailPoint::PhotoTargetGone).is_err() {
            return Ok(None);
        }
        self.inner.attach_photo(id, url, scope).await
    }

    async fn photos(&self, id: AnimalId) -> Result<Vec<Photo>, StoreError> {
        self.inner.photos(id).await
    }
}

#[async_trait]
impl AdoptionLedger for FlakyStore {
    async fn create_request(
        &self,
        request: NewAdoptionRequest,
    ) -> Result<AdoptionRequest, StoreError> {
        self.inner.create_request(request).await
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<AdoptionRequest>, StoreError> {
        self.inner.get_request(id).await
    }

    async fn list_by_animal(&self, animal: AnimalId) -> Result<Vec<AdoptionRequest>, StoreError> {
        self.inner.list_by_animal(animal).await
    }

    async fn set_status(
        &self,
        id: RequestId,
        status: AdoptionStatus,
    ) -> Result<Option<AdoptionRequest>, StoreError> {
        self.inner.set_status(id, status).await
    }

    async fn deny_all_pending_except(
        &self,
        animal: AnimalId,
        except: RequestId,
    ) -> Result<u64, StoreError> {
        self.check(FailPoint::DenySiblings)?;
        self.inner.deny_all_pending_except(animal, except).await
    }

    async fn remove_request(&self, id: RequestId) -> Result<bool, StoreError> {
        self.inner.remove_request(id).await
    }

    async fn transition_pending(
        &self,
        animal: AnimalId,
        id: RequestId,
        target: AdoptionStatus,
    ) -> Result<Transition, StoreError> {
        self.check(FailPoint::Claim)?;
        self.inner.transition_pending(animal, id, target).await
    }
}

/// Image host that keeps nothing and hands out predictable URLs.
#[derive(Default)]
pub(super) struct RecordingImageHost {
    stored: AtomicU64,
    discarded: Mutex<Vec<String>>,
}

impl RecordingImageHost {
    pub(super) fn stored(&self) -> u64 {
        self.stored.load(Ordering::SeqCst)
    }

    pub(super) fn discarded(&self) -> Vec<String> {
        self.discarded.lock().expect("image mutex poisoned").clone()
    }
}

#[async_trait]
impl ImageHost for RecordingImageHost {
    async fn store(&self, bytes: Vec<u8>) -> Result<String, ImageHostError> {
        validate_png(&bytes)?;
        let n = self.stored.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("https://images.test/{n}.png"))
    }

    async fn discard(&self, url: &str) -> Result<(), ImageHostError> {
        self.discarded
            .lock()
            .expect("image mutex poisoned")
            .push(url.to_string());
        Ok(())
    }
}

pub(super) fn authenticator() -> Arc<StaticTokenAuthenticator> {
    Arc::new(
        StaticTokenAuthenticator::default()
            .with_token(SHELTER_TOKEN, SHELTER)
            .with_token(RIVAL_TOKEN, RIVAL),
    )
}

pub(super) fn desk(
    store: Arc<MemoryStore>,
    images: Arc<RecordingImageHost>,
) -> Arc<AdoptionDesk<MemoryStore>> {
    Arc::new(AdoptionDesk::new(store, authenticator(), images))
}

pub(super) fn router_with_store(store: Arc<MemoryStore>) -> axum::Router {
    adoption_router(desk(store, Arc::new(RecordingImageHost::default())))
}

pub(super) fn json_request(
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: &Value,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder
        .body(Body::from(serde_json::to_vec(body).expect("encode body")))
        .expect("request")
}

pub(super) fn bare_request(method: Method, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("request")
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
