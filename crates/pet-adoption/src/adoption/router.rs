use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use super::auth::{authenticate, AuthError, OrganizationAuthenticator};
use super::coordinator::{AdoptionCoordinator, CoordinatorError, Decision};
use super::domain::{
    AdoptionRequest, AdoptionStatus, Animal, AnimalId, AnimalPatch, NewAdoptionRequest,
    NewAnimal, OrganizationId, Photo, RequestId, Scope,
};
use super::images::{ImageHost, ImageHostError, MAX_IMAGE_BYTES};
use super::repository::{AdoptionBackend, StoreError};

/// Shared handler state: the persistence backend plus the external collaborators.
pub struct AdoptionDesk<B> {
    backend: Arc<B>,
    coordinator: AdoptionCoordinator<B>,
    authenticator: Arc<dyn OrganizationAuthenticator>,
    images: Arc<dyn ImageHost>,
}

impl<B> AdoptionDesk<B>
where
    B: AdoptionBackend + 'static,
{
    pub fn new(
        backend: Arc<B>,
        authenticator: Arc<dyn OrganizationAuthenticator>,
        images: Arc<dyn ImageHost>,
    ) -> Self {
        let coordinator = AdoptionCoordinator::new(backend.clone());
        Self {
            backend,
            coordinator,
            authenticator,
            images,
        }
    }

    pub fn coordinator(&self) -> &AdoptionCoordinator<B> {
        &self.coordinator
    }

    async fn caller(&self, headers: &HeaderMap) -> Result<OrganizationId, ApiError> {
        Ok(authenticate(self.authenticator.as_ref(), headers).await?)
    }

    /// Looks up an animal the caller may act on; foreign animals look missing.
    async fn scoped_animal(&self, id: AnimalId, scope: Scope) -> Result<Animal, ApiError> {
        self.backend
            .get_animal(id)
            .await?
            .filter(|animal| scope.permits(animal))
            .ok_or_else(|| ApiError::NotFound(format!("animal {id} not found")))
    }
}

/// Router builder exposing the adoption request and animal administration endpoints.
pub fn adoption_router<B>(desk: Arc<AdoptionDesk<B>>) -> Router
where
    B: AdoptionBackend + 'static,
{
    Router::new()
        .route("/api/adoptions", post(create_request_handler::<B>))
        .route(
            "/api/adoptions/:id",
            get(list_requests_handler::<B>)
                .put(decide_handler::<B>)
                .delete(remove_request_handler::<B>),
        )
        .route(
            "/api/admin/animals",
            get(list_animals_handler::<B>).post(create_animal_handler::<B>),
        )
        .route(
            "/api/admin/animals/:id",
            get(get_animal_handler::<B>)
                .put(update_animal_handler::<B>)
                .delete(remove_animal_handler::<B>),
        )
        .route(
            "/api/admin/animals/:id/photos",
            post(upload_photo_handler::<B>).layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES)),
        )
        .route(
            "/api/admin/animals/:id/reconcile",
            post(reconcile_handler::<B>),
        )
        .route("/api/animals/:id", get(animal_detail_handler::<B>))
        .with_state(desk)
}

#[derive(Debug, Serialize)]
pub(crate) struct RequestList {
    pub(crate) requests: Vec<AdoptionRequest>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DecisionPayload {
    pub(crate) status: String,
    #[serde(default, rename = "petId", alias = "pet_id")]
    pub(crate) pet_id: Option<AnimalId>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AnimalDetail {
    #[serde(flatten)]
    pub(crate) animal: Animal,
    pub(crate) photos: Vec<Photo>,
}

pub(crate) async fn create_request_handler<B>(
    State(desk): State<Arc<AdoptionDesk<B>>>,
    payload: Result<Json<NewAdoptionRequest>, JsonRejection>,
) -> Result<Response, ApiError>
where
    B: AdoptionBackend + 'static,
{
    let Json(request) = payload?;
    if request.applicant.name.trim().is_empty() {
        return Err(ApiError::Validation("name is required".to_string()));
    }
    if request.applicant.email.trim().is_empty() {
        return Err(ApiError::Validation("email is required".to_string()));
    }

    let created = desk.backend.create_request(request).await?;
    info!(
        animal_id = %created.animal_id,
        request_id = %created.id,
        "adoption request received"
    );
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

pub(crate) async fn list_requests_handler<B>(
    State(desk): State<Arc<AdoptionDesk<B>>>,
    Path(animal_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<RequestList>, ApiError>
where
    B: AdoptionBackend + 'static,
{
    let organization = desk.caller(&headers).await?;
    let animal_id = AnimalId(animal_id);

    match desk.backend.get_animal(animal_id).await? {
        None => Ok(Json(RequestList {
            requests: Vec::new(),
        })),
        Some(animal) if !Scope::Organization(organization).permits(&animal) => Err(
            ApiError::NotFound(format!("animal {animal_id} not found")),
        ),
        Some(_) => {
            let requests = desk.backend.list_by_animal(animal_id).await?;
            Ok(Json(RequestList { requests }))
        }
    }
}

pub(crate) async fn decide_handler<B>(
    State(desk): State<Arc<AdoptionDesk<B>>>,
    Path(request_id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<DecisionPayload>, JsonRejection>,
) -> Result<Json<AdoptionRequest>, ApiError>
where
    B: AdoptionBackend + 'static,
{
    let organization = desk.caller(&headers).await?;
    let Json(payload) = payload?;

    let status: AdoptionStatus = payload
        .status
        .parse()
        .map_err(|err| ApiError::Validation(format!("{err}")))?;
    let decision = Decision::try_from(status).map_err(|status| {
        ApiError::Validation(format!("status must be approved or denied, not {status}"))
    })?;

    // Run detached so a dropped connection cannot stop the write sequence halfway.
    let coordinator = desk.coordinator.clone();
    let request_id = RequestId(request_id);
    let scope = Scope::Organization(organization);
    let decided = tokio::spawn(async move {
        coordinator
            .decide(request_id, payload.pet_id, decision, scope)
            .await
    })
    .await
    .map_err(|err| {
        error!(request_id = %request_id, error = %err, "decision task aborted");
        ApiError::Internal
    })??;

    Ok(Json(decided.request().clone()))
}

pub(crate) async fn remove_request_handler<B>(
    State(desk): State<Arc<AdoptionDesk<B>>>,
    Path(request_id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError>
where
    B: AdoptionBackend + 'static,
{
    let organization = desk.caller(&headers).await?;
    let request_id = RequestId(request_id);
    let not_found = || ApiError::NotFound(format!("adoption request {request_id} not found"));

    let request = desk
        .backend
        .get_request(request_id)
        .await?
        .ok_or_else(not_found)?;
    desk.scoped_animal(request.animal_id, Scope::Organization(organization))
        .await
        .map_err(|_| not_found())?;

    if !desk.backend.remove_request(request_id).await? {
        return Err(not_found());
    }
    info!(
        animal_id = %request.animal_id,
        request_id = %request_id,
        status = request.status.label(),
        "adoption request removed"
    );
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn list_animals_handler<B>(
    State(desk): State<Arc<AdoptionDesk<B>>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Animal>>, ApiError>
where
    B: AdoptionBackend + 'static,
{
    let organization = desk.caller(&headers).await?;
    let animals = desk
        .backend
        .list_animals(Scope::Organization(organization))
        .await?;
    Ok(Json(animals))
}

pub(crate) async fn create_animal_handler<B>(
    State(desk): State<Arc<AdoptionDesk<B>>>,
    headers: HeaderMap,
    payload: Result<Json<NewAnimal>, JsonRejection>,
) -> Result<Response, ApiError>
where
    B: AdoptionBackend + 'static,
{
    let organization = desk.caller(&headers).await?;
    let Json(mut animal) = payload?;
    animal.organization_id = Some(organization);

    let created = desk.backend.create_animal(animal).await?;
    info!(animal_id = %created.id, organization_id = %organization, "animal listed");
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

pub(crate) async fn get_animal_handler<B>(
    State(desk): State<Arc<AdoptionDesk<B>>>,
    Path(animal_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Animal>, ApiError>
where
    B: AdoptionBackend + 'static,
{
    let organization = desk.caller(&headers).await?;
    let animal = desk
        .scoped_animal(AnimalId(animal_id), Scope::Organization(organization))
        .await?;
    Ok(Json(animal))
}

pub(crate) async fn update_animal_handler<B>(
    State(desk): State<Arc<AdoptionDesk<B>>>,
    Path(animal_id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<AnimalPatch>, JsonRejection>,
) -> Result<Json<Animal>, ApiError>
where
    B: AdoptionBackend + 'static,
{
    let organization = desk.caller(&headers).await?;
    let Json(patch) = payload?;
    let animal_id = AnimalId(animal_id);

    let updated = desk
        .backend
        .update_fields(animal_id, patch, Scope::Organization(organization))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("animal {animal_id} not found")))?;
    Ok(Json(updated))
}

pub(crate) async fn remove_animal_handler<B>(
    State(desk): State<Arc<AdoptionDesk<B>>>,
    Path(animal_id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError>
where
    B: AdoptionBackend + 'static,
{
    let organization = desk.caller(&headers).await?;
    let animal_id = AnimalId(animal_id);

    if !desk
        .backend
        .remove_animal(animal_id, Scope::Organization(organization))
        .await?
    {
        return Err(ApiError::NotFound(format!("animal {animal_id} not found")));
    }
    info!(animal_id = %animal_id, "animal removed with its photos and requests");
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn upload_photo_handler<B>(
    State(desk): State<Arc<AdoptionDesk<B>>>,
    Path(animal_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError>
where
    B: AdoptionBackend + 'static,
{
    let organization = desk.caller(&headers).await?;
    let scope = Scope::Organization(organization);
    let animal_id = AnimalId(animal_id);

    let is_png = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<mime::Mime>().ok())
        .is_some_and(|content_type| content_type.essence_str() == mime::IMAGE_PNG.essence_str());
    if !is_png {
        return Err(ImageHostError::UnsupportedFormat.into());
    }

    desk.scoped_animal(animal_id, scope).await?;
    let url = desk.images.store(body.to_vec()).await?;
    let attached = desk
        .backend
        .attach_photo(animal_id, url.clone(), scope)
        .await;
    let photo = match attached {
        Ok(Some(photo)) => photo,
        // The animal went away, or the row was not written: the stored image has no owner.
        Ok(None) => {
            discard_image(desk.images.as_ref(), animal_id, &url).await;
            return Err(ApiError::NotFound(format!("animal {animal_id} not found")));
        }
        Err(err) => {
            discard_image(desk.images.as_ref(), animal_id, &url).await;
            return Err(err.into());
        }
    };
    Ok((StatusCode::CREATED, Json(photo)).into_response())
}

async fn discard_image(images: &dyn ImageHost, animal_id: AnimalId, url: &str) {
    if let Err(err) = images.discard(url).await {
        warn!(animal_id = %animal_id, url, error = %err, "orphaned image could not be removed");
    }
}

pub(crate) async fn reconcile_handler<B>(
    State(desk): State<Arc<AdoptionDesk<B>>>,
    Path(animal_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response, ApiError>
where
    B: AdoptionBackend + 'static,
{
    let organization = desk.caller(&headers).await?;
    let animal_id = AnimalId(animal_id);
    desk.scoped_animal(animal_id, Scope::Organization(organization))
        .await?;

    let coordinator = desk.coordinator.clone();
    let outcome = tokio::spawn(async move { coordinator.reconcile(animal_id).await })
        .await
        .map_err(|err| {
            error!(animal_id = %animal_id, error = %err, "reconcile task aborted");
            ApiError::Internal
        })??;
    Ok(Json(outcome).into_response())
}

pub(crate) async fn animal_detail_handler<B>(
    State(desk): State<Arc<AdoptionDesk<B>>>,
    Path(animal_id): Path<i64>,
) -> Result<Json<AnimalDetail>, ApiError>
where
    B: AdoptionBackend + 'static,
{
    let animal = desk.scoped_animal(AnimalId(animal_id), Scope::Any).await?;
    let photos = desk.backend.photos(animal.id).await?;
    Ok(Json(AnimalDetail { animal, photos }))
}

/// HTTP-facing error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "error": self.to_string() }));
        let mut response = (status, body).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        ApiError::Validation(value.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::UnknownAnimal(_) => ApiError::Validation(value.to_string()),
            StoreError::Conflict => ApiError::Conflict(value.to_string()),
            StoreError::Corrupt(_) | StoreError::Unavailable(_) => {
                error!(error = %value, "persistence failure");
                ApiError::Internal
            }
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(value: CoordinatorError) -> Self {
        match value {
            CoordinatorError::RequestNotFound { .. }
            | CoordinatorError::UnknownRequest(_)
            | CoordinatorError::AnimalNotFound(_) => ApiError::NotFound(value.to_string()),
            CoordinatorError::InvalidTransition { .. } => ApiError::Conflict(value.to_string()),
            // Already logged with animal, request and step by the coordinator.
            CoordinatorError::Step { .. } => ApiError::Internal,
            CoordinatorError::Store(err) => err.into(),
        }
    }
}

impl From<ImageHostError> for ApiError {
    fn from(value: ImageHostError) -> Self {
        match value {
            ImageHostError::UnsupportedFormat | ImageHostError::TooLarge => {
                ApiError::Validation(value.to_string())
            }
            ImageHostError::Io(_) => {
                error!(error = %value, "image storage failure");
                ApiError::Internal
            }
        }
    }
}
