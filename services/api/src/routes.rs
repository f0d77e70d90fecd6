use crate::infra::AppState;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use axum::Json;
use pet_adoption::adoption::{adoption_router, AdoptionBackend, AdoptionDesk, LocalImageHost};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

pub(crate) fn with_adoption_routes<B>(
    desk: Arc<AdoptionDesk<B>>,
    images: Arc<LocalImageHost>,
) -> axum::Router
where
    B: AdoptionBackend + 'static,
{
    let router = adoption_router(desk)
        .route("/health", axum::routing::get(healthcheck))
        .route("/ready", axum::routing::get(readiness_endpoint))
        .route("/metrics", axum::routing::get(metrics_endpoint));

    // Absolute base URLs point at an external server that owns the files.
    let base = images.public_base_url();
    if !base.starts_with('/') {
        return router;
    }
    let uploads = axum::Router::new()
        .route(
            &format!("{}/:file", base.trim_end_matches('/')),
            axum::routing::get(uploaded_image),
        )
        .with_state(images);
    router.merge(uploads)
}

pub(crate) async fn uploaded_image(
    State(images): State<Arc<LocalImageHost>>,
    Path(file): Path<String>,
) -> Response {
    match images.read(&file).await {
        Ok(Some(bytes)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, mime::IMAGE_PNG.as_ref())],
            bytes,
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("image {file} not found") })),
        )
            .into_response(),
        Err(err) => {
            error!(file = %file, error = %err, "failed to read uploaded image");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal server error" })),
            )
                .into_response()
        }
    }
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
