use metrics_exporter_prometheus::PrometheusHandle;
use pet_adoption::adoption::{MemoryStore, PostgresStore};
use pet_adoption::config::StorageConfig;
use pet_adoption::error::AppError;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Persistence backend selected from configuration.
pub(crate) enum Backend {
    Memory(Arc<MemoryStore>),
    Postgres(Arc<PostgresStore>),
}

pub(crate) async fn open_backend(storage: &StorageConfig) -> Result<Backend, AppError> {
    match storage.database_url.as_deref() {
        Some(url) => {
            let store = PostgresStore::connect(url, storage).await?;
            Ok(Backend::Postgres(Arc::new(store)))
        }
        None => {
            warn!("DATABASE_URL not set; records live in process memory only");
            Ok(Backend::Memory(Arc::new(MemoryStore::default())))
        }
    }
}
