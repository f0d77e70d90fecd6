use crate::infra::{open_backend, Backend};
use clap::Args;
use pet_adoption::adoption::{
    write_requests_csv, AdoptionBackend, AdoptionCoordinator, AnimalId, CoordinatorError,
    Reconciliation, Scope,
};
use pet_adoption::config::AppConfig;
use pet_adoption::error::AppError;
use pet_adoption::telemetry;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args, Debug)]
pub(crate) struct ReconcileArgs {
    /// Only reconcile this animal (default: every animal)
    #[arg(long)]
    pub(crate) animal: Option<i64>,
}

#[derive(Args, Debug)]
pub(crate) struct ExportArgs {
    /// Animal whose requests are exported
    #[arg(long)]
    pub(crate) animal: i64,
    /// Write to this file instead of stdout
    #[arg(long)]
    pub(crate) output: Option<PathBuf>,
}

pub(crate) async fn run_reconcile(args: ReconcileArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    let outcomes = match open_backend(&config.storage).await? {
        Backend::Memory(store) => reconcile_with(store, args.animal).await?,
        Backend::Postgres(store) => reconcile_with(store, args.animal).await?,
    };
    print!("{}", render_reconciliation(&outcomes));
    Ok(())
}

pub(crate) async fn run_export(args: ExportArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    let animal = AnimalId(args.animal);
    let mut sink: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout().lock()),
    };
    let exported = match open_backend(&config.storage).await? {
        Backend::Memory(store) => export_with(store.as_ref(), animal, &mut sink).await?,
        Backend::Postgres(store) => export_with(store.as_ref(), animal, &mut sink).await?,
    };
    sink.flush()?;

    info!(animal_id = %animal, exported, "adoption requests exported");
    Ok(())
}

async fn reconcile_with<B>(
    backend: Arc<B>,
    animal: Option<i64>,
) -> Result<Vec<Reconciliation>, AppError>
where
    B: AdoptionBackend + 'static,
{
    let coordinator = AdoptionCoordinator::new(backend);
    let outcomes = match animal {
        Some(id) => vec![coordinator.reconcile(AnimalId(id)).await?],
        None => coordinator.reconcile_all(Scope::Any).await?,
    };
    Ok(outcomes)
}

/// Writes the animal's requests as CSV and returns how many rows were written.
async fn export_with<B, W>(backend: &B, animal: AnimalId, writer: W) -> Result<usize, AppError>
where
    B: AdoptionBackend,
    W: Write,
{
    if backend.get_animal(animal).await?.is_none() {
        return Err(CoordinatorError::AnimalNotFound(animal).into());
    }
    let requests = backend.list_by_animal(animal).await?;
    write_requests_csv(writer, &requests)?;
    Ok(requests.len())
}

fn render_reconciliation(outcomes: &[Reconciliation]) -> String {
    let repaired = outcomes.iter().filter(|outcome| outcome.repaired()).count();
    let mut lines = vec![format!(
        "Reconciled {} animal(s); {} needed repair",
        outcomes.len(),
        repaired
    )];
    for outcome in outcomes.iter().filter(|outcome| outcome.repaired()) {
        let approved = outcome
            .approved_request
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!(
            "  animal {}: approved request {}, denied {} pending, closed: {}",
            outcome.animal_id,
            approved,
            outcome.denied_pending,
            if outcome.closed_animal { "yes" } else { "no" }
        ));
    }
    lines.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use pet_adoption::adoption::{
        AdoptionLedger, AdoptionStatus, AnimalKind, AnimalStore, ApplicantDetails, MemoryStore,
        NewAdoptionRequest, NewAnimal,
    };

    async fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        for _ in 0..2 {
            store
                .create_animal(NewAnimal::of_kind(AnimalKind::Cat))
                .await
                .expect("animal");
        }
        for name in ["Lia", "Caio"] {
            store
                .create_request(NewAdoptionRequest {
                    animal_id: AnimalId(1),
                    applicant: ApplicantDetails {
                        name: name.to_string(),
                        email: format!("{}@example.org", name.to_lowercase()),
                        ..ApplicantDetails::default()
                    },
                })
                .await
                .expect("request");
        }
        store
    }

    #[tokio::test]
    async fn reconcile_sweep_closes_approved_animals() {
        let store = seeded().await;
        let first = store.list_by_animal(AnimalId(1)).await.expect("list")[1].id;
        store
            .set_status(first, AdoptionStatus::Approved)
            .await
            .expect("force approval");

        let outcomes = reconcile_with(store.clone(), None).await.expect("sweep");
        assert_eq!(outcomes.len(), 2);

        let rendered = render_reconciliation(&outcomes);
        assert!(rendered.starts_with("Reconciled 2 animal(s); 1 needed repair"));
        assert!(rendered.contains("animal 1: approved request 1, denied 1 pending, closed: yes"));
    }

    #[tokio::test]
    async fn reconcile_unknown_animal_fails() {
        let store = seeded().await;
        let err = reconcile_with(store, Some(9)).await.expect_err("missing");
        assert!(matches!(
            err,
            AppError::Workflow(CoordinatorError::AnimalNotFound(AnimalId(9)))
        ));
    }

    #[tokio::test]
    async fn export_writes_one_row_per_request() {
        let store = seeded().await;
        let mut buffer = Vec::new();
        let exported = export_with(store.as_ref(), AnimalId(1), &mut buffer)
            .await
            .expect("export");
        assert_eq!(exported, 2);

        let text = String::from_utf8(buffer).expect("utf8");
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("Caio"));

        let missing = export_with(store.as_ref(), AnimalId(5), Vec::new()).await;
        assert!(missing.is_err());
    }
}
