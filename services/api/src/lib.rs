mod cli;
mod infra;
mod maintenance;
mod routes;
mod server;

use pet_adoption::error::AppError;

pub async fn run() -> Result<(), AppError> {
    cli::run().await
}
