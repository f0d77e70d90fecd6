use crate::maintenance::{run_export, run_reconcile, ExportArgs, ReconcileArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use pet_adoption::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "pet-adoption-api",
    about = "Serve and maintain the pet adoption marketplace backend",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Finish approvals that stopped partway: deny stray pending requests and close animals
    Reconcile(ReconcileArgs),
    /// Work with stored adoption requests
    Requests {
        #[command(subcommand)]
        command: RequestsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RequestsCommand {
    /// Write an animal's adoption requests as CSV
    Export(ExportArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Reconcile(args) => run_reconcile(args).await,
        Command::Requests {
            command: RequestsCommand::Export(args),
        } => run_export(args).await,
    }
}
