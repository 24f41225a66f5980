use clap::{Parser, Subcommand};
use deployment::Deployment;
use server::{DeploymentImpl, routes};
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Parser)]
#[command(name = "workhorse", about = "Local orchestrator for coding-agent workspaces")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default)
    Serve {
        #[arg(long, env = "HOST", default_value = "127.0.0.1")]
        host: String,
        /// 0 picks a free port
        #[arg(long, env = "PORT", default_value_t = 0)]
        port: u16,
    },
    /// Run pending schema migrations and exit
    Migrate,
}

fn init_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},db={level},executors={level},deployment={level},local_deployment={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("Failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    let cli = Cli::parse();

    let data_dir = utils::assets::data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!("Data directory {} is unreachable: {e}", data_dir.display());
        return std::process::ExitCode::from(1);
    }

    match cli.command.unwrap_or(Command::Serve {
        host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: std::env::var("PORT")
            .ok()
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(0),
    }) {
        Command::Migrate => match db::DBService::migrate_only(&utils::assets::db_path()).await {
            Ok(()) => std::process::ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("Migration failed: {e}");
                std::process::ExitCode::from(1)
            }
        },
        Command::Serve { host, port } => match serve(host, port).await {
            Ok(()) => std::process::ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("Fatal startup error: {e}");
                std::process::ExitCode::from(1)
            }
        },
    }
}

async fn serve(host: String, port: u16) -> anyhow::Result<()> {
    let deployment = DeploymentImpl::new().await?;

    // Reconcile persisted state before accepting any external request.
    deployment.recover().await?;

    let app_router = routes::router(deployment.clone());

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    let actual_port = listener.local_addr()?.port();
    tracing::info!("Server running on http://{host}:{actual_port}");

    let server = axum::serve(listener, app_router);

    tokio::select! {
        result = server => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down, stopping running executions...");
            deployment.shutdown().await;
        }
    }

    Ok(())
}
