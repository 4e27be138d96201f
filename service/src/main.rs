use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use common::ProjectStore;
use service::ServiceManager;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Sirve uno de los servicios declarados en un proyecto fetl.
#[derive(Debug, Parser)]
#[command(name = "fetl-service", version)]
struct Args {
    /// Archivo de proyecto (.fetl)
    #[arg(long, env = "FETL_PROJECT")]
    project: PathBuf,

    /// id o nombre del servicio
    service: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("service=info,runner=info,common=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let store = match ProjectStore::open(&args.project) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("no se pudo abrir el proyecto {}: {e}", args.project.display());
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c: deteniendo servicio");
        }
        on_signal.cancel();
    });

    let manager = ServiceManager::new(store);
    let served = manager.serve(&args.service, shutdown).await;
    manager.stop_all();
    if let Err(e) = served {
        error!("{e}");
        std::process::exit(1);
    }
}
