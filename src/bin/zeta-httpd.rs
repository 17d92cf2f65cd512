//! HTTP front of the zeta platform core.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use zeta_server::config::ServerConfig;
use zeta_server::protocol::core::ZetaService;
use zeta_server::protocol::http::router;

#[derive(Debug, Parser)]
#[command(name = "zeta-httpd", about = "Serve the zeta protocol over HTTP")]
struct Cli {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address override, e.g. 0.0.0.0:8080.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => match ServerConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "failed to load configuration");
                return std::process::ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen.addr = listen;
    }

    let addr = config.listen.addr.clone();
    let service = match ZetaService::new(config).await {
        Ok(service) => service,
        Err(e) => {
            tracing::error!(error = %e, "failed to start service");
            return std::process::ExitCode::FAILURE;
        }
    };

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr, "failed to bind");
            return std::process::ExitCode::FAILURE;
        }
    };
    tracing::info!(addr, "zeta-httpd listening");

    let app = router(service);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    {
        tracing::error!(error = %e, "server exited with error");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}
