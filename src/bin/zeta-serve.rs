//! SSH side of the zeta platform core. The SSH daemon authenticates the
//! connection and execs this command with the resolved username in
//! `ZETA_SSH_USER`; stdin carries request payloads, stdout the reply.

use std::io::{Read, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use zeta_server::config::ServerConfig;
use zeta_server::protocol::core::ZetaService;
use zeta_server::protocol::ssh::{serve, ZetaServe, ENV_SSH_USER};

#[derive(Debug, Parser)]
#[command(name = "zeta-serve")]
struct Cli {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(long, env = "ZETA_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    serve: ZetaServe,
}

// `StdoutLock` does not implement `Send` on this toolchain. `serve()` is
// only ever awaited in place here (never spawned across threads), so
// asserting `Send` on this wrapper is sound.
struct SendStdoutLock<'a>(std::io::StdoutLock<'a>);
unsafe impl Send for SendStdoutLock<'_> {}
impl Write for SendStdoutLock<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage errors are user errors: exit 1 per the contract.
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let config = match &cli.config {
        Some(path) => match ServerConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "failed to load configuration");
                std::process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };

    let service = match ZetaService::new(config).await {
        Ok(service) => service,
        Err(e) => {
            tracing::error!(error = %e, "failed to start service");
            std::process::exit(500);
        }
    };

    // Commands that consume a payload read it all before dispatch.
    let mut input = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut input) {
        tracing::error!(error = %e, "failed to read stdin");
        std::process::exit(400);
    }

    let username = std::env::var(ENV_SSH_USER).ok();
    let mut stdout = SendStdoutLock(std::io::stdout().lock());
    let code = serve(
        &service,
        cli.serve.command,
        username.as_deref(),
        input,
        &mut stdout,
    )
    .await;
    std::process::exit(code);
}
