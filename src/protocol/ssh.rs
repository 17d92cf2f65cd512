//! SSH transport: the `zeta-serve <sub> <repo-path> [--flags]` command.
//!
//! The SSH daemon authenticates the connection (key lookup is its
//! business) and invokes `zeta-serve` with the resolved username in the
//! environment. Each subcommand maps 1:1 onto an HTTP endpoint and the
//! command exits with the transport code of the error class
//! (0/1/400/403/404/409/500).

use std::io::Write;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::ZetaError;
use crate::hash::ObjectHash;
use crate::protocol::auth::AuthContext;
use crate::protocol::core::ZetaService;
use crate::protocol::fetch;
use crate::protocol::push::{handle_push, PushRequest};
use crate::protocol::types::{FetchParams, Operation, PushStats};

/// Environment variable carrying the authenticated SSH username.
pub const ENV_SSH_USER: &str = "ZETA_SSH_USER";
/// Environment variable carrying the client's packed object stats.
pub const ENV_OBJECTS_STATS: &str = "ZETA_OBJECTS_STATS";

#[derive(Debug, Parser)]
#[command(name = "zeta-serve", about = "Serve one repository operation over SSH")]
pub struct ZetaServe {
    #[command(subcommand)]
    pub command: ServeCommand,
}

#[derive(Debug, Subcommand)]
pub enum ServeCommand {
    /// Resolve a reference.
    LsRemote {
        /// Repository path, `<namespace>/<repo>`.
        repo: String,
        #[arg(long)]
        reference: String,
    },
    /// Stream a commit/tree metadata pack.
    Metadata {
        repo: String,
        #[arg(long)]
        revision: String,
        /// Subtree depth bound, -1 unbounded.
        #[arg(long, default_value_t = -1)]
        depth: i64,
        /// Commit count bound along each path, -1 unbounded.
        #[arg(long, default_value_t = -1)]
        deepen: i64,
        #[arg(long)]
        deepen_from: Option<String>,
        #[arg(long)]
        have: Vec<String>,
        /// Read a newline-delimited path list from stdin.
        #[arg(long)]
        sparse: bool,
        /// Read a newline-delimited id list from stdin instead of walking.
        #[arg(long)]
        batch: bool,
        /// Compress the stream with zstd.
        #[arg(long)]
        zstd: bool,
    },
    /// Download blobs.
    Objects {
        repo: String,
        #[arg(long)]
        oid: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Read an id list from stdin and stream small blobs.
        #[arg(long)]
        batch: bool,
        /// Read an id list from stdin and print presigned URLs as JSON.
        #[arg(long)]
        share: bool,
    },
    /// Receive objects and update a reference.
    Push {
        repo: String,
        #[arg(long)]
        reference: String,
        /// Upload a single object of `--size` bytes from stdin.
        #[arg(long)]
        oid: Option<String>,
        #[arg(long)]
        size: Option<u64>,
        /// Read an id list from stdin and report per-id actions.
        #[arg(long)]
        batch_check: bool,
        #[arg(long)]
        old_rev: Option<String>,
        #[arg(long)]
        new_rev: Option<String>,
    },
}

impl ServeCommand {
    fn repo_path(&self) -> &str {
        match self {
            ServeCommand::LsRemote { repo, .. }
            | ServeCommand::Metadata { repo, .. }
            | ServeCommand::Objects { repo, .. }
            | ServeCommand::Push { repo, .. } => repo,
        }
    }

    fn operation(&self) -> Operation {
        match self {
            ServeCommand::Push { .. } => Operation::Upload,
            _ => Operation::Download,
        }
    }
}

/// Execute one command: stdin is already read into `input`, output goes
/// to `out`. Returns the process exit code.
pub async fn serve(
    service: &ZetaService,
    command: ServeCommand,
    username: Option<&str>,
    input: Vec<u8>,
    out: &mut (dyn Write + Send),
) -> i32 {
    match run(service, command, username, input, out).await {
        Ok(()) => 0,
        Err(e) => {
            // The message the peer may see; internals stay in the log.
            tracing::warn!(error = %e, "zeta-serve failed");
            let _ = writeln!(out, "error: {}", e.public_message());
            e.exit_code()
        }
    }
}

async fn run(
    service: &ZetaService,
    command: ServeCommand,
    username: Option<&str>,
    input: Vec<u8>,
    out: &mut (dyn Write + Send),
) -> Result<(), ZetaError> {
    let (ns, repo_path) = command
        .repo_path()
        .trim_matches('/')
        .split_once('/')
        .ok_or_else(|| ZetaError::malformed("repository path must be <namespace>/<repo>"))?;
    let (repo, odb) = service.open_repo(ns, repo_path).await?;

    let ctx = match username {
        Some(name) => AuthContext {
            user: Some(service.meta.user_by_name(name).await?),
            granted: None,
        },
        None => AuthContext::anonymous(),
    };
    service.auth.authorize(&ctx, &repo, command.operation()).await?;

    match command {
        ServeCommand::LsRemote { reference, .. } => {
            let result = fetch::ls_reference(service, &odb, &reference).await?;
            serde_json::to_writer(&mut *out, &result)
                .map_err(|e| ZetaError::Fatal(format!("encode reply: {e}")))?;
            writeln!(out)?;
            Ok(())
        }

        ServeCommand::Metadata {
            revision,
            depth,
            deepen,
            deepen_from,
            have,
            sparse,
            batch,
            zstd,
            ..
        } => {
            let rx = if batch {
                let ids = fetch::parse_id_lines(&String::from_utf8_lossy(&input))?;
                fetch::batch_metadata_stream(odb, &service.config.transfer, ids, zstd).await?
            } else {
                let head = service.resolve_rev(&odb, &revision).await?;
                let params = FetchParams {
                    deepen,
                    deepen_from,
                    have: (!have.is_empty()).then(|| have.join(",")),
                    depth,
                };
                let paths = if sparse {
                    String::from_utf8_lossy(&input)
                        .lines()
                        .map(|l| l.trim().to_string())
                        .filter(|l| !l.is_empty())
                        .collect()
                } else {
                    Vec::new()
                };
                fetch::metadata_stream(
                    odb,
                    &service.config.transfer,
                    head,
                    &params,
                    paths,
                    zstd,
                )
                .await?
            };
            drain_to(rx, out).await
        }

        ServeCommand::Objects {
            oid,
            offset,
            batch,
            share,
            ..
        } => {
            if share {
                let ids = fetch::parse_id_lines(&String::from_utf8_lossy(&input))?;
                let entries =
                    fetch::share_objects(&odb, service.config.remote.share_ttl_secs, &ids)
                        .await?;
                serde_json::to_writer(&mut *out, &entries)
                    .map_err(|e| ZetaError::Fatal(format!("encode reply: {e}")))?;
                writeln!(out)?;
                return Ok(());
            }
            if batch {
                let ids = fetch::parse_id_lines(&String::from_utf8_lossy(&input))?;
                let rx =
                    fetch::batch_objects_stream(odb, &service.config.transfer, ids).await?;
                return drain_to(rx, out).await;
            }
            let oid = oid
                .ok_or_else(|| ZetaError::malformed("objects needs --oid, --batch or --share"))?;
            let oid = ObjectHash::from_str(&oid).map_err(ZetaError::Malformed)?;
            let rx = fetch::single_object_stream(odb, oid, offset).await?;
            drain_to(rx, out).await
        }

        ServeCommand::Push {
            reference,
            oid,
            size,
            batch_check,
            old_rev,
            new_rev,
            ..
        } => {
            if batch_check {
                let ids = fetch::parse_id_lines(&String::from_utf8_lossy(&input))?;
                let entries = fetch::batch_check(&odb, &ids).await?;
                serde_json::to_writer(&mut *out, &entries)
                    .map_err(|e| ZetaError::Fatal(format!("encode reply: {e}")))?;
                writeln!(out)?;
                return Ok(());
            }
            if let (Some(oid), Some(size)) = (oid, size) {
                let oid = ObjectHash::from_str(&oid).map_err(ZetaError::Malformed)?;
                if input.len() as u64 != size {
                    return Err(ZetaError::malformed(format!(
                        "declared {size} bytes, received {}",
                        input.len()
                    )));
                }
                let cancel = CancellationToken::new();
                let stored = odb.hash_to(&mut &input[..], size, &cancel).await?;
                if stored != oid {
                    return Err(ZetaError::integrity(format!(
                        "uploaded object hashes to {stored}, expected {oid}"
                    )));
                }
                writeln!(out, "ok")?;
                return Ok(());
            }

            let old_rev =
                old_rev.ok_or_else(|| ZetaError::malformed("push needs --old-rev"))?;
            let new_rev =
                new_rev.ok_or_else(|| ZetaError::malformed("push needs --new-rev"))?;
            let stats = std::env::var(ENV_OBJECTS_STATS)
                .ok()
                .and_then(|raw| PushStats::from_str(&raw).ok());
            let request = PushRequest {
                refname: reference,
                old: ObjectHash::from_str(&old_rev).map_err(ZetaError::Malformed)?,
                new: ObjectHash::from_str(&new_rev).map_err(ZetaError::Malformed)?,
                stats,
            };

            let (tx, mut rx) = mpsc::channel::<String>(64);
            let push_task = tokio::spawn(async move {
                let cancel = CancellationToken::new();
                handle_push(&odb, &request, &input, &tx, &cancel).await
            });
            // Report lines stream to the peer as they are produced.
            while let Some(line) = rx.recv().await {
                out.write_all(line.as_bytes())?;
                out.flush()?;
            }
            push_task
                .await
                .map_err(|e| ZetaError::Fatal(format!("push task panicked: {e}")))?
        }
    }
}

async fn drain_to(
    mut rx: tokio_stream::wrappers::ReceiverStream<Vec<u8>>,
    out: &mut (dyn Write + Send),
) -> Result<(), ZetaError> {
    use tokio_stream::StreamExt;
    while let Some(chunk) = rx.next().await {
        out.write_all(&chunk)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The clap surface accepts the documented flag spellings:
    /// `--long value`, `--long=value`, and `--` terminating options.
    #[test]
    fn flag_spellings() {
        let parsed = ZetaServe::try_parse_from([
            "zeta-serve",
            "metadata",
            "group/core",
            "--revision=main",
            "--deepen",
            "3",
            "--zstd",
        ])
        .unwrap();
        match parsed.command {
            ServeCommand::Metadata {
                repo,
                revision,
                deepen,
                zstd,
                depth,
                ..
            } => {
                assert_eq!(repo, "group/core");
                assert_eq!(revision, "main");
                assert_eq!(deepen, 3);
                assert_eq!(depth, -1);
                assert!(zstd);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    /// Push sub-modes parse their distinguishing flags.
    #[test]
    fn push_modes() {
        let parsed = ZetaServe::try_parse_from([
            "zeta-serve",
            "push",
            "group/core",
            "--reference",
            "refs/heads/main",
            "--old-rev",
            "0000000000000000000000000000000000000000",
            "--new-rev",
            "943a702d06f34599aee1f8da8ef9f7296031d699",
        ])
        .unwrap();
        match parsed.command {
            ServeCommand::Push {
                reference,
                old_rev,
                new_rev,
                batch_check,
                ..
            } => {
                assert_eq!(reference, "refs/heads/main");
                assert!(old_rev.unwrap().starts_with("0000"));
                assert!(new_rev.is_some());
                assert!(!batch_check);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let parsed =
            ZetaServe::try_parse_from(["zeta-serve", "push", "g/r", "--reference", "r", "--batch-check"])
                .unwrap();
        match parsed.command {
            ServeCommand::Push { batch_check, .. } => assert!(batch_check),
            other => panic!("unexpected command {other:?}"),
        }
    }

    /// Unknown subcommands are a parse error the binary maps to exit 1.
    #[test]
    fn unknown_command_rejected() {
        assert!(ZetaServe::try_parse_from(["zeta-serve", "frobnicate", "g/r"]).is_err());
    }
}
