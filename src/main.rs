//! swfsck — cluster maintenance CLI
//!
//! Five subcommands over a master/volume-server/filer blob store:
//! `volume-fix-replication`, `volume-fsck`, `volume-check-disk`,
//! `ec-decode`, `volume-delete-empty`.

use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use swfsck::adapters::{HttpFilerClient, HttpMasterClient, HttpVolumeServerClient};
use swfsck::diskcheck::{self, DiskCheckConfig};
use swfsck::domain::ports::MasterClient;
use swfsck::ec::orchestrator;
use swfsck::error::{Error, Result};
use swfsck::fsck::{self, FsckConfig};
use swfsck::metrics;
use swfsck::reconciler::{self, ReconcilerConfig};
use swfsck::topology;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "swfsck", author, version, about = "Cluster maintenance engine for a master/volume-server/filer blob store")]
struct Args {
    /// Master server address (host:port).
    #[arg(long, env = "SWFSCK_MASTER")]
    master: String,

    /// Log output format.
    #[arg(long, env = "SWFSCK_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Log level.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    /// Metrics/health server bind address.
    #[arg(long, env = "SWFSCK_METRICS_ADDR", default_value = "0.0.0.0:9092")]
    metrics_addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect and repair under/over/misplaced replicas.
    VolumeFixReplication {
        #[arg(short = 'n', long)]
        dry_run: bool,
        #[arg(long, default_value = "")]
        collection_pattern: String,
        #[arg(long, default_value_t = 0)]
        retry: usize,
        #[arg(long, default_value_t = 0)]
        volumes_per_step: usize,
    },
    /// Cross-check filer chunk references against volume needle indexes.
    VolumeFsck {
        #[arg(short, long)]
        verbose: bool,
        #[arg(long)]
        find_missing_chunks_in_filer: bool,
        #[arg(long, default_value = "/")]
        find_missing_chunks_in_filer_path: String,
        #[arg(long, default_value_t = 0)]
        find_missing_chunks_in_volume_id: u32,
        #[arg(long)]
        really_delete_from_volume: bool,
        #[arg(long)]
        force_purging: bool,
        #[arg(long)]
        really_delete_filer_entries: bool,
        #[arg(long)]
        temp_path: Option<std::path::PathBuf>,
        #[arg(long, default_value = "5m")]
        cutoff_time_ago: String,
    },
    /// Pairwise anti-entropy sync of replica needle indexes.
    VolumeCheckDisk {
        #[arg(long)]
        slow: bool,
        #[arg(short, long)]
        verbose: bool,
        #[arg(long, default_value_t = 0)]
        volume_id: u32,
        #[arg(long)]
        force: bool,
        #[arg(long, default_value_t = 0.3)]
        non_repair_threshold: f64,
    },
    /// Reconstruct an erasure-coded volume onto one server.
    EcDecode {
        #[arg(long, default_value = "")]
        collection: String,
        #[arg(long, default_value_t = 0)]
        volume_id: u32,
        #[arg(long)]
        force: bool,
    },
    /// Delete volumes that have been empty and quiet for a while.
    VolumeDeleteEmpty {
        #[arg(long, default_value = "24h")]
        quiet_for: String,
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(&metrics_addr).await {
            error!(error = %e, "metrics server exited");
        }
    });

    let master = HttpMasterClient::new(&args.master, RPC_TIMEOUT)?;
    let volume_server = HttpVolumeServerClient::new(RPC_TIMEOUT)?;
    let cancel = CancellationToken::new();

    let owner = format!("swfsck-{}", std::process::id());
    let lock_token = master.acquire_lock(&owner).await?;

    let result = dispatch(&args.command, &master, &volume_server, &lock_token, cancel.clone()).await;

    master.release_lock(&lock_token).await?;

    if let Err(e) = &result {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
    Ok(())
}

async fn dispatch(
    command: &Command,
    master: &HttpMasterClient,
    volume_server: &HttpVolumeServerClient,
    lock_token: &str,
    cancel: CancellationToken,
) -> Result<()> {
    match command {
        Command::VolumeFixReplication {
            dry_run,
            collection_pattern,
            retry,
            volumes_per_step,
        } => {
            let config = ReconcilerConfig {
                dry_run: *dry_run,
                collection_pattern: Some(collection_pattern.clone()).filter(|s| !s.is_empty()),
                retry: *retry,
                volumes_per_step: *volumes_per_step,
            };
            let report = reconciler::run(master, volume_server, &config, lock_token, cancel).await?;
            info!(
                copied = report.copied.len(),
                deleted = report.deleted.len(),
                skipped = report.skipped.len(),
                "volume-fix-replication complete"
            );
            Ok(())
        }
        Command::VolumeFsck {
            verbose,
            find_missing_chunks_in_filer,
            find_missing_chunks_in_filer_path,
            find_missing_chunks_in_volume_id,
            really_delete_from_volume,
            force_purging,
            really_delete_filer_entries,
            temp_path,
            cutoff_time_ago,
        } => {
            let filer = resolve_filer(master).await?;
            let config = FsckConfig {
                verbose: *verbose,
                find_missing_chunks_in_filer: *find_missing_chunks_in_filer,
                find_missing_chunks_in_filer_path: find_missing_chunks_in_filer_path.clone(),
                find_missing_chunks_in_volume_id: *find_missing_chunks_in_volume_id,
                really_delete_from_volume: *really_delete_from_volume,
                force_purging: *force_purging,
                really_delete_filer_entries: *really_delete_filer_entries,
                temp_path: temp_path.clone().unwrap_or_else(std::env::temp_dir),
                cutoff_time_ago: parse_duration(cutoff_time_ago)?,
            };

            if config.find_missing_chunks_in_filer {
                let report = fsck::run_mode_b(master, volume_server, &filer, &config, lock_token, cancel).await?;
                info!(
                    missing = report.filer_entries_missing,
                    purged = report.filer_entries_purged,
                    "volume-fsck mode B complete"
                );
            } else {
                let report = fsck::run_mode_a(master, volume_server, &filer, &config, lock_token, cancel).await?;
                info!(
                    orphans = report.volume_orphans_found,
                    purged = report.volume_orphans_purged,
                    "volume-fsck mode A complete"
                );
            }
            Ok(())
        }
        Command::VolumeCheckDisk {
            slow,
            verbose,
            volume_id,
            force,
            non_repair_threshold,
        } => {
            let config = DiskCheckConfig {
                slow: *slow,
                verbose: *verbose,
                volume_id: *volume_id,
                force: *force,
                non_repair_threshold: *non_repair_threshold,
            };
            let report = diskcheck::run(master, volume_server, &config, lock_token, cancel).await?;
            info!(
                checked = report.volumes_checked,
                repaired = report.needles_repaired,
                skipped = report.pairs_skipped,
                "volume-check-disk complete"
            );
            Ok(())
        }
        Command::EcDecode {
            collection,
            volume_id,
            force,
        } => {
            let (topology, _limit_mb) = topology::collect(master, Duration::ZERO).await?;
            let report = orchestrator::decode_volume(
                master,
                &topology,
                volume_server,
                *volume_id,
                collection,
                *force,
                lock_token,
                cancel,
            )
            .await?;
            info!(
                volume_id = report.volume_id,
                target = %report.target_node,
                shards_from = report.shards_copied_from.len(),
                "ec-decode complete"
            );
            Ok(())
        }
        Command::VolumeDeleteEmpty { quiet_for, force } => {
            let quiet = parse_duration(quiet_for)?;
            let deleted = volume_delete_empty(master, volume_server, quiet, *force, lock_token).await?;
            info!(deleted, force, "volume-delete-empty complete");
            Ok(())
        }
    }
}

async fn resolve_filer(master: &HttpMasterClient) -> Result<HttpFilerClient> {
    let nodes = master.list_cluster_nodes("filer", None).await?;
    let addr = nodes
        .first()
        .ok_or_else(|| Error::Fatal("no filer registered with the master".to_string()))?;
    HttpFilerClient::new(addr, RPC_TIMEOUT)
}

/// Deletes every replica of every volume that is empty (`size <= 8`) on
/// every replica and has been quiet (unmodified) for at least `quiet_for`.
/// Without `force`, only reports the candidates.
async fn volume_delete_empty(
    master: &HttpMasterClient,
    volume_server: &HttpVolumeServerClient,
    quiet_for: Duration,
    force: bool,
    lock_token: &str,
) -> Result<usize> {
    master.check_lock(lock_token).await?;
    let (topology, _limit_mb) = topology::collect(master, Duration::ZERO).await?;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    let mut deleted = 0usize;
    for (vid, replicas) in topology.replicas_by_volume() {
        let all_empty_and_quiet = replicas.iter().all(|r| {
            r.volume.is_empty() && r.volume.modified_at_second + quiet_for.as_secs() as i64 < now
        });
        if !all_empty_and_quiet {
            continue;
        }
        info!(volume_id = vid, replicas = replicas.len(), "empty volume candidate");
        if force {
            master.check_lock(lock_token).await?;
            for replica in &replicas {
                volume_server.volume_delete(&replica.location.data_node, vid).await?;
            }
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Parses a Go-style duration string (`"5m"`, `"24h"`, `"30s"`).
fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (num, unit) = s.split_at(s.len().saturating_sub(1));
    let value: u64 = num
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration {s:?}")))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => return Err(Error::Config(format!("invalid duration unit in {s:?}"))),
    };
    Ok(Duration::from_secs(seconds))
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap());

    match args.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true))
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_go_style_durations() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration("5x").is_err());
    }
}
