use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kcopy_core::CopyError;
use kcopy_engine::{config, Copier, CopierConfig, RunReport, RunStatus};
use kcopy_kubehub::KubeSurface;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kcopy", version, about = "Copy Kubernetes resources between clusters through an object directory")]
struct Cli {
    /// Output format
    #[arg(long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(clap::Args, Debug)]
struct Common {
    /// Kubeconfig path (default: $KUBECONFIG or in-cluster)
    #[arg(short = 'k', long = "kubeconfig")]
    kubeconfig: Option<PathBuf>,
    /// Object directory
    #[arg(short = 'd', long = "obj-dir")]
    obj_dir: PathBuf,
    /// Concurrent copy tasks
    #[arg(short = 'p', long = "pool-size", default_value_t = config::DEFAULT_POOL_SIZE)]
    pool_size: usize,
    /// Per API call timeout
    #[arg(long = "call-timeout-secs", env = "KCOPY_CALL_TIMEOUT_SECS")]
    call_timeout_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download resources from a cluster into the object directory
    Download {
        #[command(flatten)]
        common: Common,
        /// Resources as [group/][version/]resource, e.g. "pods" or "scheduling.k8s.io/v1/priorityclasses"
        #[arg(required = true)]
        resources: Vec<String>,
    },
    /// Upload the object directory into a cluster
    Upload {
        #[command(flatten)]
        common: Common,
        /// kube-scheduler configuration used to decide which pods must get bound
        #[arg(short = 's', long = "scheduler-config", default_value = config::DEFAULT_SCHEDULER_CONFIG)]
        scheduler_config: PathBuf,
        /// Upload kinds in dependency order and wait for readiness between waves
        #[arg(short = 'o', long = "order-kinds", action = ArgAction::Set, default_value_t = true)]
        order_kinds: bool,
        /// Max wait for a wave to become ready
        #[arg(long = "ready-timeout-secs", env = "KCOPY_READY_TIMEOUT_SECS", default_value_t = config::DEFAULT_READINESS_TIMEOUT.as_secs())]
        ready_timeout_secs: u64,
    },
}

const EXIT_CONFIG: u8 = 3;
const EXIT_CONNECT: u8 = 4;
const EXIT_PARTIAL: u8 = 5;
const EXIT_CANCELLED: u8 = 6;

fn init_tracing() {
    let env = std::env::var("KCOPY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries the report
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KCOPY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KCOPY_METRICS_ADDR; expected host:port");
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight tasks");
            c.cancel();
        }
    });
    cancel
}

fn base_config(common: &Common, cancel: CancellationToken) -> CopierConfig {
    CopierConfig::new(&common.obj_dir)
        .with_pool_size(common.pool_size)
        .with_call_timeout(common.call_timeout_secs.map(Duration::from_secs))
        .with_cancel(cancel)
}

fn print_report(report: &RunReport, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Output::Human => {
            println!("{}: {} ({} succeeded, {} failed)", report.direction, report.status, report.succeeded(), report.failed());
            if !report.waves.is_empty() {
                for (i, w) in report.waves.iter().enumerate() {
                    let rank = w.rank.map(|r| r.to_string()).unwrap_or_else(|| "-".into());
                    println!("wave {i} (rank {rank}): {}", w.kinds.join(", "));
                }
            }
            println!("{:<32} {:<48} {:>8} {:>8}", "KIND", "RESOURCE", "OK", "FAILED");
            for k in &report.kinds {
                let coord = k.coordinate.as_ref().map(|c| c.to_string()).unwrap_or_else(|| "-".into());
                println!("{:<32} {:<48} {:>8} {:>8}", k.kind, coord, k.succeeded, k.failed);
                for e in &k.first_errors {
                    println!("    ! {e}");
                }
            }
            for w in &report.warnings {
                println!("warning: {w}");
            }
        }
    }
    Ok(())
}

fn exit_for(report: &RunReport) -> ExitCode {
    match report.status {
        RunStatus::Success => ExitCode::SUCCESS,
        RunStatus::PartialFailure => ExitCode::from(EXIT_PARTIAL),
        RunStatus::Cancelled => ExitCode::from(EXIT_CANCELLED),
    }
}

fn exit_for_error(e: &CopyError) -> ExitCode {
    if e.is_fatal() { ExitCode::from(EXIT_CONFIG) } else { ExitCode::FAILURE }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cancel = cancel_on_ctrl_c();
    let (common, outcome) = match cli.command {
        Commands::Download { common, resources } => {
            info!(obj_dir = %common.obj_dir.display(), resources = ?resources, pool = common.pool_size, "download invoked");
            let source = match KubeSurface::connect(common.kubeconfig.as_deref()).await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = ?e, "cannot connect to source cluster");
                    eprintln!("connection error: {e:#}");
                    return Ok(ExitCode::from(EXIT_CONNECT));
                }
            };
            let cfg = base_config(&common, cancel).with_source(Arc::new(source));
            let outcome = match Copier::new(cfg) {
                Ok(copier) => copier.download(&resources).await,
                Err(e) => Err(e),
            };
            (common, outcome)
        }
        Commands::Upload { common, scheduler_config, order_kinds, ready_timeout_secs } => {
            info!(obj_dir = %common.obj_dir.display(), order_kinds, pool = common.pool_size, "upload invoked");
            // directory problems must surface before any cluster access
            if let Err(e) = kcopy_store::ObjectStore::open_existing(&common.obj_dir) {
                eprintln!("{e}");
                return Ok(exit_for_error(&e));
            }
            let target = match KubeSurface::connect(common.kubeconfig.as_deref()).await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = ?e, "cannot connect to target cluster");
                    eprintln!("connection error: {e:#}");
                    return Ok(ExitCode::from(EXIT_CONNECT));
                }
            };
            let cfg = base_config(&common, cancel)
                .with_target(Arc::new(target))
                .with_order_kinds(order_kinds)
                .with_scheduler_config(Some(scheduler_config))
                .with_readiness(Duration::from_secs(ready_timeout_secs), config::DEFAULT_READINESS_POLL);
            let outcome = match Copier::new(cfg) {
                Ok(copier) => copier.upload().await,
                Err(e) => Err(e),
            };
            (common, outcome)
        }
    };
    match outcome {
        Ok(report) => {
            print_report(&report, cli.output)?;
            Ok(exit_for(&report))
        }
        Err(e) => {
            error!(error = %e, obj_dir = %common.obj_dir.display(), "run aborted");
            eprintln!("{e}");
            Ok(exit_for_error(&e))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn upload_defaults() {
        let cli = Cli::try_parse_from(["kcopy", "upload", "-d", "/tmp/objs"]).unwrap();
        match cli.command {
            Commands::Upload { common, scheduler_config, order_kinds, .. } => {
                assert_eq!(common.pool_size, 160);
                assert!(order_kinds);
                assert_eq!(scheduler_config, PathBuf::from("/tmp/kube-scheduler-config.yaml"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn order_kinds_takes_a_value() {
        let cli = Cli::try_parse_from(["kcopy", "--output", "json", "upload", "-d", "x", "-o", "false", "-p", "4"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert!(matches!(cli.command, Commands::Upload { order_kinds: false, common: Common { pool_size: 4, .. }, .. }));
    }

    #[test]
    fn download_needs_resources() {
        assert!(Cli::try_parse_from(["kcopy", "download", "-d", "x"]).is_err());
        let cli = Cli::try_parse_from(["kcopy", "download", "-d", "x", "-k", "/k", "pods", "apps/v1/deployments"]).unwrap();
        match cli.command {
            Commands::Download { resources, common } => {
                assert_eq!(resources, vec!["pods".to_string(), "apps/v1/deployments".to_string()]);
                assert_eq!(common.kubeconfig, Some(PathBuf::from("/k")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fatal_errors_map_to_config_exit() {
        assert_eq!(exit_for_error(&CopyError::Configuration("x".into())), ExitCode::from(EXIT_CONFIG));
        assert_eq!(exit_for_error(&CopyError::Internal("x".into())), ExitCode::FAILURE);
    }
}
