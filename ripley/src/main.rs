//! `ripley`: replays a captured stream of timestamped HTTP requests from
//! standard input, pacing dispatch against a phase program and writing one
//! NDJSON result line per request to standard output.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::stream::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;

use ripley_core::{
    ClientPoolConfig, DispatcherConfig, Metrics, PhaseProgram, ResultHandlerConfig,
};

/// Replays timestamped HTTP traffic from standard input.
#[derive(Parser, Debug)]
#[command(name = "ripley", version, about)]
struct Cli {
    /// Phase program, e.g. "10s@1 30s@1.5 1h@2".
    #[arg(long, default_value = "10s@1")]
    pace: String,

    /// Worker pool size.
    #[arg(short = 'w', long, default_value_t = 10)]
    workers: usize,

    /// Per-request overall timeout, seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// TCP connect timeout, seconds.
    #[arg(long, default_value_t = 10)]
    connection_timeout: u64,

    /// Maximum idle connections per host (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_idle_connections_per_host: usize,

    /// Maximum connections per host (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_connections_per_host: usize,

    /// Skip network I/O, producing synthetic successful results.
    #[arg(long)]
    dry_run: bool,

    /// Suppress stdout emission of results.
    #[arg(long)]
    silent: bool,

    /// Suppress stderr mirroring of 5xx/negative statuses.
    #[arg(long)]
    silent_http_error: bool,

    /// Abort on the first malformed input line.
    #[arg(long)]
    strict: bool,

    /// Pacer stats reporting cadence, seconds (0 disables).
    #[arg(long, default_value_t = 0)]
    report_interval: u64,

    /// Expose a `/metrics` endpoint in Prometheus text format.
    #[arg(long)]
    metrics_enable: bool,

    /// Address to serve `/metrics` on.
    #[arg(long, default_value = "127.0.0.1:9090")]
    metrics_address: SocketAddr,

    /// Print the N slowest results to stderr as a table on exit.
    #[arg(long, default_value_t = 0)]
    print_slowest: usize,

    /// Log output format.
    #[arg(long, default_value = "text")]
    log_format: ripley_core::LogFormat,

    /// Increase log verbosity (repeatable).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    ripley_core::trace::install(cli.log_format);

    let pace = match PhaseProgram::parse(&cli.pace) {
        Ok(pace) => pace,
        Err(e) => {
            tracing::error!(error = %e, "bad pace program at start-up");
            std::process::exit(2);
        }
    };

    tracing::info!(?cli, "starting replay");

    let metrics = if cli.metrics_enable {
        Metrics::prometheus().context("failed to set up metrics registry")?
    } else {
        Metrics::noop()
    };

    if cli.metrics_enable {
        let metrics = metrics.clone();
        let address = cli.metrics_address;
        tokio::spawn(async move {
            ripley_core::serve_metrics(address, metrics).await;
        });
    }

    spawn_signal_handler();

    let config = DispatcherConfig {
        workers: cli.workers.max(1),
        strict: cli.strict,
        dry_run: cli.dry_run,
        pace,
        report_interval: if cli.report_interval == 0 {
            None
        } else {
            Some(Duration::from_secs(cli.report_interval))
        },
        client_pool: ClientPoolConfig {
            request_timeout: Duration::from_secs(cli.timeout),
            connect_timeout: Duration::from_secs(cli.connection_timeout),
            max_idle_connections_per_host: cli.max_idle_connections_per_host,
            max_connections_per_host: cli.max_connections_per_host,
        },
        result_handler: ResultHandlerConfig {
            silent: cli.silent,
            silent_http_error: cli.silent_http_error,
            print_slowest: cli.print_slowest,
        },
    };

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let stderr = tokio::io::stderr();

    let outcome = ripley_core::run_dispatcher(stdin, config, metrics, stdout, stderr).await;

    match outcome {
        Ok(outcome) => {
            print_slowest_table(&outcome.slowest);
            std::process::exit(outcome.exit_code);
        }
        Err(e) => {
            tracing::error!(error = %e, "replay aborted");
            std::process::exit(2);
        }
    }
}

fn print_slowest_table(slowest: &[ripley_core::ResultRecord]) {
    if slowest.is_empty() {
        return;
    }
    eprintln!("{:>12}  {:>6}  {}", "LATENCY(ns)", "STATUS", "URL");
    for result in slowest {
        eprintln!(
            "{:>12}  {:>6}  {}",
            result.latency_nanos, result.status_code, result.request.url
        );
    }
}

/// Listens for SIGINT/SIGTERM and exits with the conventional `128+signal`
/// code. This tool has no persistent state to flush beyond what the
/// dispatcher already writes incrementally, so there is nothing further to
/// drain on the way out.
fn spawn_signal_handler() {
    let signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install signal handler");
            return;
        }
    };

    tokio::spawn(async move {
        let mut signals = signals;
        if let Some(signal) = signals.next().await {
            tracing::warn!(signal, "received shutdown signal, exiting");
            std::process::exit(128 + signal);
        }
    });
}
