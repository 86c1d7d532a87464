//! The dispatcher: the top-level driver for replay mode. Owns the single
//! input reader, drives the pacer, feeds the worker pool, and enforces the
//! shutdown ordering invariant in SPEC_FULL.md §4.5.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};

use crate::client_pool::{ClientPool, ClientPoolConfig};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::pace::{Pacer, PhaseProgram};
use crate::record::{self, ResultRecord};
use crate::result_handler::{run_result_handler, Outstanding, ResultHandlerConfig};
use crate::worker::{spawn_workers, WorkerContext};

pub struct DispatcherConfig {
    pub workers: usize,
    pub strict: bool,
    pub dry_run: bool,
    pub pace: PhaseProgram,
    pub report_interval: Option<Duration>,
    pub client_pool: ClientPoolConfig,
    pub result_handler: ResultHandlerConfig,
}

pub struct DispatcherOutcome {
    /// `0` success, `126` at least one malformed line (non-strict).
    pub exit_code: i32,
    pub slowest: Vec<ResultRecord>,
}

/// Runs the replay dispatcher to completion: reads `lines` until EOF or
/// the pacer finishes, then drains in-flight work in the order required by
/// §4.5 before returning.
pub async fn run_dispatcher<R, WOut, WErr>(
    reader: R,
    config: DispatcherConfig,
    metrics: Arc<Metrics>,
    stdout: WOut,
    stderr: WErr,
) -> Result<DispatcherOutcome, Error>
where
    R: AsyncBufRead + Unpin,
    WOut: AsyncWriteExt + Unpin,
    WErr: AsyncWriteExt + Unpin,
{
    let pacer = Arc::new(Pacer::new(config.pace, config.report_interval, Arc::clone(&metrics)));
    Pacer::start(&pacer);

    let client_pool = Arc::new(ClientPool::new(config.client_pool, Arc::clone(&metrics)));
    let worker_context = Arc::new(WorkerContext {
        client_pool,
        metrics: Arc::clone(&metrics),
        dry_run: config.dry_run,
    });

    let (request_tx, request_rx) = async_channel::bounded(config.workers.max(1));
    let (result_tx, result_rx) = async_channel::bounded(config.workers.max(1));

    metrics.set_worker_pool_size(config.workers as i64);

    let worker_handles = spawn_workers(
        config.workers,
        request_rx,
        result_tx.clone(),
        worker_context,
    );

    let outstanding = Outstanding::new();
    let handler_outstanding = Arc::clone(&outstanding);
    let handler_metrics = Arc::clone(&metrics);
    let handler_config = config.result_handler;
    let strict = config.strict;

    // Driven concurrently with the result handler below via `tokio::join!`
    // rather than `tokio::spawn`, so this function stays generic over
    // borrowed writers instead of requiring `'static`.
    let input_fut = async move {
        let mut lines = reader.lines();
        let mut had_bad_input = false;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => return Err(Error::Io(e)),
            };
            if line.trim().is_empty() {
                continue;
            }

            match record::decode(&line) {
                Ok(request) => {
                    if pacer.is_done() {
                        break;
                    }

                    outstanding.register();
                    let delay_nanos = pacer.wait_duration_nanos(request.timestamp);
                    if delay_nanos > 0 {
                        tokio::time::sleep(Duration::from_nanos(delay_nanos as u64)).await;
                    }

                    metrics.set_request_queue_size(request_tx.len() as i64);
                    if request_tx.send(request).await.is_err() {
                        // Workers have all exited (e.g. panicked); nothing
                        // more to dispatch.
                        break;
                    }
                }
                Err(decode_err) => {
                    if strict {
                        return Err(decode_err);
                    }
                    had_bad_input = true;
                    tracing::warn!(error = %decode_err, line = %line, "bad input line");
                    let synthetic = record::decode_error_result(&line, &decode_err);
                    outstanding.register();
                    if result_tx.send(synthetic).await.is_err() {
                        break;
                    }
                }
            }
        }

        drop(request_tx);
        outstanding.wait_for_drain().await;
        for handle in worker_handles {
            let _ = handle.await;
        }
        drop(result_tx);

        Ok(had_bad_input)
    };

    let handler_fut = run_result_handler(
        result_rx,
        handler_metrics,
        handler_outstanding,
        handler_config,
        stdout,
        stderr,
    );

    let (input_result, slowest) = tokio::join!(input_fut, handler_fut);

    Ok(DispatcherOutcome {
        exit_code: if input_result? { 126 } else { 0 },
        slowest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Method;
    use std::io::Cursor;

    fn line(method: &str, url: &str, ts: &str) -> String {
        format!(r#"{{"method":"{method}","url":"{url}","timestamp":"{ts}"}}"#)
    }

    // Conservation check, using dry_run to avoid a network dependency:
    // N well-formed lines produce exactly N results.
    #[tokio::test]
    async fn conservation_all_well_formed_dry_run() {
        let input = [
            line("GET", "http://h/a", "2021-01-01T00:00:00Z"),
            line("GET", "http://h/b", "2021-01-01T00:00:00.1Z"),
            line("GET", "http://h/c", "2021-01-01T00:00:00.2Z"),
        ]
        .join("\n");

        let config = DispatcherConfig {
            workers: 4,
            strict: false,
            dry_run: true,
            pace: PhaseProgram::parse("1h@1000").unwrap(),
            report_interval: None,
            client_pool: ClientPoolConfig::default(),
            result_handler: ResultHandlerConfig {
                silent: false,
                silent_http_error: true,
                print_slowest: 0,
            },
        };

        let mut stdout = Vec::new();
        let outcome = run_dispatcher(
            Cursor::new(input),
            config,
            Metrics::noop(),
            &mut stdout,
            tokio::io::stderr(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.exit_code, 0);
        let lines: Vec<_> = String::from_utf8(stdout).unwrap().lines().map(String::from).collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            let result: ResultRecord = serde_json::from_str(line).unwrap();
            assert_eq!(result.status_code, 0);
            assert_eq!(result.request.method, Method::Get);
        }
    }

    #[tokio::test]
    async fn non_strict_bad_input_yields_126_and_extra_record() {
        let input = [
            line("GET", "http://h/a", "2021-01-01T00:00:00Z"),
            r#"{"method":"NOPE"}"#.to_string(),
        ]
        .join("\n");

        let config = DispatcherConfig {
            workers: 2,
            strict: false,
            dry_run: true,
            pace: PhaseProgram::parse("1h@1000").unwrap(),
            report_interval: None,
            client_pool: ClientPoolConfig::default(),
            result_handler: ResultHandlerConfig {
                silent: false,
                silent_http_error: true,
                print_slowest: 0,
            },
        };

        let mut stdout = Vec::new();
        let outcome = run_dispatcher(
            Cursor::new(input),
            config,
            Metrics::noop(),
            &mut stdout,
            tokio::io::stderr(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.exit_code, 126);
        let lines: Vec<_> = String::from_utf8(stdout).unwrap().lines().map(String::from).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().any(|l| l.contains("\"StatusCode\":-2")));
    }

    #[tokio::test]
    async fn strict_bad_input_aborts() {
        let input = r#"{"method":"NOPE"}"#.to_string();

        let config = DispatcherConfig {
            workers: 2,
            strict: true,
            dry_run: true,
            pace: PhaseProgram::parse("1h@1000").unwrap(),
            report_interval: None,
            client_pool: ClientPoolConfig::default(),
            result_handler: ResultHandlerConfig {
                silent: false,
                silent_http_error: true,
                print_slowest: 0,
            },
        };

        let mut stdout = Vec::new();
        let result = run_dispatcher(
            Cursor::new(input),
            config,
            Metrics::noop(),
            &mut stdout,
            tokio::io::stderr(),
        )
        .await;

        assert!(matches!(result, Err(Error::BadInput(_))));
    }
}
