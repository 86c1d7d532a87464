//! The worker pool: `W` concurrent consumers of the bounded request queue
//! that perform HTTP and publish results.

use std::sync::Arc;
use std::time::Instant;

use reqwest::header::HOST;

use crate::client_pool::ClientPool;
use crate::metrics::Metrics;
use crate::record::{RequestRecord, ResponseInfo, ResultRecord};

/// Shared, immutable context every worker task holds a clone of.
pub struct WorkerContext {
    pub client_pool: Arc<ClientPool>,
    pub metrics: Arc<Metrics>,
    pub dry_run: bool,
}

/// Spawns `count` worker tasks, each looping on `request_rx` until the
/// channel closes (signalling shutdown), publishing every outcome onto
/// `result_tx`. `request_rx` is an `async_channel::Receiver`, which — unlike
/// `tokio::sync::mpsc::Receiver` — can be cloned so that all `W` workers
/// compete for the same bounded queue (a genuine multi-consumer queue,
/// which `tokio::sync::mpsc` does not provide).
pub fn spawn_workers(
    count: usize,
    request_rx: async_channel::Receiver<RequestRecord>,
    result_tx: async_channel::Sender<ResultRecord>,
    context: Arc<WorkerContext>,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let request_rx = request_rx.clone();
            let result_tx = result_tx.clone();
            let context = Arc::clone(&context);
            tokio::spawn(async move { worker_loop(worker_id, request_rx, result_tx, context).await })
        })
        .collect()
}

async fn worker_loop(
    worker_id: usize,
    request_rx: async_channel::Receiver<RequestRecord>,
    result_tx: async_channel::Sender<ResultRecord>,
    context: Arc<WorkerContext>,
) {
    while let Ok(request) = request_rx.recv().await {
        let result = execute(&request, &context).await;

        context.metrics.inc_requests_total();
        if result.is_transport_error() {
            context.metrics.inc_errors_total(&request.authority);
        } else {
            context
                .metrics
                .observe_latency_seconds(&request.authority, result.latency_nanos as f64 / 1e9);
        }
        context
            .metrics
            .inc_response_status(result.status_code, &request.authority);

        if result_tx.send(result).await.is_err() {
            tracing::debug!(worker_id, "result channel closed, dropping remaining work");
            break;
        }
    }
    tracing::debug!(worker_id, "worker exiting: request queue closed");
}

async fn execute(request: &RequestRecord, context: &WorkerContext) -> ResultRecord {
    let start = Instant::now();

    if context.dry_run {
        return ResultRecord {
            status_code: 0,
            latency_nanos: start.elapsed().as_nanos() as i64,
            request: request.clone(),
            error: String::new(),
            response: None,
        };
    }

    let outcome = perform_request(request, context).await;
    let latency_nanos = start.elapsed().as_nanos() as i64;

    match outcome {
        Ok((status, response)) => ResultRecord {
            status_code: status as i32,
            latency_nanos,
            request: request.clone(),
            error: String::new(),
            response: Some(response),
        },
        Err(message) => {
            // Expected, non-fatal at replay scale: carried in the result
            // record, not worth a `warn!`.
            tracing::debug!(url = %request.url, error = %message, "transport error");
            ResultRecord {
                status_code: -1,
                latency_nanos,
                request: request.clone(),
                error: message,
                response: None,
            }
        }
    }
}

async fn perform_request(
    request: &RequestRecord,
    context: &WorkerContext,
) -> Result<(u16, ResponseInfo), String> {
    let client = context
        .client_pool
        .get(&request.authority)
        .await
        .map_err(|e| e.to_string())?;

    // Held for the rest of this function so the per-host cap bounds true
    // in-flight connections, not just client construction.
    let _permit = context.client_pool.acquire(&request.authority).await;

    let mut builder = client.request(request.method.to_reqwest(), &request.url);
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        builder = builder.header(name, value);
    }
    if let Some(host) = request.host_override() {
        builder = builder.header(HOST, host);
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| e.to_string())?;
    let status = response.status().as_u16();
    let remote_addr = response.remote_addr().map(|a| a.to_string());

    let mut headers = std::collections::HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }

    // Read the body to completion (discarding it) so the underlying
    // connection is freed back to the pool for reuse.
    let mut read_bytes: u64 = 0;
    let mut stream = response;
    loop {
        match stream.chunk().await {
            Ok(Some(chunk)) => read_bytes += chunk.len() as u64,
            Ok(None) => break,
            Err(e) => return Err(format!("error reading response body: {e}")),
        }
    }
    context
        .metrics
        .inc_connections_read_bytes(&request.authority, read_bytes);
    if let Some(body) = &request.body {
        context
            .metrics
            .inc_connections_write_bytes(&request.authority, body.len() as u64);
    }

    Ok((
        status,
        ResponseInfo {
            headers,
            remote_addr,
            local_addr: None,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_pool::{ClientPool, ClientPoolConfig};
    use crate::record::Method;

    fn request_for(url: String) -> RequestRecord {
        RequestRecord {
            method: Method::Get,
            url,
            timestamp: chrono::Utc::now(),
            body: None,
            headers: Default::default(),
            authority: "127.0.0.1".to_string(),
            is_tls: false,
        }
    }

    #[tokio::test]
    async fn dry_run_never_touches_the_network() {
        let context = WorkerContext {
            client_pool: Arc::new(ClientPool::new(ClientPoolConfig::default(), Metrics::noop())),
            metrics: Metrics::noop(),
            dry_run: true,
        };
        let request = request_for("http://127.0.0.1:1/unreachable".to_string());
        let result = execute(&request, &context).await;
        assert_eq!(result.status_code, 0);
        assert!(result.error.is_empty());
    }

    #[tokio::test]
    async fn successful_request_returns_status_and_latency() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", "/ok").with_status(200).create_async().await;

        let mut request = request_for(format!("{}/ok", server.url()));
        request.authority = server.host_with_port();

        let context = WorkerContext {
            client_pool: Arc::new(ClientPool::new(ClientPoolConfig::default(), Metrics::noop())),
            metrics: Metrics::noop(),
            dry_run: false,
        };
        let result = execute(&request, &context).await;

        mock.assert_async().await;
        assert_eq!(result.status_code, 200);
        assert!(result.latency_nanos >= 0);
        assert!(result.error.is_empty());
    }

    #[tokio::test]
    async fn transport_error_yields_negative_one() {
        let request = request_for("http://127.0.0.1:1/".to_string());
        let context = WorkerContext {
            client_pool: Arc::new(ClientPool::new(ClientPoolConfig::default(), Metrics::noop())),
            metrics: Metrics::noop(),
            dry_run: false,
        };
        let result = execute(&request, &context).await;
        assert_eq!(result.status_code, -1);
        assert!(!result.error.is_empty());
    }

    #[tokio::test]
    async fn host_header_override_is_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/host-check")
            .match_header("host", "internal.example")
            .with_status(200)
            .create_async()
            .await;

        let mut request = request_for(format!("{}/host-check", server.url()));
        request.authority = server.host_with_port();
        request
            .headers
            .insert("Host".to_string(), "internal.example".to_string());

        let context = WorkerContext {
            client_pool: Arc::new(ClientPool::new(ClientPoolConfig::default(), Metrics::noop())),
            metrics: Metrics::noop(),
            dry_run: false,
        };
        let result = execute(&request, &context).await;

        mock.assert_async().await;
        assert_eq!(result.status_code, 200);
    }
}
