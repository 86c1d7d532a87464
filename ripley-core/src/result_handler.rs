//! The result handler: the single consumer of completed results. Updates
//! metrics, tracks the N slowest outcomes, emits NDJSON to stdout, and
//! decrements the outstanding-results counter the dispatcher waits on
//! before it may close the result queue.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Notify;

use crate::metrics::Metrics;
use crate::record::{self, ResultRecord};

/// Shared between the dispatcher and the result handler: the dispatcher
/// increments on every enqueue, the handler decrements on every emission,
/// and the dispatcher awaits `notify` before closing the result queue — a
/// monotone counter standing in for a wait-group, documented in DESIGN.md.
pub struct Outstanding {
    count: AtomicUsize,
    notify: Notify,
}

impl Outstanding {
    pub fn new() -> Arc<Self> {
        Arc::new(Outstanding {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        })
    }

    pub fn register(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn complete_one(&self) {
        let previous = self.count.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Waits until the outstanding count reaches zero. Safe to call
    /// concurrently with `register`/`complete_one` racing to zero, since it
    /// re-checks the count after every notification.
    pub async fn wait_for_drain(&self) {
        loop {
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// Bounded max-heap (by latency) of size `n`, used for `--print-slowest`.
struct SlowestTracker {
    capacity: usize,
    heap: BinaryHeap<Reverse<OrderedByLatency>>,
}

struct OrderedByLatency(ResultRecord);

impl PartialEq for OrderedByLatency {
    fn eq(&self, other: &Self) -> bool {
        self.0.latency_nanos == other.0.latency_nanos
    }
}
impl Eq for OrderedByLatency {}
impl PartialOrd for OrderedByLatency {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedByLatency {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.latency_nanos.cmp(&other.0.latency_nanos)
    }
}

impl SlowestTracker {
    fn new(capacity: usize) -> Self {
        SlowestTracker {
            capacity,
            heap: BinaryHeap::new(),
        }
    }

    fn offer(&mut self, result: &ResultRecord) {
        if self.capacity == 0 {
            return;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(OrderedByLatency(result.clone())));
        } else if let Some(Reverse(smallest)) = self.heap.peek() {
            if result.latency_nanos > smallest.0.latency_nanos {
                self.heap.pop();
                self.heap.push(Reverse(OrderedByLatency(result.clone())));
            }
        }
    }

    /// The tracked results, slowest first.
    fn into_sorted(self) -> Vec<ResultRecord> {
        let mut v: Vec<ResultRecord> = self.heap.into_iter().map(|Reverse(e)| e.0).collect();
        v.sort_by(|a, b| b.latency_nanos.cmp(&a.latency_nanos));
        v
    }
}

pub struct ResultHandlerConfig {
    pub silent: bool,
    pub silent_http_error: bool,
    pub print_slowest: usize,
}

/// Runs the result handler to completion: drains `result_rx` until the
/// channel closes, then returns the tracked slowest results (empty if
/// `print_slowest` is zero).
pub async fn run_result_handler<W: AsyncWriteExt + Unpin>(
    result_rx: async_channel::Receiver<ResultRecord>,
    metrics: Arc<Metrics>,
    outstanding: Arc<Outstanding>,
    config: ResultHandlerConfig,
    stdout: W,
    mut stderr: impl AsyncWriteExt + Unpin,
) -> Vec<ResultRecord> {
    let mut out = BufWriter::new(stdout);
    let mut slowest = SlowestTracker::new(config.print_slowest);

    while let Ok(result) = result_rx.recv().await {
        slowest.offer(&result);

        if !config.silent {
            if let Ok(line) = record::encode(&result) {
                let _ = out.write_all(line.as_bytes()).await;
                let _ = out.write_all(b"\n").await;
            }
        }

        if !config.silent_http_error && result.is_server_error() {
            let line = format!(
                "ripley: {} {} -> {}\n",
                result.request.method, result.request.url, result.status_code
            );
            let _ = stderr.write_all(line.as_bytes()).await;
        }

        metrics.set_result_queue_size(result_rx.len() as i64);
        outstanding.complete_one();
    }

    let _ = out.flush().await;
    slowest.into_sorted()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Method, RequestRecord};

    fn dummy_request() -> RequestRecord {
        RequestRecord {
            method: Method::Get,
            url: "http://h".to_string(),
            timestamp: chrono::Utc::now(),
            body: None,
            headers: Default::default(),
            authority: "h:80".to_string(),
            is_tls: false,
        }
    }

    fn result_with_latency(nanos: i64) -> ResultRecord {
        ResultRecord {
            status_code: 200,
            latency_nanos: nanos,
            request: dummy_request(),
            error: String::new(),
            response: None,
        }
    }

    #[test]
    fn slowest_tracker_keeps_n_largest() {
        let mut tracker = SlowestTracker::new(2);
        for nanos in [100, 500, 50, 900, 200] {
            tracker.offer(&result_with_latency(nanos));
        }
        let sorted = tracker.into_sorted();
        let latencies: Vec<_> = sorted.iter().map(|r| r.latency_nanos).collect();
        assert_eq!(latencies, vec![900, 500]);
    }

    #[test]
    fn slowest_tracker_zero_capacity_tracks_nothing() {
        let mut tracker = SlowestTracker::new(0);
        tracker.offer(&result_with_latency(100));
        assert!(tracker.into_sorted().is_empty());
    }

    #[tokio::test]
    async fn outstanding_drains_to_zero() {
        let outstanding = Outstanding::new();
        outstanding.register();
        outstanding.register();

        let waiter = {
            let outstanding = Arc::clone(&outstanding);
            tokio::spawn(async move {
                outstanding.wait_for_drain().await;
            })
        };

        outstanding.complete_one();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        outstanding.complete_one();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait_for_drain should return promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn handler_emits_one_line_per_result_and_drains_outstanding() {
        let (tx, rx) = async_channel::unbounded();
        let outstanding = Outstanding::new();
        for _ in 0..3 {
            outstanding.register();
            tx.send(result_with_latency(1)).await.unwrap();
        }
        drop(tx);

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let slowest = run_result_handler(
            rx,
            Metrics::noop(),
            Arc::clone(&outstanding),
            ResultHandlerConfig {
                silent: false,
                silent_http_error: true,
                print_slowest: 0,
            },
            &mut stdout_buf,
            &mut stderr_buf,
        )
        .await;

        assert_eq!(String::from_utf8(stdout_buf).unwrap().lines().count(), 3);
        assert!(slowest.is_empty());
        outstanding.wait_for_drain().await;
    }
}
