//! Prometheus metrics and the per-process exporter.
//!
//! The exporter binds once per process; a second bind attempt that fails with
//! `AddrInUse` (prefork-style worker pools racing at boot) is tolerated and
//! ignored. Any other bind error is fatal.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, TextEncoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::{KilnError, Result};

static TASKS_ACCEPTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "conversion_tasks_accepted_total",
            "Total number of conversion tasks accepted",
        ),
        &["priority"],
    )
    .expect("metric definition");
    prometheus::register(Box::new(counter.clone())).ok();
    counter
});

static TASKS_COMPLETED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "conversion_tasks_completed_total",
            "Total number of conversion file results by status",
        ),
        &["status"],
    )
    .expect("metric definition");
    prometheus::register(Box::new(counter.clone())).ok();
    counter
});

static QUEUE_DEPTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("task_queue_depth", "Number of pending tasks per queue"),
        &["queue"],
    )
    .expect("metric definition");
    prometheus::register(Box::new(gauge.clone())).ok();
    gauge
});

static EXPORTER_STARTED: AtomicBool = AtomicBool::new(false);

/// Record an accepted job by priority.
pub fn record_task_accepted(priority: &str) {
    TASKS_ACCEPTED.with_label_values(&[priority]).inc();
}

/// Record a completed file conversion with status `success|failed|ignored`.
pub fn record_task_completed(status: &str) {
    TASKS_COMPLETED.with_label_values(&[status]).inc();
}

/// Publish the depth of a logical queue.
pub fn set_queue_depth(queue: &str, depth: i64) {
    QUEUE_DEPTH.with_label_values(&[queue]).set(depth);
}

/// Render the default registry in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buf) {
        warn!("Failed to encode metrics: {err}");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Start the metrics exporter exactly once per process.
pub async fn ensure_metrics_server(port: u16) -> Result<()> {
    if EXPORTER_STARTED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == ErrorKind::AddrInUse => {
            debug!("Metrics exporter already bound on port {port}");
            return Ok(());
        }
        Err(err) => {
            EXPORTER_STARTED.store(false, Ordering::SeqCst);
            return Err(KilnError::Io {
                message: format!("Failed to bind metrics exporter on port {port}: {err}"),
                path: None,
                source: Some(err),
            });
        }
    };

    info!("Metrics exporter listening on port {port}");
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                continue;
            };
            tokio::spawn(async move {
                // Drain whatever request line arrives; the exporter serves one
                // document regardless of path.
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let body = gather();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        record_task_accepted("normal");
        record_task_completed("success");
        record_task_completed("failed");
        set_queue_depth("conversion", 3);
        let text = gather();
        assert!(text.contains("conversion_tasks_completed_total"));
        assert!(text.contains("task_queue_depth"));
    }

    #[tokio::test]
    async fn test_second_bind_is_ignored() {
        ensure_metrics_server(0).await.unwrap();
        // Second call short-circuits on the started flag.
        ensure_metrics_server(0).await.unwrap();
    }
}
