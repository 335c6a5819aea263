//! Event-driven metrics collection.
//!
//! `record_metric` is safe from any hot path: a lock-free channel send,
//! dropped silently when the task is not running (e.g. in tests).

use super::TelemetryConfig;
use once_cell::sync::OnceCell;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

/// Events recorded by the engine and the accept loop.
#[derive(Debug, Clone, Copy)]
pub enum MetricsEvent {
    ConnectionAccepted,
    ConnectionRejected,
    ConnectionClosed,
    RequestServed { status: u16 },
    HandlerPanicked,
}

static SENDER: OnceCell<mpsc::UnboundedSender<MetricsEvent>> = OnceCell::new();

/// Fire-and-forget metric recording.
pub fn record_metric(event: MetricsEvent) {
    if let Some(tx) = SENDER.get() {
        let _ = tx.send(event);
    }
}

/// Handle for the aggregation task.
pub struct MetricsHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MetricsHandle {
    pub fn disabled() -> Self {
        Self {
            shutdown_tx: None,
            task: None,
        }
    }

    /// Flushes a final summary and stops the task.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[derive(Default)]
struct Counters {
    connections_accepted: u64,
    connections_rejected: u64,
    connections_closed: u64,
    requests_served: u64,
    responses_5xx: u64,
    handler_panics: u64,
}

impl Counters {
    fn apply(&mut self, event: MetricsEvent) {
        match event {
            MetricsEvent::ConnectionAccepted => self.connections_accepted += 1,
            MetricsEvent::ConnectionRejected => self.connections_rejected += 1,
            MetricsEvent::ConnectionClosed => self.connections_closed += 1,
            MetricsEvent::RequestServed { status } => {
                self.requests_served += 1;
                if status >= 500 {
                    self.responses_5xx += 1;
                }
            }
            MetricsEvent::HandlerPanicked => self.handler_panics += 1,
        }
    }

    fn report(&self) {
        info!(
            connections_accepted = self.connections_accepted,
            connections_rejected = self.connections_rejected,
            connections_closed = self.connections_closed,
            requests_served = self.requests_served,
            responses_5xx = self.responses_5xx,
            handler_panics = self.handler_panics,
            "metrics summary"
        );
    }
}

/// Spawns the aggregation task and registers the global sender.
pub fn start_metrics_task(config: &TelemetryConfig) -> MetricsHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    if SENDER.set(tx).is_err() {
        // Already running (restart within a process); the existing task
        // keeps collecting.
        return MetricsHandle::disabled();
    }

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let interval = Duration::from_secs(config.report_interval_secs.max(1));

    let task = tokio::spawn(async move {
        let mut counters = Counters::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => counters.apply(event),
                        None => break,
                    }
                }
                _ = ticker.tick() => counters.report(),
                _ = &mut shutdown_rx => {
                    counters.report();
                    break;
                }
            }
        }
    });

    MetricsHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    }
}
