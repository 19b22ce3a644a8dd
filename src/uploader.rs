use crate::api::{BatchEndpoint, BatchResponse};
use crate::config::{DataMode, PipelineConfig};
use crate::network::{Connection, NetworkEvent};
use crate::queue::PersistentQueue;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Pause and back-off state. `paused` and `paused_until` are only ever read
/// together, under this one lock.
#[derive(Debug, Default)]
struct PauseState {
    paused: bool,
    paused_until: Option<Instant>,
    retry_count: u32,
}

struct Timer {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Drains the persistent queue in FIFO batches.
///
/// A flush peeks up to `max_batch_size` records, decodes them into wire
/// events (corrupt records are deleted in place), and hands the batch to the
/// endpoint. Transport failures and redirects leave the records queued and
/// push `paused_until` out on a linear schedule capped at `max_retry_delay`;
/// every other status pops the batch. At most one flush is in flight at a
/// time, and flushes are no-ops while the network gate holds the uploader
/// paused.
pub struct Uploader {
    config: PipelineConfig,
    queue: Arc<PersistentQueue>,
    endpoint: Arc<dyn BatchEndpoint>,
    is_flushing: Mutex<bool>,
    pause: Mutex<PauseState>,
    timer: Mutex<Option<Timer>>,
    /// Self-handle for spawned flush bodies; upgrading fails once the
    /// uploader is dropped, which retires the timer task with it.
    handle: Weak<Uploader>,
}

impl Uploader {
    pub fn new(
        config: PipelineConfig,
        queue: Arc<PersistentQueue>,
        endpoint: Arc<dyn BatchEndpoint>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|handle| Self {
            config: config.validated(),
            queue,
            endpoint,
            is_flushing: Mutex::new(false),
            pause: Mutex::new(PauseState::default()),
            timer: Mutex::new(None),
            handle: handle.clone(),
        })
    }

    pub fn queue(&self) -> &Arc<PersistentQueue> {
        &self.queue
    }

    /// Start the periodic flush timer. Idempotent while running.
    pub fn start(&self) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let interval = self.config.flush_interval;
        let handle = self.handle.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let Some(uploader) = handle.upgrade() else { break };
                        uploader.flush().await;
                    }
                    _ = stopped.changed() => break,
                }
            }
        });
        *timer = Some(Timer { stop, task });
    }

    /// Cancel future timer fires. An in-flight flush runs to completion.
    pub fn stop(&self) {
        if let Some(timer) = self.timer.lock().take() {
            let _ = timer.stop.send(true);
            // the task winds down on its own; nothing waits on it
            drop(timer.task);
        }
    }

    /// Admission hook: schedule an immediate flush once the queue is deep
    /// enough.
    pub fn add_triggered(&self, depth: usize) {
        if depth >= self.config.flush_at {
            self.spawn_flush();
        }
    }

    /// Append a record, apply the admission cap, and run the depth trigger.
    pub fn enqueue(&self, bytes: &[u8]) {
        self.queue.add(bytes);
        self.queue.trim(self.config.max_queue_size);
        self.add_triggered(self.queue.depth());
    }

    /// Send one batch from the head of the queue.
    ///
    /// No-op while paused, while backing off, or while another flush is in
    /// flight.
    pub async fn flush(&self) {
        if !self.can_send() {
            return;
        }
        {
            let mut flushing = self.is_flushing.lock();
            if *flushing {
                return;
            }
            *flushing = true;
        }

        self.flush_batch().await;

        *self.is_flushing.lock() = false;
    }

    /// Apply a connectivity transition to the pause gate.
    ///
    /// A transition that leaves the uploader unpaused schedules an immediate
    /// flush to drain whatever accumulated while offline.
    pub fn handle_network_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::Reachable(connection) => {
                let paused =
                    self.config.data_mode == DataMode::Wifi && connection != Connection::Wifi;
                self.pause.lock().paused = paused;
                tracing::debug!(?connection, paused, "network reachable");
                if !paused {
                    self.spawn_flush();
                }
            }
            NetworkEvent::Unreachable => {
                self.pause.lock().paused = true;
                tracing::debug!("network unreachable; uploads paused");
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause.lock().paused
    }

    pub fn paused_until(&self) -> Option<Instant> {
        self.pause.lock().paused_until
    }

    pub fn retry_count(&self) -> u32 {
        self.pause.lock().retry_count
    }

    fn can_send(&self) -> bool {
        let pause = self.pause.lock();
        if pause.paused {
            return false;
        }
        match pause.paused_until {
            Some(until) => until <= Instant::now(),
            None => true,
        }
    }

    fn spawn_flush(&self) {
        let Some(uploader) = self.handle.upgrade() else {
            return;
        };
        tokio::spawn(async move { uploader.flush().await });
    }

    async fn flush_batch(&self) {
        let records = self.queue.peek(self.config.max_batch_size);
        if records.is_empty() {
            return;
        }

        // Decode records into wire events. Removal always goes by the name
        // captured at peek time: a concurrent enqueue can trim the head
        // while this flush is in flight, and positional deletes would then
        // land on the wrong record.
        let mut events = Vec::with_capacity(records.len());
        let mut batch_names = Vec::with_capacity(records.len());
        let mut corrupt = Vec::new();
        for record in records {
            match serde_json::from_slice::<Value>(&record.bytes) {
                Ok(event) if event.is_object() => {
                    let name = event.get("event").and_then(Value::as_str).unwrap_or("<unnamed>");
                    tracing::debug!(event = name, "batching event");
                    events.push(event);
                    batch_names.push(record.name);
                }
                Ok(_) => {
                    tracing::warn!(record = %record.name, "record is not an event object; dropping");
                    corrupt.push(record.name);
                }
                Err(err) => {
                    tracing::warn!(record = %record.name, error = %err, "undecodable record; dropping");
                    corrupt.push(record.name);
                }
            }
        }
        self.queue.discard(&corrupt);
        if events.is_empty() {
            return;
        }

        let response = self.endpoint.send_batch(&events).await;
        self.apply_result(&batch_names, response);
    }

    fn apply_result(&self, batch_names: &[String], response: BatchResponse) {
        let status = response.status_code.unwrap_or(-1);
        let sent = batch_names.len();

        if is_retryable(status) {
            let mut pause = self.pause.lock();
            pause.retry_count = pause.retry_count.saturating_add(1);
            let delay = self
                .config
                .retry_delay
                .saturating_mul(pause.retry_count)
                .min(self.config.max_retry_delay);
            pause.paused_until = Some(Instant::now() + delay);
            tracing::warn!(
                status,
                sent,
                retry_count = pause.retry_count,
                delay_ms = delay.as_millis() as u64,
                "batch not accepted; backing off"
            );
            return;
        }

        if (200..=299).contains(&status) {
            tracing::debug!(status, sent, "batch accepted");
        } else {
            tracing::warn!(status, sent, "batch rejected permanently; dropping records");
        }
        {
            let mut pause = self.pause.lock();
            pause.retry_count = 0;
            pause.paused_until = None;
        }
        // remove exactly what was sent; records a concurrent trim already
        // popped are skipped rather than reaching past into unsent ones
        self.queue.discard(batch_names);
    }
}

/// Transport failures (-1) and redirects are worth retrying; every other
/// status is treated as processed.
fn is_retryable(status: i32) -> bool {
    status == -1 || (300..=399).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failure_and_redirects_are_retryable() {
        assert!(is_retryable(-1));
        assert!(is_retryable(300));
        assert!(is_retryable(308));
        assert!(is_retryable(399));
    }

    #[test]
    fn success_and_client_server_errors_are_not_retryable() {
        assert!(!is_retryable(200));
        assert!(!is_retryable(204));
        assert!(!is_retryable(400));
        assert!(!is_retryable(413));
        assert!(!is_retryable(500));
        assert!(!is_retryable(503));
    }
}
