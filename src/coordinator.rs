use crate::network::NetworkObserver;
use crate::uploader::Uploader;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

struct Forwarder {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Wires connectivity transitions into the uploader's pause gate and owns
/// the lifecycle of the observer subscription and the flush timer.
pub struct Coordinator {
    uploader: Arc<Uploader>,
    observer: Arc<dyn NetworkObserver>,
    forwarder: Mutex<Option<Forwarder>>,
}

impl Coordinator {
    pub fn new(uploader: Arc<Uploader>, observer: Arc<dyn NetworkObserver>) -> Self {
        Self {
            uploader,
            observer,
            forwarder: Mutex::new(None),
        }
    }

    /// Start the observer, the event forwarding task, and the flush timer.
    /// Idempotent while running.
    pub fn start(&self) {
        {
            let mut forwarder = self.forwarder.lock();
            if forwarder.is_some() {
                return;
            }

            self.observer.start();
            let mut events = self.observer.subscribe();
            let (stop, mut stopped) = watch::channel(false);
            let uploader = Arc::clone(&self.uploader);
            let task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(event) => uploader.handle_network_event(event),
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                tracing::warn!(missed, "dropped network events; continuing");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = stopped.changed() => break,
                    }
                }
            });
            *forwarder = Some(Forwarder { stop, task });
        }

        self.uploader.start();
    }

    /// Stop the observer, the forwarding task, and the timer. An in-flight
    /// flush runs to completion.
    pub fn stop(&self) {
        self.observer.stop();
        if let Some(forwarder) = self.forwarder.lock().take() {
            let _ = forwarder.stop.send(true);
            drop(forwarder.task);
        }
        self.uploader.stop();
    }
}
