use tokio::sync::broadcast;

/// Connection class reported by the platform's reachability monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Wifi,
    Cellular,
    Other,
}

/// Connectivity transitions consumed by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Reachable(Connection),
    Unreachable,
}

/// Source of connectivity transitions.
///
/// Implementations wrap the platform's reachability monitor;
/// [`ChannelObserver`] is a ready-made bridge for callback-style platforms
/// and for tests.
pub trait NetworkObserver: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent>;
    fn start(&self);
    fn stop(&self);
}

/// Broadcast-backed observer fed by pushing transitions in from platform
/// callbacks.
#[derive(Debug)]
pub struct ChannelObserver {
    sender: broadcast::Sender<NetworkEvent>,
}

impl ChannelObserver {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }

    /// Push a transition to all subscribers.
    pub fn emit(&self, event: NetworkEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for ChannelObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkObserver for ChannelObserver {
    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.sender.subscribe()
    }

    fn start(&self) {}

    fn stop(&self) {}
}
