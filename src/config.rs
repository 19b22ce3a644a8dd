use std::time::Duration;

/// Connection classes the uploader is willing to send on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    /// Upload on any reachable connection.
    Any,
    /// Upload only while on wifi; other connections pause the uploader.
    Wifi,
}

/// Tuning knobs for the delivery pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Periodic flush cadence.
    pub flush_interval: Duration,

    /// Queue depth that triggers an immediate flush on admission.
    pub flush_at: usize,

    /// Upper bound on records peeked per flush.
    pub max_batch_size: usize,

    /// Hard cap on queued records; the oldest records are dropped beyond it.
    pub max_queue_size: usize,

    /// Gates uploads on the current connection class.
    pub data_mode: DataMode,

    /// Base delay of the retry schedule.
    pub retry_delay: Duration,

    /// Cap on the retry schedule.
    pub max_retry_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
            flush_at: 20,
            max_batch_size: 50,
            max_queue_size: 1000,
            data_mode: DataMode::Any,
            retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Clamp out-of-range values instead of failing.
    ///
    /// A misconfigured client should still deliver events, so every bad knob
    /// is warned about and pulled back to something workable.
    pub fn validated(mut self) -> Self {
        if self.flush_at == 0 {
            tracing::warn!("flush_at must be > 0; clamping to 1");
            self.flush_at = 1;
        }
        if self.max_batch_size == 0 {
            tracing::warn!("max_batch_size must be > 0; clamping to 1");
            self.max_batch_size = 1;
        }
        if self.max_queue_size < self.max_batch_size {
            tracing::warn!(
                max_queue_size = self.max_queue_size,
                max_batch_size = self.max_batch_size,
                "max_queue_size smaller than max_batch_size; clamping up"
            );
            self.max_queue_size = self.max_batch_size;
        }
        if self.flush_interval.is_zero() {
            tracing::warn!("flush_interval must be > 0; clamping to 1s");
            self.flush_interval = Duration::from_secs(1);
        }
        if self.retry_delay.is_zero() {
            tracing::warn!("retry_delay must be > 0; clamping to 1s");
            self.retry_delay = Duration::from_secs(1);
        }
        if self.retry_delay > self.max_retry_delay {
            tracing::warn!(
                retry_ms = self.retry_delay.as_millis() as u64,
                max_ms = self.max_retry_delay.as_millis() as u64,
                "retry_delay > max_retry_delay; clamping to max"
            );
            self.retry_delay = self.max_retry_delay;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = PipelineConfig::default().validated();
        assert_eq!(cfg.flush_at, 20);
        assert_eq!(cfg.max_batch_size, 50);
        assert!(cfg.max_queue_size >= cfg.max_batch_size);
    }

    #[test]
    fn zero_knobs_are_clamped() {
        let cfg = PipelineConfig {
            flush_at: 0,
            max_batch_size: 0,
            max_queue_size: 0,
            flush_interval: Duration::ZERO,
            retry_delay: Duration::ZERO,
            ..PipelineConfig::default()
        }
        .validated();
        assert_eq!(cfg.flush_at, 1);
        assert_eq!(cfg.max_batch_size, 1);
        assert_eq!(cfg.max_queue_size, 1);
        assert_eq!(cfg.flush_interval, Duration::from_secs(1));
        assert_eq!(cfg.retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn retry_delay_clamped_to_max() {
        let cfg = PipelineConfig {
            retry_delay: Duration::from_secs(60),
            max_retry_delay: Duration::from_secs(30),
            ..PipelineConfig::default()
        }
        .validated();
        assert_eq!(cfg.retry_delay, Duration::from_secs(30));
    }
}
