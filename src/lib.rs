//! Core of the Beacon client analytics SDK: a crash-safe on-disk event
//! queue, a batching uploader with retry classification and network gating,
//! and a feature-flag cache with single-flight refresh.
//!
//! The facade (capture/identify APIs, session identity, platform
//! reachability) lives elsewhere; this crate consumes those concerns through
//! the [`api::BatchEndpoint`], [`api::DecideEndpoint`], and
//! [`network::NetworkObserver`] seams. No I/O or network failure ever
//! propagates out of the pipeline: everything is retried, logged, or
//! surfaced as an outcome value.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod flags;
pub mod network;
pub mod queue;
pub mod storage;
pub mod uploader;

pub use api::{BatchEndpoint, BatchResponse, DecideEndpoint, DecideRequest, HttpApi};
pub use config::{DataMode, PipelineConfig};
pub use coordinator::Coordinator;
pub use error::PipelineError;
pub use flags::{FlagCache, FlagValue, LoadOutcome};
pub use network::{ChannelObserver, Connection, NetworkEvent, NetworkObserver};
pub use queue::{PeekedRecord, PersistentQueue};
pub use storage::{Storage, StorageKey};
pub use uploader::Uploader;
