use crate::api::{DecideEndpoint, DecideRequest};
use crate::storage::{Storage, StorageKey};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A remotely evaluated flag value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Number(f64),
    String(String),
    Json(Value),
}

impl FlagValue {
    fn from_json(value: Value) -> Self {
        match value {
            Value::Bool(b) => FlagValue::Bool(b),
            Value::Number(n) => match n.as_f64() {
                Some(f) => FlagValue::Number(f),
                None => FlagValue::Json(Value::Number(n)),
            },
            Value::String(s) => FlagValue::String(s),
            other => FlagValue::Json(other),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            FlagValue::Bool(b) => Value::Bool(*b),
            FlagValue::Number(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FlagValue::String(s) => Value::String(s.clone()),
            FlagValue::Json(v) => v.clone(),
        }
    }
}

/// Result of a [`FlagCache::load`] round-trip.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Another load was already in flight; nothing was done.
    Skipped,
    /// The decide call failed or the response was malformed; cache unchanged.
    Failed,
    /// The cache now holds these flags and payloads.
    Loaded {
        flags: HashMap<String, FlagValue>,
        payloads: HashMap<String, String>,
    },
}

#[derive(Debug, Default)]
struct FlagSnapshot {
    flags: HashMap<String, FlagValue>,
    payloads: HashMap<String, String>,
}

/// Last known feature flags and payloads, refreshed through a single-flight
/// decide call.
///
/// When the server reports it could only compute a subset
/// (`errorsWhileComputingFlags`), the new maps are merged over the cached
/// ones instead of replacing them, so previously known flags survive a
/// partial outage. Flags and payloads always move together under one lock.
pub struct FlagCache {
    decide: Arc<dyn DecideEndpoint>,
    storage: Arc<Storage>,
    snapshot: RwLock<FlagSnapshot>,
    is_loading: Mutex<bool>,
    updates: broadcast::Sender<()>,
}

impl FlagCache {
    /// Build a cache preloaded from the values persisted in `storage`.
    pub fn new(decide: Arc<dyn DecideEndpoint>, storage: Arc<Storage>) -> Self {
        let flags = storage
            .get_dict(StorageKey::EnabledFlags)
            .map(|map| {
                map.into_iter()
                    .map(|(key, value)| (key, FlagValue::from_json(value)))
                    .collect()
            })
            .unwrap_or_default();
        let payloads = storage
            .get_dict(StorageKey::EnabledFlagPayloads)
            .map(|map| {
                map.into_iter()
                    .filter_map(|(key, value)| match value {
                        Value::String(raw) => Some((key, raw)),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let (updates, _) = broadcast::channel(4);
        Self {
            decide,
            storage,
            snapshot: RwLock::new(FlagSnapshot { flags, payloads }),
            is_loading: Mutex::new(false),
            updates,
        }
    }

    /// Refresh the cache from the decide endpoint.
    ///
    /// At most one load is in flight at a time; a call that finds one
    /// running returns [`LoadOutcome::Skipped`] immediately.
    pub async fn load(&self, request: &DecideRequest) -> LoadOutcome {
        {
            let mut loading = self.is_loading.lock();
            if *loading {
                tracing::debug!("flag load already in flight; skipping");
                return LoadOutcome::Skipped;
            }
            *loading = true;
        }
        let _guard = LoadingGuard(&self.is_loading);

        self.load_inner(request).await
    }

    async fn load_inner(&self, request: &DecideRequest) -> LoadOutcome {
        let body = match self.decide.decide(request).await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(error = %err, "decide request failed");
                return LoadOutcome::Failed;
            }
        };

        let Some(new_flags) = body.get("featureFlags").and_then(Value::as_object) else {
            tracing::warn!("decide response missing featureFlags object");
            return LoadOutcome::Failed;
        };
        let Some(new_payloads) = body.get("featureFlagPayloads").and_then(Value::as_object) else {
            tracing::warn!("decide response missing featureFlagPayloads object");
            return LoadOutcome::Failed;
        };
        let partial = body
            .get("errorsWhileComputingFlags")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let new_flags: HashMap<String, FlagValue> = new_flags
            .iter()
            .map(|(key, value)| (key.clone(), FlagValue::from_json(value.clone())))
            .collect();
        let new_payloads: HashMap<String, String> = new_payloads
            .iter()
            .map(|(key, value)| {
                let raw = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), raw)
            })
            .collect();

        let (flags, payloads) = {
            let mut snapshot = self.snapshot.write();
            if partial {
                tracing::warn!(
                    received = new_flags.len(),
                    "server reported partial flag computation; merging over cached flags"
                );
                snapshot.flags.extend(new_flags);
                snapshot.payloads.extend(new_payloads);
            } else {
                snapshot.flags = new_flags;
                snapshot.payloads = new_payloads;
            }
            (snapshot.flags.clone(), snapshot.payloads.clone())
        };

        self.persist(&flags, &payloads);
        let _ = self.updates.send(());
        tracing::debug!(flags = flags.len(), "feature flags updated");

        LoadOutcome::Loaded { flags, payloads }
    }

    /// True unless the flag is absent or an explicit boolean `false`.
    ///
    /// Variant strings and any other present value count as enabled.
    pub fn is_enabled(&self, key: &str) -> bool {
        match self.snapshot.read().flags.get(key) {
            None => false,
            Some(FlagValue::Bool(enabled)) => *enabled,
            Some(_) => true,
        }
    }

    /// Raw stored value for `key`.
    pub fn get(&self, key: &str) -> Option<FlagValue> {
        self.snapshot.read().flags.get(key).cloned()
    }

    /// Payload for `key`, parsed as JSON where possible.
    ///
    /// Payloads arrive as raw strings; top-level scalars parse too. A string
    /// that is not JSON at all comes back unchanged.
    pub fn get_payload(&self, key: &str) -> Option<Value> {
        let raw = self.snapshot.read().payloads.get(key).cloned()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(_) => Some(Value::String(raw)),
        }
    }

    /// Receiver for "flags updated" notifications, fired after every
    /// successful load.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.updates.subscribe()
    }

    fn persist(&self, flags: &HashMap<String, FlagValue>, payloads: &HashMap<String, String>) {
        let flag_map: Map<String, Value> = flags
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();
        let payload_map: Map<String, Value> = payloads
            .iter()
            .map(|(key, raw)| (key.clone(), Value::String(raw.clone())))
            .collect();
        self.storage.set_dict(StorageKey::EnabledFlags, &flag_map);
        self.storage.set_dict(StorageKey::EnabledFlagPayloads, &payload_map);
    }
}

/// Clears the single-flight flag on every exit path.
struct LoadingGuard<'a>(&'a Mutex<bool>);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = false;
    }
}
