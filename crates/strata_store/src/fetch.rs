//! Peer-to-peer part fetch channel.
//!
//! Part bytes never travel through the coordinator; replicas serve them to
//! each other directly. `PartFetcher` is the client seam. The in-process
//! implementation resolves `host:port` through a process-global endpoint
//! registry: each live replica registers its part store at startup and the
//! handle deregisters it when the replica goes read-only or away.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{ReplicationError, Result};
use crate::part::PartName;
use crate::store::{LocalPartStore, Part};

#[async_trait]
pub trait PartFetcher: Send + Sync {
    /// Fetch the exact part `name` from the replica serving at `host:port`.
    async fn fetch_part(&self, name: &PartName, host: &str, port: u16) -> Result<(Part, Bytes)>;
}

type EndpointRegistry = HashMap<String, Weak<LocalPartStore>>;

static ENDPOINT_REGISTRY: OnceLock<RwLock<EndpointRegistry>> = OnceLock::new();

fn endpoint_registry() -> &'static RwLock<EndpointRegistry> {
    ENDPOINT_REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registration of one replica's fetch endpoint. Dropping it makes the
/// replica unreachable for peers.
pub struct FetchEndpoint {
    key: String,
}

impl FetchEndpoint {
    pub fn register(host: &str, port: u16, store: &Arc<LocalPartStore>) -> Self {
        let key = format!("{host}:{port}");
        if let Ok(mut registry) = endpoint_registry().write() {
            registry.insert(key.clone(), Arc::downgrade(store));
        }
        Self { key }
    }
}

impl Drop for FetchEndpoint {
    fn drop(&mut self) {
        if let Ok(mut registry) = endpoint_registry().write() {
            registry.remove(&self.key);
        }
    }
}

fn lookup_endpoint(key: &str) -> Option<Arc<LocalPartStore>> {
    if let Ok(registry) = endpoint_registry().read() {
        if let Some(entry) = registry.get(key) {
            if let Some(store) = entry.upgrade() {
                return Some(store);
            }
        } else {
            return None;
        }
    } else {
        return None;
    }

    // Clean up the stale entry left by an endpoint whose store is gone.
    if let Ok(mut registry) = endpoint_registry().write() {
        let stale = registry
            .get(key)
            .map(|entry| entry.upgrade().is_none())
            .unwrap_or(false);
        if stale {
            registry.remove(key);
        }
    }
    None
}

/// Fetcher for replicas living in the same process.
pub struct InProcessFetcher;

#[async_trait]
impl PartFetcher for InProcessFetcher {
    async fn fetch_part(&self, name: &PartName, host: &str, port: u16) -> Result<(Part, Bytes)> {
        let key = format!("{host}:{port}");
        let source = key.clone();
        let failed = |reason: &str| ReplicationError::FetchFailed {
            part: name.to_string(),
            host: source.clone(),
            reason: reason.to_string(),
        };

        let store = lookup_endpoint(&key).ok_or_else(|| failed("endpoint not serving"))?;
        let part = store.part(name).ok_or_else(|| failed("part not found on peer"))?;
        let payload = store
            .payload(name)?
            .ok_or_else(|| failed("part payload missing on peer"))?;
        if crate::store::payload_checksum(&payload) != part.checksum {
            return Err(failed("checksum mismatch in transfer"));
        }
        Ok(((*part).clone(), payload))
    }
}
