//! Region resolution
//!
//! Bucket scoped operations run against the endpoint of the bucket's
//! region. The endpoint is resolved per call and passed down explicitly;
//! the client's default endpoint is only changed through [`EndpointGuard`],
//! which puts the previous value back when dropped.

use crate::s3::canonical::build_url;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// API host of one region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Region name, empty for the configured default
    pub name: String,
    pub host: String,
    pub secure: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, secure: bool) -> Self {
        Self {
            name: String::new(),
            host: host.into(),
            secure,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn url(&self, bucket: &str, key: &str, query: &BTreeMap<String, String>) -> String {
        build_url(self.secure, &self.host, bucket, key, query)
    }
}

/// Region entry of the region directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Region {
    pub name: String,
    pub endpoint: String,
}

/// Region name to endpoint host directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionDirectory {
    #[serde(rename = "Region")]
    pub regions: Vec<Region>,
}

impl RegionDirectory {
    pub fn endpoint_of(&self, region: &str) -> Option<&str> {
        self.regions
            .iter()
            .find(|r| r.name == region)
            .map(|r| r.endpoint.as_str())
    }

    /// Endpoint of a region; the default endpoint when the region is unknown.
    pub fn select(&self, region: &str, default: &Endpoint) -> Endpoint {
        match self.endpoint_of(region) {
            Some(host) if !host.is_empty() => {
                Endpoint::new(host, default.secure).with_name(region)
            }
            _ => {
                tracing::debug!(region, host = %default.host, "Region not in directory, using default endpoint");
                default.clone()
            }
        }
    }
}

/// Caches of bucket locations and of the region directory.
#[derive(Debug, Default)]
pub struct RegionResolver {
    locations: Mutex<HashMap<String, String>>,
    directory: Mutex<Option<RegionDirectory>>,
}

impl RegionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_location(&self, bucket: &str) -> Option<String> {
        self.locations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bucket)
            .cloned()
    }

    pub fn remember_location(&self, bucket: &str, region: &str) {
        self.locations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bucket.to_string(), region.to_string());
    }

    pub fn forget_location(&self, bucket: &str) {
        self.locations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(bucket);
    }

    pub fn cached_directory(&self) -> Option<RegionDirectory> {
        self.directory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn remember_directory(&self, directory: RegionDirectory) {
        *self.directory.lock().unwrap_or_else(PoisonError::into_inner) = Some(directory);
    }
}

/// Shared default endpoint of a client
#[derive(Debug, Clone)]
pub struct EndpointSlot {
    current: Arc<RwLock<Endpoint>>,
}

impl EndpointSlot {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            current: Arc::new(RwLock::new(endpoint)),
        }
    }

    pub fn get(&self) -> Endpoint {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, endpoint: Endpoint) -> Endpoint {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, endpoint)
    }

    /// Replace the endpoint until the returned guard is dropped.
    pub fn scoped(&self, endpoint: Endpoint) -> EndpointGuard {
        let previous = self.set(endpoint);
        EndpointGuard {
            slot: self.clone(),
            previous: Some(previous),
        }
    }
}

/// Restores the previous default endpoint on drop, including on early
/// returns and unwinding.
#[must_use = "the endpoint is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct EndpointGuard {
    slot: EndpointSlot,
    previous: Option<Endpoint>,
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            tracing::trace!(host = %previous.host, "Restoring endpoint");
            self.slot.set(previous);
        }
    }
}
