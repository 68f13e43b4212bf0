//! In-memory `ApiSurface` used by tests and dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use kcopy_core::{object_name, object_namespace, CopyError, CopyOutcome, DiscoveredResource, ResolvedResource, ResourceCoordinate};
use rustc_hash::FxHashSet;
use serde_json::Value as Json;

use crate::ApiSurface;

type ObjectKey = (ResourceCoordinate, String, String);

/// One recorded `apply` call.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedCall {
    pub coordinate: ResourceCoordinate,
    pub namespace: Option<String>,
    pub object: Json,
}

/// Simple in-memory cluster: a registry plus objects keyed by (coordinate, namespace, name).
#[derive(Default)]
pub struct MemorySurface {
    registry: Vec<DiscoveredResource>,
    objects: Mutex<BTreeMap<ObjectKey, Json>>,
    applied: Mutex<Vec<AppliedCall>>,
    failing: Mutex<FxHashSet<String>>,
    failing_lists: Mutex<FxHashSet<ResourceCoordinate>>,
    discovery_down: AtomicBool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    latency: Option<Duration>,
}

/// Counts a list/get/apply call as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) { self.0.fetch_sub(1, Ordering::SeqCst); }
}

impl MemorySurface {
    pub fn new(registry: Vec<DiscoveredResource>) -> Self {
        Self { registry, ..Self::default() }
    }

    /// Delay every list/get/apply call, to make concurrency observable in tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, coordinate: &ResourceCoordinate, object: Json) {
        let key = (
            coordinate.clone(),
            object_namespace(&object).unwrap_or_default().to_string(),
            object_name(&object).unwrap_or_default().to_string(),
        );
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).insert(key, object);
    }

    /// Make `apply` fail for objects named `name`.
    pub fn fail_apply_for(&self, name: &str) {
        self.failing.lock().unwrap_or_else(PoisonError::into_inner).insert(name.to_string());
    }

    /// Make every `list` of `coordinate` fail.
    pub fn fail_list_for(&self, coordinate: &ResourceCoordinate) {
        self.failing_lists.lock().unwrap_or_else(PoisonError::into_inner).insert(coordinate.clone());
    }

    /// Make `discover` fail.
    pub fn fail_discovery(&self) { self.discovery_down.store(true, Ordering::SeqCst); }

    pub fn applied(&self) -> Vec<AppliedCall> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Total number of surface calls, discovery included.
    pub fn call_count(&self) -> usize { self.calls.load(Ordering::SeqCst) }

    /// Highest number of list/get/apply calls observed running at once.
    pub fn peak_in_flight(&self) -> usize { self.peak.load(Ordering::SeqCst) }

    pub fn objects_of(&self, coordinate: &ResourceCoordinate) -> Vec<Json> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((c, _, _), _)| c == coordinate)
            .map(|(_, v)| v.clone())
            .collect()
    }

    async fn enter(&self) -> InFlight<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
        guard
    }
}

#[async_trait::async_trait]
impl ApiSurface for MemorySurface {
    async fn discover(&self) -> CopyOutcome<Vec<DiscoveredResource>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.discovery_down.load(Ordering::SeqCst) {
            return Err(CopyError::Transport("discovery unavailable".into()));
        }
        Ok(self.registry.clone())
    }

    async fn list(&self, resource: &ResolvedResource, namespace: Option<&str>) -> CopyOutcome<Vec<Json>> {
        let _call = self.enter().await;
        if self.failing_lists.lock().unwrap_or_else(PoisonError::into_inner).contains(&resource.coordinate) {
            return Err(CopyError::Transport(format!("list rejected for {}", resource.coordinate)));
        }
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .iter()
            .filter(|((c, ns, _), _)| *c == resource.coordinate && namespace.map_or(true, |n| n == ns.as_str()))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn get(&self, resource: &ResolvedResource, namespace: Option<&str>, name: &str) -> CopyOutcome<Option<Json>> {
        let _call = self.enter().await;
        let key = (resource.coordinate.clone(), namespace.unwrap_or_default().to_string(), name.to_string());
        Ok(self.objects.lock().unwrap_or_else(PoisonError::into_inner).get(&key).cloned())
    }

    async fn apply(&self, resource: &ResolvedResource, namespace: Option<&str>, object: &Json) -> CopyOutcome<()> {
        let _call = self.enter().await;
        let name = object_name(object).ok_or_else(|| CopyError::Internal("object missing metadata.name".into()))?;
        if self.failing.lock().unwrap_or_else(PoisonError::into_inner).contains(name) {
            return Err(CopyError::Transport(format!("apply rejected for {name}")));
        }
        self.applied.lock().unwrap_or_else(PoisonError::into_inner).push(AppliedCall {
            coordinate: resource.coordinate.clone(),
            namespace: namespace.map(str::to_string),
            object: object.clone(),
        });
        let key = (resource.coordinate.clone(), namespace.unwrap_or_default().to_string(), name.to_string());
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).insert(key, object.clone());
        Ok(())
    }
}
