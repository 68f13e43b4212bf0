//! kcopy engine: download and upload orchestration.
//!
//! Download resolves tokens against the source registry, lists every resolved resource and
//! writes objects to the store through one pool batch. Upload walks the store, plans kind waves
//! and applies each wave as one batch, optionally waiting for readiness between waves.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kcopy_core::{object_name, object_namespace, CopyError, CopyOutcome, CopyResult, CopyTask, Direction, ResolvedResource, ResourceCoordinate};
use kcopy_order::{plan_waves, PriorityTable};
use kcopy_pool::WorkerPool;
use kcopy_resolve::Resolver;
use kcopy_store::{ObjectStore, StoredObject};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

pub mod config;
pub mod readiness;
pub mod report;
pub mod scheduler;

pub use config::CopierConfig;
pub use readiness::{is_ready, wait_for_wave, ReadinessTarget, WaveReadiness};
pub use report::{KindSummary, RunReport, RunStatus, MAX_KIND_ERRORS};
pub use scheduler::SchedulerProfiles;

use report::ReportBuilder;

/// Fields the destination assigns itself; uploading them is rejected or meaningless.
const SERVER_ASSIGNED: &[&str] = &["uid", "resourceVersion", "creationTimestamp", "generation", "selfLink", "managedFields", "ownerReferences"];

/// Apply the optional per-call timeout; expiry is a transport failure.
pub(crate) async fn with_timeout<T>(limit: Option<Duration>, fut: impl Future<Output = CopyOutcome<T>>) -> CopyOutcome<T> {
    match limit {
        None => fut.await,
        Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| CopyError::Transport(format!("call timed out after {}ms", d.as_millis())))?,
    }
}

fn metadata_mut(obj: &mut Json) -> Option<&mut serde_json::Map<String, Json>> {
    obj.get_mut("metadata").and_then(Json::as_object_mut)
}

/// Shape a listed object for the store: no managed fields, `apiVersion`/`kind` always set.
pub fn prepare_download(resource: &ResolvedResource, mut obj: Json) -> Json {
    if let Some(meta) = metadata_mut(&mut obj) {
        meta.remove("managedFields");
    }
    if let Some(map) = obj.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| Json::String(resource.coordinate.api_version()));
        map.entry("kind").or_insert_with(|| Json::String(resource.kind.clone()));
    }
    obj
}

/// Strip server-assigned metadata and pin the object to its stored namespace.
pub fn prepare_upload(mut obj: Json, namespace: Option<&str>) -> Json {
    if let Some(meta) = metadata_mut(&mut obj) {
        for field in SERVER_ASSIGNED {
            meta.remove(*field);
        }
        match namespace {
            Some(ns) => {
                meta.insert("namespace".into(), Json::String(ns.to_string()));
            }
            None => {
                meta.remove("namespace");
            }
        }
    }
    obj
}

pub struct Copier {
    cfg: CopierConfig,
    pool: WorkerPool,
    table: PriorityTable,
}

impl Copier {
    pub fn new(cfg: CopierConfig) -> CopyOutcome<Self> {
        let pool = WorkerPool::new(cfg.pool_size, cfg.cancel.clone())?;
        Ok(Self { cfg, pool, table: PriorityTable::well_known() })
    }

    pub fn with_priority_table(mut self, table: PriorityTable) -> Self {
        self.table = table;
        self
    }

    pub fn config(&self) -> &CopierConfig { &self.cfg }

    /// Copy every object of the resources named by `tokens` from the source into the store.
    pub async fn download(&self, tokens: &[String]) -> CopyOutcome<RunReport> {
        self.cfg.validate_for(Direction::Download)?;
        let source = self.cfg.source.clone().ok_or_else(|| CopyError::Configuration("download needs a source cluster".into()))?;
        let store = ObjectStore::create(&self.cfg.obj_dir)?;
        let _lock = store.lock()?;
        let t0 = Instant::now();
        let mut report = ReportBuilder::new(Direction::Download);
        if self.cfg.cancel.is_cancelled() {
            report.cancelled();
            return Ok(report.finish());
        }

        let registry = match with_timeout(self.cfg.call_timeout, source.discover()).await {
            Ok(registry) => registry,
            Err(e) => {
                warn!(error = %e, "discovery failed");
                for token in tokens {
                    report.token_failed(token, &e);
                }
                return Ok(report.finish());
            }
        };
        let resolver = Resolver::new(registry);
        let mut resources: Vec<ResolvedResource> = Vec::new();
        for token in tokens {
            match resolver.resolve(token) {
                Ok(r) if resources.iter().any(|seen| seen.coordinate == r.coordinate) => {
                    debug!(token = %token, coordinate = %r.coordinate, "duplicate token");
                }
                Ok(r) => {
                    info!(token = %token, coordinate = %r.coordinate, kind = %r.kind, "resolved");
                    resources.push(r);
                }
                Err(e) => {
                    warn!(token = %token, error = %e, "token not resolved");
                    report.token_failed(token, &e);
                }
            }
        }

        let mut kinds: FxHashMap<ResourceCoordinate, String> = FxHashMap::default();
        let mut jobs: Vec<(CopyTask, Json)> = Vec::new();
        for resource in &resources {
            if self.cfg.cancel.is_cancelled() {
                report.cancelled();
                break;
            }
            report.touch(&resource.coordinate, &resource.kind);
            kinds.insert(resource.coordinate.clone(), resource.kind.clone());
            let objects = match with_timeout(self.cfg.call_timeout, source.list(resource, None)).await {
                Ok(objects) => objects,
                Err(e) => {
                    warn!(coordinate = %resource.coordinate, error = %e, "list failed");
                    report.kind_failed(&resource.coordinate, &resource.kind, &e);
                    continue;
                }
            };
            debug!(coordinate = %resource.coordinate, count = objects.len(), "listed");
            for obj in objects {
                let obj = prepare_download(resource, obj);
                let Some(name) = object_name(&obj).map(str::to_string) else {
                    warn!(coordinate = %resource.coordinate, "listed object without a name; skipped");
                    continue;
                };
                let namespace = if resource.namespaced { object_namespace(&obj).map(str::to_string) } else { None };
                jobs.push((CopyTask::new(resource.coordinate.clone(), namespace.as_deref(), name, Direction::Download), obj));
            }
        }

        let store = Arc::new(store);
        let results = self
            .pool
            .run_batch(jobs, move |task, obj| {
                let store = Arc::clone(&store);
                async move { store.write(&task.coordinate, task.namespace(), &task.object_name, &obj).await.map(|_| ()) }
            })
            .await;
        report.absorb(|c| kinds.get(c).cloned().unwrap_or_else(|| c.resource.clone()), results);
        if self.cfg.cancel.is_cancelled() {
            report.cancelled();
        }
        let report = report.finish();
        info!(status = %report.status, succeeded = report.succeeded(), failed = report.failed(), took_ms = %t0.elapsed().as_millis(), "download finished");
        Ok(report)
    }

    /// Apply every stored object to the target, wave by wave.
    pub async fn upload(&self) -> CopyOutcome<RunReport> {
        self.cfg.validate_for(Direction::Upload)?;
        let target = self.cfg.target.clone().ok_or_else(|| CopyError::Configuration("upload needs a target cluster".into()))?;
        let store = ObjectStore::open_existing(&self.cfg.obj_dir)?;
        let profiles = SchedulerProfiles::load_optional(self.cfg.scheduler_config.as_deref())?;
        let _lock = store.lock()?;
        let t0 = Instant::now();
        let mut report = ReportBuilder::new(Direction::Upload);

        let walker = store.clone();
        let stored: Vec<StoredObject> = tokio::task::spawn_blocking(move || walker.list()?.collect::<CopyOutcome<Vec<_>>>())
            .await
            .map_err(|e| CopyError::Internal(format!("store walk aborted: {e}")))?
            .map_err(|e| CopyError::Configuration(format!("cannot enumerate {}: {e}", store.base().display())))?;
        info!(objects = stored.len(), dir = %store.base().display(), "snapshot enumerated");

        let mut by_coordinate: BTreeMap<ResourceCoordinate, Vec<StoredObject>> = BTreeMap::new();
        for obj in stored {
            by_coordinate.entry(obj.coordinate.clone()).or_default().push(obj);
        }
        let mut resources: BTreeMap<ResourceCoordinate, (ResolvedResource, Vec<StoredObject>)> = BTreeMap::new();
        for (coordinate, objects) in by_coordinate {
            let kind = match store.kind_of(&coordinate) {
                Ok(Some(kind)) => kind,
                Ok(None) => {
                    let e = CopyError::persistence(store.base(), format!("no kind recorded for {coordinate}"));
                    fail_all(&mut report, &coordinate, objects, e);
                    continue;
                }
                Err(e) => {
                    fail_all(&mut report, &coordinate, objects, e);
                    continue;
                }
            };
            let namespaced = objects.iter().any(|o| o.namespace.is_some());
            report.touch(&coordinate, &kind);
            resources.insert(coordinate.clone(), (ResolvedResource { coordinate, kind, namespaced }, objects));
        }

        let kinds: Vec<&str> = resources.values().map(|(r, _)| r.kind.as_str()).collect();
        let waves = plan_waves(&kinds, self.cfg.order_kinds, &self.table);
        let kind_of: FxHashMap<ResourceCoordinate, String> = resources.iter().map(|(c, (r, _))| (c.clone(), r.kind.clone())).collect();
        let store = Arc::new(store);
        let wave_count = waves.len();

        for (idx, wave) in waves.into_iter().enumerate() {
            report.wave(wave.clone());
            let mut jobs: Vec<(CopyTask, (ResolvedResource, StoredObject))> = Vec::new();
            for (resource, objects) in resources.values().filter(|(r, _)| wave.contains(&r.kind)) {
                for obj in objects {
                    let task = CopyTask::new(resource.coordinate.clone(), obj.namespace.as_deref(), obj.name.clone(), Direction::Upload);
                    jobs.push((task, (resource.clone(), obj.clone())));
                }
            }
            info!(wave = idx, rank = ?wave.rank, kinds = ?wave.kinds, objects = jobs.len(), "uploading wave");

            let (dest, src, call_timeout) = (Arc::clone(&target), Arc::clone(&store), self.cfg.call_timeout);
            let results = self
                .pool
                .run_batch(jobs, move |task, (resource, obj): (ResolvedResource, StoredObject)| {
                    let (dest, src) = (Arc::clone(&dest), Arc::clone(&src));
                    async move {
                        let content = src.read(&obj).await?;
                        let content = prepare_upload(content, task.namespace());
                        with_timeout(call_timeout, dest.apply(&resource, task.namespace(), &content)).await
                    }
                })
                .await;
            let targets = if self.cfg.order_kinds && idx + 1 < wave_count { self.readiness_targets(&resources, &results, &store, &wave).await } else { Vec::new() };
            report.absorb(|c| kind_of.get(c).cloned().unwrap_or_else(|| c.resource.clone()), results);
            if self.cfg.cancel.is_cancelled() {
                report.cancelled();
                continue;
            }
            if targets.is_empty() {
                continue;
            }
            match wait_for_wave(target.as_ref(), targets, &profiles, self.cfg.readiness_timeout, self.cfg.readiness_poll, self.cfg.call_timeout, &self.cfg.cancel).await {
                WaveReadiness::Ready => {}
                WaveReadiness::TimedOut { pending } => {
                    counter!("readiness_timeouts_total", 1u64);
                    warn!(wave = idx, pending = pending.len(), "wave not ready before timeout; continuing");
                    report.warn(format!(
                        "wave {idx} ({}) not ready after {}s: {}",
                        wave.kinds.join(", "),
                        self.cfg.readiness_timeout.as_secs(),
                        pending.join(", ")
                    ));
                }
                WaveReadiness::Cancelled => report.cancelled(),
            }
        }

        let report = report.finish();
        info!(status = %report.status, succeeded = report.succeeded(), failed = report.failed(), waves = wave_count, took_ms = %t0.elapsed().as_millis(), "upload finished");
        Ok(report)
    }

    /// Successfully applied objects of the wave, plus priority classes referenced by stored pods
    /// when the wave carries priority classes.
    async fn readiness_targets(
        &self,
        resources: &BTreeMap<ResourceCoordinate, (ResolvedResource, Vec<StoredObject>)>,
        results: &[CopyResult],
        store: &ObjectStore,
        wave: &kcopy_order::Wave,
    ) -> Vec<ReadinessTarget> {
        let mut targets: Vec<ReadinessTarget> = results
            .iter()
            .filter(|r| r.is_success())
            .filter_map(|r| resources.get(&r.task.coordinate).map(|(res, _)| ReadinessTarget::new(res.clone(), r.task.namespace(), r.task.object_name.clone())))
            .collect();
        if !wave.contains("PriorityClass") {
            return targets;
        }
        let Some((pc, _)) = resources.values().find(|(r, _)| r.kind == "PriorityClass") else { return targets };
        let mut referenced = BTreeSet::new();
        for (_, objects) in resources.values().filter(|(r, _)| r.kind == "Pod") {
            for obj in objects {
                match store.read(obj).await {
                    Ok(pod) => {
                        if let Some(name) = pod.pointer("/spec/priorityClassName").and_then(Json::as_str).filter(|n| !n.is_empty()) {
                            referenced.insert(name.to_string());
                        }
                    }
                    Err(e) => debug!(error = %e, "skipping unreadable pod for priority class references"),
                }
            }
        }
        for name in referenced {
            if !targets.iter().any(|t| t.resource.kind == "PriorityClass" && t.name == name) {
                targets.push(ReadinessTarget::new(pc.clone(), None, name));
            }
        }
        targets
    }
}

/// Every object of a resource whose kind cannot be determined fails without an API call.
fn fail_all(report: &mut ReportBuilder, coordinate: &ResourceCoordinate, objects: Vec<StoredObject>, err: CopyError) {
    warn!(coordinate = %coordinate, error = %err, "resource skipped");
    let results = objects
        .into_iter()
        .map(|o| CopyResult::failure(CopyTask::new(o.coordinate, o.namespace.as_deref(), o.name, Direction::Upload), err.clone()))
        .collect();
    report.absorb(|c| c.resource.clone(), results);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pods() -> ResolvedResource {
        ResolvedResource { coordinate: ResourceCoordinate::new("", "v1", "pods"), kind: "Pod".into(), namespaced: true }
    }

    #[test]
    fn download_shape_sets_type_and_drops_managed_fields() {
        let obj = json!({"metadata": {"name": "a", "namespace": "d", "managedFields": [{"manager": "kubectl"}]}});
        let out = prepare_download(&pods(), obj);
        assert_eq!(out["apiVersion"], "v1");
        assert_eq!(out["kind"], "Pod");
        assert!(out["metadata"].get("managedFields").is_none());
    }

    #[test]
    fn upload_shape_strips_server_fields_and_pins_namespace() {
        let obj = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "a",
                "namespace": "elsewhere",
                "uid": "123",
                "resourceVersion": "9",
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "generation": 2,
                "selfLink": "/api/v1/x",
                "ownerReferences": [{"kind": "ReplicaSet"}],
                "labels": {"app": "web"}
            },
            "spec": {"containers": []}
        });
        let out = prepare_upload(obj, Some("team-a"));
        assert_eq!(out["metadata"], json!({"name": "a", "namespace": "team-a", "labels": {"app": "web"}}));
        assert_eq!(out["spec"], json!({"containers": []}));

        let cluster = prepare_upload(json!({"metadata": {"name": "n", "namespace": "x"}}), None);
        assert!(cluster["metadata"].get("namespace").is_none());
    }

    #[tokio::test]
    async fn timeout_becomes_transport_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, CopyError>(())
        };
        assert!(matches!(with_timeout(Some(Duration::from_millis(10)), slow).await, Err(CopyError::Transport(_))));
        assert_eq!(with_timeout(None, async { Ok::<_, CopyError>(1) }).await, Ok(1));
    }
}
