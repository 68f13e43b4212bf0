//! Readiness checks between upload waves.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use kcopy_core::ResolvedResource;
use kcopy_kubehub::ApiSurface;
use serde_json::Value as Json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::scheduler::SchedulerProfiles;
use crate::with_timeout;

const READINESS_CHECKS: usize = 16;

/// An object that has to be ready in the destination before the next wave starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessTarget {
    pub resource: ResolvedResource,
    pub namespace: Option<String>,
    pub name: String,
}

impl ReadinessTarget {
    pub fn new(resource: ResolvedResource, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { resource, namespace: namespace.map(str::to_string), name: name.into() }
    }

    fn label(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{} {}/{}", self.resource.kind, ns, self.name),
            None => format!("{} {}", self.resource.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaveReadiness {
    Ready,
    TimedOut { pending: Vec<String> },
    Cancelled,
}

fn phase(obj: &Json) -> Option<&str> { obj.pointer("/status/phase").and_then(Json::as_str) }

fn has_condition(obj: &Json, type_: &str, status: &str) -> bool {
    obj.pointer("/status/conditions")
        .and_then(Json::as_array)
        .map_or(false, |cs| cs.iter().any(|c| c.get("type").and_then(Json::as_str) == Some(type_) && c.get("status").and_then(Json::as_str) == Some(status)))
}

/// Whether a live object of `kind` counts as ready. Presence is implied by having `obj`.
pub fn is_ready(kind: &str, obj: &Json, profiles: &SchedulerProfiles) -> bool {
    match kind {
        "Namespace" => matches!(phase(obj), None | Some("Active")),
        "CustomResourceDefinition" => has_condition(obj, "Established", "True"),
        "PersistentVolumeClaim" => phase(obj) == Some("Bound"),
        "PersistentVolume" => matches!(phase(obj), Some("Bound" | "Available")),
        "Pod" => {
            let scheduler = obj.pointer("/spec/schedulerName").and_then(Json::as_str);
            !profiles.schedules(scheduler) || obj.pointer("/spec/nodeName").and_then(Json::as_str).map_or(false, |n| !n.is_empty())
        }
        _ => true,
    }
}

async fn check(surface: &dyn ApiSurface, target: &ReadinessTarget, profiles: &SchedulerProfiles, call_timeout: Option<Duration>) -> bool {
    match with_timeout(call_timeout, surface.get(&target.resource, target.namespace.as_deref(), &target.name)).await {
        Ok(Some(obj)) => is_ready(&target.resource.kind, &obj, profiles),
        Ok(None) => false,
        Err(e) => {
            debug!(object = %target.label(), error = %e, "readiness check failed");
            false
        }
    }
}

/// Poll every `poll` until all targets are ready, `timeout` elapses or the run is cancelled.
pub async fn wait_for_wave(
    surface: &dyn ApiSurface,
    targets: Vec<ReadinessTarget>,
    profiles: &SchedulerProfiles,
    timeout: Duration,
    poll: Duration,
    call_timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> WaveReadiness {
    let deadline = Instant::now() + timeout;
    let mut pending = targets;
    let total = pending.len();
    loop {
        if cancel.is_cancelled() {
            return WaveReadiness::Cancelled;
        }
        let checked: Vec<(ReadinessTarget, bool)> = stream::iter(pending)
            .map(move |t| async move {
                let ready = check(surface, &t, profiles, call_timeout).await;
                (t, ready)
            })
            .buffer_unordered(READINESS_CHECKS)
            .collect()
            .await;
        pending = checked.into_iter().filter(|(_, ready)| !ready).map(|(t, _)| t).collect();
        if pending.is_empty() {
            info!(objects = total, "wave ready");
            return WaveReadiness::Ready;
        }
        let now = Instant::now();
        if now >= deadline {
            let mut labels: Vec<String> = pending.iter().map(ReadinessTarget::label).collect();
            labels.sort();
            return WaveReadiness::TimedOut { pending: labels };
        }
        debug!(pending = pending.len(), total, "waiting for wave readiness");
        tokio::select! {
            _ = cancel.cancelled() => return WaveReadiness::Cancelled,
            _ = tokio::time::sleep(poll.min(deadline - now)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcopy_core::ResourceCoordinate;
    use kcopy_kubehub::MemorySurface;
    use serde_json::json;

    fn profiles() -> SchedulerProfiles { SchedulerProfiles::parse("profiles:\n  - schedulerName: default-scheduler\n").unwrap() }

    #[test]
    fn readiness_by_kind() {
        let p = profiles();
        assert!(is_ready("Namespace", &json!({"metadata": {"name": "a"}}), &p));
        assert!(!is_ready("Namespace", &json!({"status": {"phase": "Terminating"}}), &p));
        assert!(!is_ready("CustomResourceDefinition", &json!({"status": {}}), &p));
        assert!(is_ready(
            "CustomResourceDefinition",
            &json!({"status": {"conditions": [{"type": "NamesAccepted", "status": "True"}, {"type": "Established", "status": "True"}]}}),
            &p
        ));
        assert!(!is_ready("PersistentVolumeClaim", &json!({"status": {"phase": "Pending"}}), &p));
        assert!(is_ready("PersistentVolume", &json!({"status": {"phase": "Available"}}), &p));
        assert!(is_ready("ConfigMap", &json!({}), &p));
    }

    #[test]
    fn pods_wait_for_binding_only_under_known_profiles() {
        let p = profiles();
        let unbound = json!({"spec": {"containers": []}});
        assert!(!is_ready("Pod", &unbound, &p));
        assert!(is_ready("Pod", &json!({"spec": {"nodeName": "n1"}}), &p));
        assert!(is_ready("Pod", &json!({"spec": {"schedulerName": "custom"}}), &p));
        assert!(is_ready("Pod", &unbound, &SchedulerProfiles::default()));
    }

    fn namespaces() -> ResolvedResource {
        ResolvedResource { coordinate: ResourceCoordinate::new("", "v1", "namespaces"), kind: "Namespace".into(), namespaced: false }
    }

    #[tokio::test]
    async fn present_objects_are_ready() {
        let s = MemorySurface::new(vec![]);
        s.insert(&namespaces().coordinate, json!({"metadata": {"name": "team-a"}}));
        let out = wait_for_wave(
            &s,
            vec![ReadinessTarget::new(namespaces(), None, "team-a")],
            &SchedulerProfiles::default(),
            Duration::from_secs(1),
            Duration::from_millis(10),
            None,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(out, WaveReadiness::Ready);
    }

    #[tokio::test]
    async fn missing_objects_time_out() {
        let s = MemorySurface::new(vec![]);
        let out = wait_for_wave(
            &s,
            vec![ReadinessTarget::new(namespaces(), None, "ghost")],
            &SchedulerProfiles::default(),
            Duration::from_millis(50),
            Duration::from_millis(10),
            None,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(out, WaveReadiness::TimedOut { pending: vec!["Namespace ghost".into()] });
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let s = MemorySurface::new(vec![]);
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });
        let out = wait_for_wave(
            &s,
            vec![ReadinessTarget::new(namespaces(), None, "ghost")],
            &SchedulerProfiles::default(),
            Duration::from_secs(30),
            Duration::from_millis(5),
            None,
            &cancel,
        )
        .await;
        assert_eq!(out, WaveReadiness::Cancelled);
    }
}
