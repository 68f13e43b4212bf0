//! kcopy kubehub – the API surface: discovery, list, get and server-side apply

#![forbid(unsafe_code)]

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use kcopy_core::{object_name, CopyError, CopyOutcome, DiscoveredResource, ResolvedResource};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, TypeMeta},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, info};

mod memory;

pub use memory::{AppliedCall, MemorySurface};

/// Field manager recorded on every server-side apply.
pub const FIELD_MANAGER: &str = "kcopy";

const LIST_PAGE_SIZE: u32 = 500;
/// Bound on the version request made while connecting.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Capabilities the copy engine needs from a cluster. Safe for concurrent use by all workers.
#[async_trait::async_trait]
pub trait ApiSurface: Send + Sync {
    /// Resource types served by the cluster (incl. CRDs), one entry per group version.
    async fn discover(&self) -> CopyOutcome<Vec<DiscoveredResource>>;

    /// List objects of a resource; `namespace = None` lists across all namespaces.
    async fn list(&self, resource: &ResolvedResource, namespace: Option<&str>) -> CopyOutcome<Vec<Json>>;

    async fn get(&self, resource: &ResolvedResource, namespace: Option<&str>, name: &str) -> CopyOutcome<Option<Json>>;

    /// Create or update an object.
    async fn apply(&self, resource: &ResolvedResource, namespace: Option<&str>, object: &Json) -> CopyOutcome<()>;
}

/// Build a client from an explicit kubeconfig path, or from the default chain when absent.
pub async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("loading kubeconfig {}", path.display()))?;
            Client::try_from(cfg).context("building kube client")
        }
        None => Client::try_default().await.context("building kube client from default config"),
    }
}

/// `ApiSurface` backed by a live cluster through kube-rs dynamic objects.
#[derive(Clone)]
pub struct KubeSurface {
    client: Client,
}

impl KubeSurface {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Build a client and make sure the API server answers before any copy work starts.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let client = kube_client(kubeconfig).await?;
        let version = tokio::time::timeout(CONNECT_TIMEOUT, client.apiserver_version())
            .await
            .with_context(|| format!("API server did not answer within {}s", CONNECT_TIMEOUT.as_secs()))?
            .context("contacting API server")?;
        info!(version = %version.git_version, platform = %version.platform, "connected");
        Ok(Self::new(client))
    }

    fn api(&self, resource: &ResolvedResource, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(resource);
        match namespace {
            Some(ns) if resource.namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn api_resource(resource: &ResolvedResource) -> ApiResource {
    let c = &resource.coordinate;
    ApiResource {
        group: c.group.clone(),
        version: c.version.clone(),
        api_version: c.api_version(),
        kind: resource.kind.clone(),
        plural: c.resource.clone(),
    }
}

fn transport(e: kube::Error) -> CopyError { CopyError::Transport(e.to_string()) }

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// List items come without `apiVersion`/`kind`; restore them so stored objects can be re-applied.
fn to_json(resource: &ResolvedResource, mut obj: DynamicObject) -> CopyOutcome<Json> {
    obj.types = Some(TypeMeta { api_version: resource.coordinate.api_version(), kind: resource.kind.clone() });
    let mut raw = serde_json::to_value(&obj).map_err(|e| CopyError::Internal(format!("serializing DynamicObject: {e}")))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

#[async_trait::async_trait]
impl ApiSurface for KubeSurface {
    async fn discover(&self) -> CopyOutcome<Vec<DiscoveredResource>> {
        let t0 = Instant::now();
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(transport)?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            let preferred = group.preferred_version_or_latest().to_string();
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    out.push(DiscoveredResource {
                        group: ar.group.clone(),
                        version: ar.version.clone(),
                        resource: ar.plural.clone(),
                        kind: ar.kind.clone(),
                        namespaced: matches!(caps.scope, Scope::Namespaced),
                        preferred: ar.version == preferred,
                    });
                }
            }
        }
        // Stable-ish order
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.resource.cmp(&b.resource)));
        info!(count = out.len(), took_ms = %t0.elapsed().as_millis(), "discovery done");
        Ok(out)
    }

    async fn list(&self, resource: &ResolvedResource, namespace: Option<&str>) -> CopyOutcome<Vec<Json>> {
        let t0 = Instant::now();
        let api = self.api(resource, namespace);
        let mut lp = ListParams::default().limit(LIST_PAGE_SIZE);
        let mut out = Vec::new();
        loop {
            let page = api.list(&lp).await.map_err(transport)?;
            for obj in page.items {
                out.push(to_json(resource, obj)?);
            }
            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => lp = lp.continue_token(&token),
                _ => break,
            }
        }
        histogram!("kube_list_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(coordinate = %resource.coordinate, count = out.len(), "listed");
        Ok(out)
    }

    async fn get(&self, resource: &ResolvedResource, namespace: Option<&str>, name: &str) -> CopyOutcome<Option<Json>> {
        let api = self.api(resource, namespace);
        match api.get_opt(name).await.map_err(transport)? {
            Some(obj) => Ok(Some(to_json(resource, obj)?)),
            None => Ok(None),
        }
    }

    async fn apply(&self, resource: &ResolvedResource, namespace: Option<&str>, object: &Json) -> CopyOutcome<()> {
        let name = object_name(object).ok_or_else(|| CopyError::Internal("object missing metadata.name".into()))?;
        let api = self.api(resource, namespace);
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        match api.patch(name, &pp, &Patch::Apply(object)).await {
            Ok(_) => {
                counter!("kube_apply_ok", 1u64);
                Ok(())
            }
            Err(e) => {
                counter!("kube_apply_err", 1u64);
                Err(CopyError::Transport(format!("server-side apply failed: {e}")))
            }
        }
    }
}
