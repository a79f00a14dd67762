//! Kubernetes-backed resolver and collection handles.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use kube::{
    api::{Api, ListParams, PostParams, WatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use tracing::{debug, info};
use watt_core::{ListResult, Resource, ResourceInfo, Selector, WatchEvent, WattError, WattResult};

use crate::{resolve_in, Collection, Connector, ResourceResolver, WatchStream, MAX_WATCH_TIMEOUT_SECS};

const LIST_PAGE_SIZE: u32 = 500;

fn connection_failure(e: kube::Error) -> WattError {
    WattError::ConnectionFailure(e.to_string())
}

fn rejected(e: kube::Error) -> WattError {
    match e {
        kube::Error::Api(ae) => WattError::RemoteRejected(format!("{} {}: {}", ae.code, ae.reason, ae.message)),
        other => WattError::RemoteRejected(other.to_string()),
    }
}

/// Shape an API object into a stored [`Resource`].
fn shape(obj: &DynamicObject, info: &ResourceInfo) -> WattResult<Resource> {
    let raw = serde_json::to_value(obj).map_err(|e| WattError::Invalid(format!("serializing DynamicObject: {e}")))?;
    let mut res = Resource::try_from(raw)?;
    res.fill_type_meta(info);
    if cfg!(feature = "strip-managed-fields") {
        res.strip_managed_fields();
    }
    Ok(res)
}

/// Resolver and connector for one cluster, built from API discovery.
pub struct KubeHub {
    client: Client,
    resources: Vec<ResourceInfo>,
}

impl KubeHub {
    /// Connect with the default kubeconfig / in-cluster config and run discovery.
    pub async fn connect() -> WattResult<Self> {
        let client = Client::try_default().await.map_err(connection_failure)?;
        Self::discover(client).await
    }

    /// Discover served resources (incl. CRDs). Core group first, then by group name.
    pub async fn discover(client: Client) -> WattResult<Self> {
        let t0 = Instant::now();
        let discovery = Discovery::new(client.clone()).run().await.map_err(connection_failure)?;
        let mut resources = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                resources.push(ResourceInfo {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    plural: ar.plural.clone(),
                    kind: ar.kind.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                });
            }
        }
        resources.sort_by(|a, b| {
            (!a.group.is_empty()).cmp(&!b.group.is_empty()).then(a.group.cmp(&b.group)).then(a.plural.cmp(&b.plural))
        });
        info!(count = resources.len(), took_ms = %t0.elapsed().as_millis(), "kubehub: discovery ok");
        Ok(Self { client, resources })
    }
}

impl ResourceResolver for KubeHub {
    fn resolve(&self, kind: &str) -> WattResult<ResourceInfo> {
        resolve_in(&self.resources, kind)
    }
}

impl Connector for KubeHub {
    fn collection(&self, info: &ResourceInfo, namespace: &str, selector: &Selector)
        -> WattResult<Arc<dyn Collection>> {
        Ok(Arc::new(KubeCollection::new(self.client.clone(), info.clone(), namespace, selector.clone())))
    }
}

/// `Api<DynamicObject>` wrapper bound to one collection and optional namespace.
pub struct KubeCollection {
    client: Client,
    info: ResourceInfo,
    ar: ApiResource,
    api: Api<DynamicObject>,
    selector: Selector,
}

impl KubeCollection {
    pub fn new(client: Client, info: ResourceInfo, namespace: &str, selector: Selector) -> Self {
        let ar = ApiResource {
            group: info.group.clone(),
            version: info.version.clone(),
            api_version: info.api_version(),
            kind: info.kind.clone(),
            plural: info.plural.clone(),
        };
        let api = if info.namespaced && !namespace.is_empty() {
            Api::namespaced_with(client.clone(), namespace, &ar)
        } else {
            Api::all_with(client.clone(), &ar)
        };
        Self { client, info, ar, api, selector }
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default().limit(LIST_PAGE_SIZE);
        if let Some(f) = &self.selector.fields {
            lp = lp.fields(f);
        }
        if let Some(l) = &self.selector.labels {
            lp = lp.labels(l);
        }
        lp
    }

    fn watch_params(&self, timeout_secs: u32) -> WatchParams {
        let mut wp = WatchParams::default().timeout(timeout_secs.min(MAX_WATCH_TIMEOUT_SECS));
        if let Some(f) = &self.selector.fields {
            wp = wp.fields(f);
        }
        if let Some(l) = &self.selector.labels {
            wp = wp.labels(l);
        }
        wp
    }
}

#[async_trait::async_trait]
impl Collection for KubeCollection {
    async fn list(&self) -> WattResult<ListResult> {
        let mut out = ListResult::default();
        let mut lp = self.list_params();
        loop {
            let page = self.api.list(&lp).await.map_err(connection_failure)?;
            for obj in &page.items {
                out.items.push(shape(obj, &self.info)?);
            }
            if let Some(rv) = page.metadata.resource_version {
                out.resource_version = rv;
            }
            match page.metadata.continue_.filter(|c| !c.is_empty()) {
                Some(token) => lp = lp.continue_token(&token),
                None => break,
            }
        }
        debug!(plural = %self.info.plural, items = out.items.len(), rv = %out.resource_version, "kubehub: list ok");
        Ok(out)
    }

    async fn watch(&self, resource_version: &str, timeout_secs: u32) -> WattResult<WatchStream> {
        let wp = self.watch_params(timeout_secs);
        let stream = self.api.watch(&wp, resource_version).await.map_err(connection_failure)?;
        let info = self.info.clone();
        Ok(stream
            .map(move |ev| match ev {
                Ok(kube::api::WatchEvent::Added(o)) => shape(&o, &info).map(WatchEvent::added),
                Ok(kube::api::WatchEvent::Modified(o)) => shape(&o, &info).map(WatchEvent::modified),
                Ok(kube::api::WatchEvent::Deleted(o)) => shape(&o, &info).map(WatchEvent::deleted),
                Ok(kube::api::WatchEvent::Bookmark(b)) => {
                    Ok(WatchEvent::Bookmark { resource_version: b.metadata.resource_version })
                }
                Ok(kube::api::WatchEvent::Error(e)) => {
                    Err(WattError::ConnectionFailure(format!("watch error {} {}: {}", e.code, e.reason, e.message)))
                }
                Err(e) => Err(connection_failure(e)),
            })
            .boxed())
    }

    async fn update_status(&self, resource: &Resource) -> WattResult<Resource> {
        let api: Api<DynamicObject> = if self.info.namespaced {
            let ns = if resource.namespace().is_empty() { watt_core::names::DEFAULT_NAMESPACE } else { resource.namespace() };
            Api::namespaced_with(self.client.clone(), ns, &self.ar)
        } else {
            Api::all_with(self.client.clone(), &self.ar)
        };
        let body = serde_json::to_vec(resource).map_err(|e| WattError::Invalid(e.to_string()))?;
        let updated = api.replace_status(resource.name(), &PostParams::default(), body).await.map_err(rejected)?;
        shape(&updated, &self.info)
    }
}
