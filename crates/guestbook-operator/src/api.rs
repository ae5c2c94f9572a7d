//! Kubernetes API access for the reconciler
//!
//! The reconciliation loop talks to the cluster exclusively through the
//! traits in this module. Production wires in the kube-backed
//! implementations; tests mock the traits to drive the loop against
//! scripted cluster state.

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::GuestbookApp;
use crate::error::{is_conflict, OperatorError, Result};

/// Field manager name used for server-side apply
pub const FIELD_MANAGER: &str = "guestbook-operator";

/// Typed CRUD surface for one managed resource kind
///
/// `find` maps "not found" into `None`, so callers consume lookups through a
/// single match over found / absent / error instead of re-classifying API
/// errors per kind.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceOps<K: Send + Sync + 'static>: Send + Sync {
    /// Look up a resource by name, mapping 404 to `None`
    async fn find(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Create a resource from the given descriptor
    async fn create(&self, namespace: &str, resource: &K) -> Result<K>;

    /// Server-side apply a rebuilt descriptor onto an existing resource
    async fn apply(&self, namespace: &str, name: &str, resource: &K) -> Result<K>;
}

/// Read/status-write surface for the desired-state object itself
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppOps: Send + Sync {
    /// Fetch the current GuestbookApp, mapping 404 to `None`
    async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<GuestbookApp>>;

    /// Replace the status subresource, using the object's resourceVersion
    /// for optimistic concurrency; a conflict surfaces as
    /// [`OperatorError::StatusConflict`]
    async fn replace_status(&self, namespace: &str, app: &GuestbookApp) -> Result<GuestbookApp>;
}

/// Kube-client backed [`ResourceOps`] implementation
pub struct KubeOps {
    client: Client,
}

impl KubeOps {
    /// Create a new KubeOps wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ResourceOps<K> for KubeOps
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn find(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, resource: &K) -> Result<K> {
        Ok(self
            .api::<K>(namespace)
            .create(&PostParams::default(), resource)
            .await?)
    }

    async fn apply(&self, namespace: &str, name: &str, resource: &K) -> Result<K> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        Ok(self
            .api::<K>(namespace)
            .patch(name, &params, &Patch::Apply(resource))
            .await?)
    }
}

/// Kube-client backed [`AppOps`] implementation
pub struct KubeAppOps {
    client: Client,
}

impl KubeAppOps {
    /// Create a new KubeAppOps wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<GuestbookApp> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl AppOps for KubeAppOps {
    async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<GuestbookApp>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn replace_status(&self, namespace: &str, app: &GuestbookApp) -> Result<GuestbookApp> {
        let name = app.name_any();
        let data = serde_json::to_vec(app)?;
        self.api(namespace)
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|err| {
                if is_conflict(&err) {
                    OperatorError::StatusConflict {
                        name: name.clone(),
                        message: err.to_string(),
                    }
                } else {
                    err.into()
                }
            })
    }
}
