//! Read access to the resources bindings point at

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DynamicObject};
use kube::core::ApiResource;
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Trait abstracting reads of binding sources
///
/// A missing object surfaces as the API's 404, which the controller treats
/// as transient: backing services often publish their secrets some time
/// after the Nuxeo resource is created.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceReader: Send + Sync {
    /// Read a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, Error>;

    /// Read a ConfigMap
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, Error>;

    /// Read any other namespaced object through the dynamic API
    async fn get_dynamic(
        &self,
        namespace: &str,
        name: &str,
        resource: &ApiResource,
    ) -> Result<DynamicObject, Error>;
}

/// Real Kubernetes reader
pub struct KubeResourceReader {
    client: Client,
}

impl KubeResourceReader {
    /// Create a new KubeResourceReader wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceReader for KubeResourceReader {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_dynamic(
        &self,
        namespace: &str,
        name: &str,
        resource: &ApiResource,
    ) -> Result<DynamicObject, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, resource);
        Ok(api.get(name).await?)
    }
}
