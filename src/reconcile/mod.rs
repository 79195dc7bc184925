//! Reconciliation driver
//!
//! Generic, idempotent create-or-update for any namespaced object:
//!
//! 1. read the live object
//! 2. absent: create the desired object as is
//! 3. present: refuse if another owner holds it, otherwise let the comparer
//!    decide whether (and what) to write back
//!
//! Plus the inverse, [`remove_if_owned`], which only ever deletes objects the
//! caller owns. Nothing here retries: API errors surface unchanged and the
//! controller re-drives the whole pass.

pub mod comparer;
pub mod ownership;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt::Debug;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::Error;

pub use comparer::{Comparer, Comparison};
pub use ownership::is_owner;

/// What [`reconcile`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The object did not exist and was created
    Created,
    /// The object existed, differed, and was replaced
    Updated,
    /// The object already matched
    Unchanged,
}

/// What [`remove_if_owned`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The object was owned and has been deleted
    Deleted,
    /// There was nothing to delete
    Absent,
    /// The object exists but belongs to someone else; left untouched
    NotOwned,
}

/// Namespaced object access, one trait object per kind
///
/// Production code uses [`KubeObjectClient`]; tests substitute an in-memory
/// store.
#[async_trait]
pub trait ObjectClient<K>: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>;

    /// List the objects of a namespace matching a label selector (`k=v,k2=v2`)
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, Error>;

    /// Create an object
    async fn create(&self, namespace: &str, object: &K) -> Result<K, Error>;

    /// Replace an object, subject to its `resourceVersion`
    async fn replace(&self, namespace: &str, name: &str, object: &K) -> Result<K, Error>;

    /// Delete an object
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`ObjectClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeObjectClient {
    client: Client,
}

impl KubeObjectClient {
    /// Wrap a kube client
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
impl<K> ObjectClient<K> for KubeObjectClient
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
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, Error> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, Error> {
        Ok(self
            .api::<K>(namespace)
            .create(&PostParams::default(), object)
            .await?)
    }

    async fn replace(&self, namespace: &str, name: &str, object: &K) -> Result<K, Error> {
        Ok(self
            .api::<K>(namespace)
            .replace(name, &PostParams::default(), object)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            // Already gone between our read and the delete
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Create or update `desired` at `namespace/name`
///
/// Fails with [`Error::OwnershipConflict`] when `desired` names an owner and
/// the live object is owned by somebody else. `desired` is never mutated.
pub async fn reconcile<K, C>(
    client: &dyn ObjectClient<K>,
    namespace: &str,
    name: &str,
    desired: &K,
    comparer: &C,
) -> Result<ReconcileOutcome, Error>
where
    K: Resource<DynamicType = ()> + Send + Sync,
    C: Comparer<K> + ?Sized,
{
    let kind = K::kind(&());

    let Some(observed) = client.get(namespace, name).await? else {
        info!(%kind, %namespace, %name, "creating");
        client.create(namespace, desired).await?;
        return Ok(ReconcileOutcome::Created);
    };

    if ownership::conflicts(desired.meta(), observed.meta()) {
        return Err(Error::ownership_conflict(kind.to_string(), namespace, name));
    }

    match comparer.compare(desired, &observed)? {
        Comparison::Equal => {
            debug!(%kind, %namespace, %name, "unchanged");
            Ok(ReconcileOutcome::Unchanged)
        }
        Comparison::Differs(updated) => {
            info!(%kind, %namespace, %name, "updating");
            client.replace(namespace, name, &updated).await?;
            Ok(ReconcileOutcome::Updated)
        }
    }
}

/// Delete `namespace/name` if it exists and `owner_uid` owns it
pub async fn remove_if_owned<K>(
    client: &dyn ObjectClient<K>,
    namespace: &str,
    name: &str,
    owner_uid: &str,
) -> Result<RemoveOutcome, Error>
where
    K: Resource<DynamicType = ()> + Send + Sync,
{
    let kind = K::kind(&());

    let Some(observed) = client.get(namespace, name).await? else {
        return Ok(RemoveOutcome::Absent);
    };

    if !is_owner(observed.meta(), owner_uid) {
        debug!(%kind, %namespace, %name, "not owned, leaving in place");
        return Ok(RemoveOutcome::NotOwned);
    }

    info!(%kind, %namespace, %name, "deleting");
    client.delete(namespace, name).await?;
    Ok(RemoveOutcome::Deleted)
}
