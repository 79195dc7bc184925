//! In-memory [`ObjectClient`] for driver and controller tests
//!
//! Behaves like the API server where the driver can tell the difference:
//! creates fail on existing names, replaces check `resourceVersion`, and
//! every write bumps the version.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::error::ErrorResponse;
use kube::Resource;

use super::ObjectClient;
use crate::Error;

pub(crate) struct MemoryClient<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    writes: AtomicUsize,
    read_error: Mutex<Option<u16>>,
}

impl<K> Default for MemoryClient<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            writes: AtomicUsize::new(0),
            read_error: Mutex::new(None),
        }
    }
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube {
        source: kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message,
            reason: reason.to_string(),
            code,
        }),
    }
}

fn bump(version: Option<&str>) -> String {
    let current: u64 = version.and_then(|v| v.parse().ok()).unwrap_or(0);
    (current + 1).to_string()
}

impl<K> MemoryClient<K>
where
    K: Resource + Clone,
{
    /// Seed an object without counting it as a write
    pub(crate) fn insert(&self, namespace: &str, mut object: K) {
        let name = object.meta().name.clone().unwrap_or_default();
        object.meta_mut().resource_version = Some("1".to_string());
        self.objects
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name), object);
    }

    pub(crate) fn stored(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_reads_with(&self, code: u16) {
        *self.read_error.lock().unwrap() = Some(code);
    }
}

#[async_trait]
impl<K> ObjectClient<K> for MemoryClient<K>
where
    K: Resource + Clone + Send + Sync,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        if let Some(code) = *self.read_error.lock().unwrap() {
            return Err(api_error(code, "Injected", "injected read failure".to_string()));
        }
        Ok(self.stored(namespace, name))
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, Error> {
        if let Some(code) = *self.read_error.lock().unwrap() {
            return Err(api_error(code, "Injected", "injected read failure".to_string()));
        }
        let wanted: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, object)| object)
            .filter(|object| {
                let labels = object.meta().labels.clone().unwrap_or_default();
                wanted
                    .iter()
                    .all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v))
            })
            .cloned()
            .collect())
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, Error> {
        let name = object.meta().name.clone().unwrap_or_default();
        let mut objects = self.objects.lock().unwrap();
        let key = (namespace.to_string(), name.clone());
        if objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{} already exists", name)));
        }
        let mut created = object.clone();
        created.meta_mut().resource_version = Some("1".to_string());
        objects.insert(key, created.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn replace(&self, namespace: &str, name: &str, object: &K) -> Result<K, Error> {
        let mut objects = self.objects.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let Some(current) = objects.get(&key) else {
            return Err(api_error(404, "NotFound", format!("{} not found", name)));
        };
        if current.meta().resource_version != object.meta().resource_version {
            return Err(api_error(409, "Conflict", "resourceVersion mismatch".to_string()));
        }
        let mut replaced = object.clone();
        replaced.meta_mut().resource_version =
            Some(bump(current.meta().resource_version.as_deref()));
        objects.insert(key, replaced.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(replaced)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let removed = self
            .objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        if removed.is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
