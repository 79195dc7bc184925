//! Comparers: semantic equality between desired and observed objects
//!
//! A comparer answers "is the live object already what we want?" and, when it
//! isn't, returns the live object with the desired state applied. Starting
//! from the observed copy keeps `resourceVersion` (optimistic concurrency) and
//! every field the platform owns: cluster IPs, allocated node ports, revision
//! annotations, server-side defaults.
//!
//! Spec comparisons use JSON containment: the desired spec, serialized, must be
//! a subset of the observed spec. Fields the operator never sets do not cause
//! diffs, so server defaulting cannot trigger an update loop.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use serde_json::Value;

use crate::Error;

/// Outcome of comparing desired with observed
#[derive(Clone, Debug, PartialEq)]
pub enum Comparison<K> {
    /// Observed already matches desired
    Equal,
    /// Observed differs; the payload is observed with desired applied
    Differs(K),
}

/// Decides equality between a desired and an observed object
pub trait Comparer<K>: Send + Sync {
    /// Compare, returning the object to write back when they differ
    fn compare(&self, desired: &K, observed: &K) -> Result<Comparison<K>, Error>;
}

// =============================================================================
// Metadata
// =============================================================================

/// Labels and owner references the desired object needs on the live one
///
/// Returns true when `observed` was changed.
fn apply_meta(desired: &ObjectMeta, observed: &mut ObjectMeta) -> bool {
    let mut changed = false;

    if let Some(labels) = &desired.labels {
        let live = observed.labels.get_or_insert_with(BTreeMap::new);
        for (k, v) in labels {
            if live.get(k) != Some(v) {
                live.insert(k.clone(), v.clone());
                changed = true;
            }
        }
    }

    if let Some(refs) = &desired.owner_references {
        let live = observed.owner_references.get_or_insert_with(Vec::new);
        for r in refs {
            if !live.iter().any(|l| l.uid == r.uid) {
                live.push(r.clone());
                changed = true;
            }
        }
    }

    changed
}

// =============================================================================
// JSON containment
// =============================================================================

fn to_value<T: Serialize>(kind: &str, value: &T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

/// True when every field set in `desired` has the same value in `observed`
///
/// Arrays must have the same length and match element-wise, so removing an
/// entry from a desired list is still detected.
pub fn is_subset(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Object(d), Value::Object(o)) => d.iter().all(|(k, dv)| match o.get(k) {
            Some(ov) => is_subset(dv, ov),
            None => dv.is_null() || is_empty_container(dv),
        }),
        (Value::Array(d), Value::Array(o)) => {
            d.len() == o.len() && d.iter().zip(o).all(|(dv, ov)| is_subset(dv, ov))
        }
        (Value::Null, _) => true,
        (d, o) => d == o,
    }
}

// The API server drops empty maps and lists on write
fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Pod template lists the operator owns outright
///
/// Unset in the desired spec means empty, so dropping the last entry is still
/// a difference. Server defaults live inside the entries, never as extra
/// entries, so containment keeps ignoring them.
fn with_owned_lists(mut spec: Value) -> Value {
    if let Some(pod) = spec
        .pointer_mut("/template/spec")
        .and_then(Value::as_object_mut)
    {
        pod.entry("volumes").or_insert_with(|| Value::Array(Vec::new()));
        for field in ["containers", "initContainers"] {
            let containers = pod.get_mut(field).and_then(Value::as_array_mut);
            for container in containers.into_iter().flatten() {
                if let Some(container) = container.as_object_mut() {
                    for list in ["env", "envFrom", "volumeMounts"] {
                        container
                            .entry(list)
                            .or_insert_with(|| Value::Array(Vec::new()));
                    }
                }
            }
        }
    }
    spec
}

// =============================================================================
// Comparers
// =============================================================================

/// Deployments: spec containment plus labels and owners
///
/// Volumes, env vars and mounts of the pod template are compared as whole
/// lists, so a removed binding leaves no trace on the live object.
///
/// On difference the whole desired spec replaces the observed one; the API
/// server re-applies its defaults. Observed metadata (revision annotations
/// included) is kept.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeploymentComparer;

impl Comparer<Deployment> for DeploymentComparer {
    fn compare(
        &self,
        desired: &Deployment,
        observed: &Deployment,
    ) -> Result<Comparison<Deployment>, Error> {
        let mut updated = observed.clone();
        let meta_changed = apply_meta(&desired.metadata, &mut updated.metadata);

        let spec_equal = is_subset(
            &with_owned_lists(to_value("Deployment", &desired.spec)?),
            &to_value("Deployment", &observed.spec)?,
        );
        if !spec_equal {
            updated.spec = desired.spec.clone();
        }

        Ok(if meta_changed || !spec_equal {
            Comparison::Differs(updated)
        } else {
            Comparison::Equal
        })
    }
}

/// Services: spec containment, keeping allocated IPs and node ports
#[derive(Clone, Copy, Debug, Default)]
pub struct ServiceComparer;

impl Comparer<Service> for ServiceComparer {
    fn compare(&self, desired: &Service, observed: &Service) -> Result<Comparison<Service>, Error> {
        let mut updated = observed.clone();
        let meta_changed = apply_meta(&desired.metadata, &mut updated.metadata);

        let spec_equal = is_subset(
            &to_value("Service", &desired.spec)?,
            &to_value("Service", &observed.spec)?,
        );
        if !spec_equal {
            let mut spec = desired.spec.clone().unwrap_or_default();
            if let Some(live) = &observed.spec {
                spec.cluster_ip = live.cluster_ip.clone();
                spec.cluster_ips = live.cluster_ips.clone();
                spec.health_check_node_port = spec
                    .health_check_node_port
                    .or(live.health_check_node_port);
                for port in spec.ports.iter_mut().flatten() {
                    if port.node_port.is_some() {
                        continue;
                    }
                    port.node_port = live
                        .ports
                        .iter()
                        .flatten()
                        .find(|p| p.name == port.name && p.port == port.port)
                        .and_then(|p| p.node_port);
                }
            }
            updated.spec = Some(spec);
        }

        Ok(if meta_changed || !spec_equal {
            Comparison::Differs(updated)
        } else {
            Comparison::Equal
        })
    }
}

/// Secrets: exact data equality
///
/// Stale keys are removed, so a projection dropped from the Nuxeo resource
/// also disappears from the secondary secret.
#[derive(Clone, Copy, Debug, Default)]
pub struct SecretComparer;

impl Comparer<Secret> for SecretComparer {
    fn compare(&self, desired: &Secret, observed: &Secret) -> Result<Comparison<Secret>, Error> {
        let mut updated = observed.clone();
        let meta_changed = apply_meta(&desired.metadata, &mut updated.metadata);

        let data_equal = non_empty(&desired.data) == non_empty(&observed.data)
            && desired.type_ == observed.type_;
        if !data_equal {
            updated.data = desired.data.clone();
            updated.type_ = desired.type_.clone();
        }

        Ok(if meta_changed || !data_equal {
            Comparison::Differs(updated)
        } else {
            Comparison::Equal
        })
    }
}

/// ConfigMaps: exact data and binaryData equality
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigMapComparer;

impl Comparer<ConfigMap> for ConfigMapComparer {
    fn compare(
        &self,
        desired: &ConfigMap,
        observed: &ConfigMap,
    ) -> Result<Comparison<ConfigMap>, Error> {
        let mut updated = observed.clone();
        let meta_changed = apply_meta(&desired.metadata, &mut updated.metadata);

        let data_equal = non_empty(&desired.data) == non_empty(&observed.data)
            && non_empty(&desired.binary_data) == non_empty(&observed.binary_data);
        if !data_equal {
            updated.data = desired.data.clone();
            updated.binary_data = desired.binary_data.clone();
        }

        Ok(if meta_changed || !data_equal {
            Comparison::Differs(updated)
        } else {
            Comparison::Equal
        })
    }
}

fn non_empty<V>(map: &Option<BTreeMap<String, V>>) -> Option<&BTreeMap<String, V>> {
    map.as_ref().filter(|m| !m.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::ownership::owned_by;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{
        Container, EnvVar, PodSpec, PodTemplateSpec, ServicePort, ServiceSpec, Volume, VolumeMount,
    };
    use k8s_openapi::ByteString;
    use serde_json::json;

    fn secret(data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: owned_by(&["uid-1"]),
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_subset_ignores_server_defaults() {
        let desired = json!({"replicas": 2, "template": {"spec": {"containers": [{"name": "nuxeo"}]}}});
        let observed = json!({
            "replicas": 2,
            "revisionHistoryLimit": 10,
            "template": {"spec": {
                "containers": [{"name": "nuxeo", "imagePullPolicy": "IfNotPresent"}],
                "dnsPolicy": "ClusterFirst"
            }}
        });
        assert!(is_subset(&desired, &observed));
        assert!(!is_subset(&observed, &desired));
    }

    #[test]
    fn test_subset_detects_removed_list_entries() {
        let desired = json!({"env": [{"name": "A"}]});
        let observed = json!({"env": [{"name": "A"}, {"name": "B"}]});
        assert!(!is_subset(&desired, &observed));
    }

    #[test]
    fn test_subset_treats_empty_containers_as_absent() {
        assert!(is_subset(&json!({"labels": {}, "items": []}), &json!({})));
        assert!(!is_subset(&json!({"labels": {"a": "b"}}), &json!({})));
    }

    #[test]
    fn test_deployment_comparer_keeps_observed_metadata() {
        let desired = Deployment {
            metadata: owned_by(&["uid-1"]),
            spec: Some(DeploymentSpec {
                replicas: Some(3),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut observed = desired.clone();
        observed.metadata.resource_version = Some("42".to_string());
        observed.metadata.annotations = Some(BTreeMap::from([(
            "deployment.kubernetes.io/revision".to_string(),
            "7".to_string(),
        )]));
        observed.spec.as_mut().unwrap().revision_history_limit = Some(10);

        assert_eq!(
            DeploymentComparer.compare(&desired, &observed).unwrap(),
            Comparison::Equal
        );

        observed.spec.as_mut().unwrap().replicas = Some(1);
        match DeploymentComparer.compare(&desired, &observed).unwrap() {
            Comparison::Differs(updated) => {
                assert_eq!(updated.spec.unwrap().replicas, Some(3));
                assert_eq!(updated.metadata.resource_version.as_deref(), Some("42"));
                assert!(updated.metadata.annotations.is_some());
            }
            Comparison::Equal => panic!("replica change must be detected"),
        }
    }

    fn pod_deployment(pod: PodSpec) -> Deployment {
        Deployment {
            metadata: owned_by(&["uid-1"]),
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(pod),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_deployment_comparer_drops_lists_that_became_unset() {
        let bare = pod_deployment(PodSpec {
            containers: vec![Container {
                name: "nuxeo".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        let mut bound = bare.clone();
        {
            let pod = bound.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
            pod.volumes = Some(vec![Volume {
                name: "binding-pg".to_string(),
                ..Default::default()
            }]);
            let container = &mut pod.containers[0];
            container.env = Some(vec![EnvVar {
                name: "DB_PASS".to_string(),
                value: Some("x".to_string()),
                ..Default::default()
            }]);
            container.volume_mounts = Some(vec![VolumeMount {
                name: "binding-pg".to_string(),
                mount_path: "/etc/nuxeo/binding/pg".to_string(),
                ..Default::default()
            }]);
        }

        match DeploymentComparer.compare(&bare, &bound).unwrap() {
            Comparison::Differs(updated) => {
                let pod = updated.spec.unwrap().template.spec.unwrap();
                assert!(pod.volumes.is_none());
                assert!(pod.containers[0].env.is_none());
                assert!(pod.containers[0].volume_mounts.is_none());
            }
            Comparison::Equal => panic!("removed volume, env and mount must be detected"),
        }

        // Server defaults on the containers still compare equal
        let mut defaulted = bare.clone();
        defaulted.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0]
            .image_pull_policy = Some("IfNotPresent".to_string());
        assert_eq!(
            DeploymentComparer.compare(&bare, &defaulted).unwrap(),
            Comparison::Equal
        );
    }

    #[test]
    fn test_missing_owner_reference_is_a_difference() {
        let desired = secret(&[("a", "1")]);
        let mut observed = desired.clone();
        observed.metadata.owner_references = None;
        match SecretComparer.compare(&desired, &observed).unwrap() {
            Comparison::Differs(updated) => {
                assert_eq!(updated.metadata.owner_references.unwrap()[0].uid, "uid-1");
            }
            Comparison::Equal => panic!("owner reference must be added"),
        }
    }

    #[test]
    fn test_secret_comparer_is_exact() {
        let desired = secret(&[("a", "1")]);
        assert_eq!(
            SecretComparer.compare(&desired, &desired.clone()).unwrap(),
            Comparison::Equal
        );

        let stale = secret(&[("a", "1"), ("b", "2")]);
        match SecretComparer.compare(&desired, &stale).unwrap() {
            Comparison::Differs(updated) => {
                assert_eq!(updated.data.unwrap().len(), 1);
            }
            Comparison::Equal => panic!("stale key must be removed"),
        }
    }

    #[test]
    fn test_config_map_comparer_treats_empty_as_absent() {
        let desired = ConfigMap {
            data: Some(BTreeMap::new()),
            ..Default::default()
        };
        let observed = ConfigMap::default();
        assert_eq!(
            ConfigMapComparer.compare(&desired, &observed).unwrap(),
            Comparison::Equal
        );
    }

    #[test]
    fn test_service_comparer_preserves_allocations() {
        let port = |node_port: Option<i32>| ServicePort {
            name: Some("http".to_string()),
            port: 8080,
            node_port,
            ..Default::default()
        };
        let desired = Service {
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                ports: Some(vec![port(None)]),
                selector: Some(BTreeMap::from([("app".to_string(), "nuxeo".to_string())])),
                ..Default::default()
            }),
            ..Default::default()
        };
        let observed = Service {
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                cluster_ip: Some("10.0.0.12".to_string()),
                ports: Some(vec![port(Some(30080))]),
                selector: Some(BTreeMap::from([("app".to_string(), "old".to_string())])),
                ..Default::default()
            }),
            ..Default::default()
        };

        match ServiceComparer.compare(&desired, &observed).unwrap() {
            Comparison::Differs(updated) => {
                let spec = updated.spec.unwrap();
                assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.12"));
                assert_eq!(spec.ports.unwrap()[0].node_port, Some(30080));
                assert_eq!(spec.selector.unwrap()["app"], "nuxeo");
            }
            Comparison::Equal => panic!("selector change must be detected"),
        }
    }
}
