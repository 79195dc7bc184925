//! Supporting types for the Nuxeo CRD: backing-service bindings

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// A binding between a Nuxeo cluster and one backing service
///
/// The binding name prefixes the mount directory (`<mount-base>/<name>`) and
/// suffixes the secondary secret (`<nuxeo>-secondary-<name>`).
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackingService {
    /// Binding name, unique within the Nuxeo resource
    pub name: String,

    /// Cluster resources holding connection material
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<BackingServiceResource>,

    /// Configuration text appended to nuxeo.conf, may contain `${env:VAR}` placeholders
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nuxeo_conf: String,

    /// Shorthand for a well-known backing service, expanded into resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconfigured: Option<PreconfiguredBackingService>,
}

/// A preconfigured backing service (ECK, Strimzi, Crunchy)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreconfiguredBackingService {
    /// Service type, matched case-insensitively
    #[serde(rename = "type")]
    pub type_: String,

    /// Name of the service's own custom resource (Elasticsearch, Kafka, PostgresCluster)
    pub resource: String,

    /// Type specific options
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

/// Reference to one cluster resource plus the values to take from it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackingServiceResource {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,

    /// API version
    pub version: String,

    /// Resource kind
    pub kind: String,

    /// Resource name, in the Nuxeo resource's namespace
    pub name: String,

    /// Values to extract, in order
    #[serde(default)]
    pub projections: Vec<ResourceProjection>,
}

impl BackingServiceResource {
    /// apiVersion string (`v1`, `apps/v1`, ...)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// One value extracted from a resource and how it reaches the pod
///
/// `from` names a key (Secret, ConfigMap), `path` is a path expression
/// (`{.status.endpoint}`) for every other kind. Exactly one of `env`,
/// `mount` and `transform` is set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProjection {
    /// Key to read from a key/value resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Path expression to evaluate against any other resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Environment variable to expose the value as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,

    /// File name under the binding's mount directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<String>,

    /// Bake the resolved value into the env var instead of referencing it
    #[serde(default, skip_serializing_if = "is_false")]
    pub value: bool,

    /// Convert PEM material into a Java key store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<CertTransform>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ResourceProjection {
    /// Validate the projection in isolation
    pub fn validate(&self) -> Result<(), Error> {
        let realizations = [
            self.env.is_some(),
            self.mount.is_some(),
            self.transform.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if realizations != 1 {
            return Err(Error::configuration(format!(
                "projection {} must set exactly one of env, mount, transform",
                self.describe()
            )));
        }

        if self.value && self.env.is_none() {
            return Err(Error::configuration(format!(
                "projection {} sets value without env",
                self.describe()
            )));
        }

        match &self.transform {
            Some(transform) => {
                if self.from.is_some() || self.path.is_some() {
                    return Err(Error::configuration(format!(
                        "transform projection {} takes its inputs from cert/privateKey, not from/path",
                        transform.store
                    )));
                }
                transform.validate()
            }
            None => match (&self.from, &self.path) {
                (Some(_), None) | (None, Some(_)) => Ok(()),
                _ => Err(Error::configuration(format!(
                    "projection {} must set exactly one of from, path",
                    self.describe()
                ))),
            },
        }
    }

    /// Short human label used in error messages
    pub fn describe(&self) -> String {
        if let Some(env) = &self.env {
            format!("env {}", env)
        } else if let Some(mount) = &self.mount {
            format!("mount {}", mount)
        } else if let Some(transform) = &self.transform {
            format!("transform {}", transform.store)
        } else {
            "(empty)".to_string()
        }
    }
}

/// Kind of key store a transform produces
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CertTransformType {
    /// Trusted certificates only
    #[default]
    TrustStore,
    /// Private key with its certificate chain
    KeyStore,
}

impl std::fmt::Display for CertTransformType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrustStore => write!(f, "TrustStore"),
            Self::KeyStore => write!(f, "KeyStore"),
        }
    }
}

/// PEM to key store transform
///
/// `cert` and `private_key` are read with the owning resource's strategy:
/// keys for Secrets and ConfigMaps, path expressions for anything else.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertTransform {
    /// Store flavor
    #[serde(rename = "type")]
    pub type_: CertTransformType,

    /// Where the PEM certificate(s) live
    pub cert: String,

    /// Where the PEM private key lives (KeyStore only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Secondary secret key and file name of the store
    pub store: String,

    /// Secondary secret key holding the store password
    pub password: String,

    /// Environment variable exposing the store password
    pub pass_env: String,
}

impl CertTransform {
    /// Check required fields for the transform type
    pub fn validate(&self) -> Result<(), Error> {
        let missing = |field: &str| {
            Error::configuration(format!(
                "{} transform {} requires {}",
                self.type_, self.store, field
            ))
        };
        if self.cert.is_empty() {
            return Err(missing("cert"));
        }
        if self.store.is_empty() {
            return Err(missing("store"));
        }
        if self.password.is_empty() {
            return Err(missing("password"));
        }
        if self.pass_env.is_empty() {
            return Err(missing("passEnv"));
        }
        if self.store == self.password {
            return Err(Error::configuration(format!(
                "transform {} uses the same key for store and password",
                self.store
            )));
        }
        match (&self.type_, &self.private_key) {
            (CertTransformType::KeyStore, None) => Err(missing("privateKey")),
            (CertTransformType::TrustStore, Some(_)) => Err(Error::configuration(format!(
                "TrustStore transform {} does not take a privateKey",
                self.store
            ))),
            _ => Ok(()),
        }
    }
}
