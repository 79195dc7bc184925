//! Kind registry: how to read each kind a binding can reference
//!
//! Secrets and ConfigMaps in the core group are key/value kinds and are read
//! by key. Every other kind is structured and read through the dynamic API,
//! which needs an [`ApiResource`] (notably the plural). The registry is built
//! once at start-up and passed by reference; unknown kinds fall back to a
//! best-effort pluralization.

use std::collections::HashMap;

use kube::core::{ApiResource, GroupVersionKind};
use kube::discovery::Discovery;
use kube::Client;
use tracing::{debug, info};

use crate::Error;

/// Key/value kinds, read by key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyValueKind {
    /// core/v1 Secret
    Secret,
    /// core/v1 ConfigMap
    ConfigMap,
}

/// Resolution strategy for one resource reference
#[derive(Clone, Debug, PartialEq)]
pub enum Strategy {
    /// Values are looked up by key
    KeyValue(KeyValueKind),
    /// Values are extracted by path expression from the object's JSON
    Structured(ApiResource),
}

impl Strategy {
    /// Kind name for messages
    pub fn kind(&self) -> &str {
        match self {
            Strategy::KeyValue(KeyValueKind::Secret) => "Secret",
            Strategy::KeyValue(KeyValueKind::ConfigMap) => "ConfigMap",
            Strategy::Structured(ar) => &ar.kind,
        }
    }
}

/// (group, version, kind) to [`ApiResource`]
#[derive(Clone, Debug)]
pub struct KindRegistry {
    resources: HashMap<(String, String, String), ApiResource>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

const BUILTIN_KINDS: &[(&str, &str, &str, &str)] = &[
    ("", "v1", "Secret", "secrets"),
    ("", "v1", "ConfigMap", "configmaps"),
    ("", "v1", "Service", "services"),
    ("", "v1", "Endpoints", "endpoints"),
    ("", "v1", "Pod", "pods"),
    ("apps", "v1", "Deployment", "deployments"),
    ("apps", "v1", "StatefulSet", "statefulsets"),
    ("networking.k8s.io", "v1", "Ingress", "ingresses"),
    ("route.openshift.io", "v1", "Route", "routes"),
    ("elasticsearch.k8s.elastic.co", "v1", "Elasticsearch", "elasticsearches"),
    ("kafka.strimzi.io", "v1beta2", "Kafka", "kafkas"),
    ("kafka.strimzi.io", "v1beta2", "KafkaUser", "kafkausers"),
    (
        "postgres-operator.crunchydata.com",
        "v1beta1",
        "PostgresCluster",
        "postgresclusters",
    ),
];

impl KindRegistry {
    /// Registry with no entries
    pub fn empty() -> Self {
        Self {
            resources: HashMap::new(),
        }
    }

    /// Registry pre-populated with core kinds and the backing services the
    /// preconfigured bindings know about
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for (group, version, kind, plural) in BUILTIN_KINDS {
            let gvk = GroupVersionKind::gvk(group, version, kind);
            registry.register(ApiResource::from_gvk_with_plural(&gvk, plural));
        }
        registry
    }

    /// Builtins plus everything the API server advertises
    pub async fn from_discovery(client: Client) -> Result<Self, Error> {
        let discovery = Discovery::new(client).run().await?;
        let mut registry = Self::with_builtins();
        let mut count = 0usize;
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, _caps) in group.versioned_resources(version) {
                    registry.register(ar);
                    count += 1;
                }
            }
        }
        info!(resources = count, "kind registry populated from discovery");
        Ok(registry)
    }

    /// Add or replace an entry
    pub fn register(&mut self, ar: ApiResource) {
        self.resources
            .insert((ar.group.clone(), ar.version.clone(), ar.kind.clone()), ar);
    }

    /// Strategy for a (group, version, kind)
    pub fn resolve(&self, group: &str, version: &str, kind: &str) -> Result<Strategy, Error> {
        if version.is_empty() || kind.is_empty() {
            return Err(Error::configuration(format!(
                "resource reference needs a version and a kind, got version '{}' kind '{}'",
                version, kind
            )));
        }

        if group.is_empty() && version == "v1" {
            match kind {
                "Secret" => return Ok(Strategy::KeyValue(KeyValueKind::Secret)),
                "ConfigMap" => return Ok(Strategy::KeyValue(KeyValueKind::ConfigMap)),
                _ => {}
            }
        }

        let key = (group.to_string(), version.to_string(), kind.to_string());
        if let Some(ar) = self.resources.get(&key) {
            return Ok(Strategy::Structured(ar.clone()));
        }

        debug!(%group, %version, %kind, "kind not registered, guessing plural");
        let gvk = GroupVersionKind::gvk(group, version, kind);
        Ok(Strategy::Structured(ApiResource::from_gvk_with_plural(
            &gvk,
            &pluralize_kind(kind),
        )))
    }
}

/// Lower-case English plural of a kind name
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") || lower.ends_with('x')
    {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_core_key_value_kinds() {
        let registry = KindRegistry::with_builtins();
        assert_eq!(
            registry.resolve("", "v1", "Secret").unwrap(),
            Strategy::KeyValue(KeyValueKind::Secret)
        );
        assert_eq!(
            registry.resolve("", "v1", "ConfigMap").unwrap(),
            Strategy::KeyValue(KeyValueKind::ConfigMap)
        );
    }

    #[test]
    fn test_secret_outside_core_group_is_structured() {
        let registry = KindRegistry::with_builtins();
        let strategy = registry.resolve("example.com", "v1", "Secret").unwrap();
        assert!(matches!(strategy, Strategy::Structured(_)));
    }

    #[test]
    fn test_builtin_structured_kinds_keep_irregular_plurals() {
        let registry = KindRegistry::with_builtins();
        match registry
            .resolve("elasticsearch.k8s.elastic.co", "v1", "Elasticsearch")
            .unwrap()
        {
            Strategy::Structured(ar) => {
                assert_eq!(ar.plural, "elasticsearches");
                assert_eq!(ar.api_version, "elasticsearch.k8s.elastic.co/v1");
            }
            other => panic!("unexpected strategy {:?}", other),
        }
    }

    #[test]
    fn test_registered_kind_wins_over_guess() {
        let mut registry = KindRegistry::empty();
        let gvk = GroupVersionKind::gvk("acme.io", "v1", "Cactus");
        registry.register(ApiResource::from_gvk_with_plural(&gvk, "cacti"));
        match registry.resolve("acme.io", "v1", "Cactus").unwrap() {
            Strategy::Structured(ar) => assert_eq!(ar.plural, "cacti"),
            other => panic!("unexpected strategy {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_falls_back_to_pluralization() {
        let registry = KindRegistry::empty();
        match registry.resolve("acme.io", "v1alpha1", "Policy").unwrap() {
            Strategy::Structured(ar) => {
                assert_eq!(ar.plural, "policies");
                assert_eq!(ar.kind, "Policy");
            }
            other => panic!("unexpected strategy {:?}", other),
        }
    }

    #[test]
    fn test_missing_version_rejected() {
        let registry = KindRegistry::default();
        assert!(registry.resolve("", "", "Secret").is_err());
    }

    #[rstest]
    #[case("Service", "services")]
    #[case("Ingress", "ingresses")]
    #[case("Policy", "policies")]
    #[case("Gateway", "gateways")]
    #[case("Mailbox", "mailboxes")]
    fn test_pluralize_kind(#[case] kind: &str, #[case] plural: &str) {
        assert_eq!(pluralize_kind(kind), plural);
    }
}
