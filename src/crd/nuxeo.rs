//! Nuxeo Custom Resource Definition
//!
//! A Nuxeo resource describes one Nuxeo cluster: the image and replica count
//! of its Deployment, the Nuxeo templates to enable, and the backing services
//! it connects to.

use std::collections::HashSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::BackingService;
use crate::Error;

/// Specification for a Nuxeo cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "appzygy.net",
    version = "v1alpha1",
    kind = "Nuxeo",
    plural = "nuxeos",
    namespaced,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NuxeoSpec {
    /// Container image for the Nuxeo server
    #[serde(default = "default_image")]
    pub image: String,

    /// Number of Nuxeo pods
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Nuxeo templates to enable (NUXEO_TEMPLATES)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<String>,

    /// Backing services to bind
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backing_services: Vec<BackingService>,
}

fn default_image() -> String {
    "nuxeo:latest".to_string()
}

fn default_replicas() -> i32 {
    1
}

impl NuxeoSpec {
    /// Validate the parts of the spec that are independent of cluster state
    ///
    /// Binding contents are checked per binding by the projection engine so
    /// one broken binding does not block the others.
    pub fn validate(&self) -> Result<(), Error> {
        if self.image.trim().is_empty() {
            return Err(Error::configuration_for("spec", "image must not be empty"));
        }
        if self.replicas < 0 {
            return Err(Error::configuration_for(
                "spec",
                format!("replicas must be >= 0, got {}", self.replicas),
            ));
        }

        let mut seen = HashSet::new();
        for binding in &self.backing_services {
            if !is_dns_label(&binding.name) {
                return Err(Error::configuration_for(
                    "spec",
                    format!(
                        "backing service name '{}' must be a lowercase DNS label of at most {} characters",
                        binding.name, MAX_BINDING_NAME_LEN
                    ),
                ));
            }
            if !seen.insert(binding.name.as_str()) {
                return Err(Error::configuration_for(
                    "spec",
                    format!("duplicate backing service name '{}'", binding.name),
                ));
            }
        }
        Ok(())
    }
}

/// Longest binding name; the projected volume is `binding-<name>` and volume
/// names are DNS labels of at most 63 characters
pub const MAX_BINDING_NAME_LEN: usize = 63 - "binding-".len();

/// Binding names end up in object names, volume names and paths
fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_BINDING_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(name: &str) -> BackingService {
        BackingService {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn spec_with(bindings: Vec<BackingService>) -> NuxeoSpec {
        NuxeoSpec {
            image: "nuxeo:2023".to_string(),
            replicas: 2,
            templates: vec![],
            backing_services: bindings,
        }
    }

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let spec: NuxeoSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(spec.image, "nuxeo:latest");
        assert_eq!(spec.replicas, 1);
        assert!(spec.backing_services.is_empty());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_full_yaml_parses() {
        let yaml = r#"
image: nuxeo:2023
replicas: 3
templates: [default]
backingServices:
  - name: pg
    resources:
      - version: v1
        kind: Secret
        name: pg-creds
        projections:
          - from: password
            mount: db.password
    nuxeoConf: |
      nuxeo.db.password=${env:DB_PASS}
"#;
        let spec: NuxeoSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.replicas, 3);
        let pg = &spec.backing_services[0];
        assert_eq!(pg.resources[0].group, "");
        assert_eq!(
            pg.resources[0].projections[0].mount.as_deref(),
            Some("db.password")
        );
        assert!(pg.nuxeo_conf.contains("${env:DB_PASS}"));
    }

    #[test]
    fn test_duplicate_binding_names_rejected() {
        let spec = spec_with(vec![binding("pg"), binding("pg")]);
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate backing service name 'pg'"));
    }

    #[test]
    fn test_binding_names_must_be_dns_labels() {
        assert!(spec_with(vec![binding("elastic-1")]).validate().is_ok());
        assert!(spec_with(vec![binding("Elastic")]).validate().is_err());
        assert!(spec_with(vec![binding("a.b")]).validate().is_err());
        assert!(spec_with(vec![binding("")]).validate().is_err());
        assert!(spec_with(vec![binding("-x")]).validate().is_err());
    }

    #[test]
    fn test_binding_names_leave_room_for_the_volume_prefix() {
        let longest = "a".repeat(MAX_BINDING_NAME_LEN);
        assert_eq!(MAX_BINDING_NAME_LEN, 55);
        assert!(spec_with(vec![binding(&longest)]).validate().is_ok());

        let too_long = "a".repeat(MAX_BINDING_NAME_LEN + 1);
        let err = spec_with(vec![binding(&too_long)]).validate().unwrap_err();
        assert!(err.to_string().contains("at most 55 characters"), "{}", err);
    }

    #[test]
    fn test_negative_replicas_rejected() {
        let mut spec = spec_with(vec![]);
        spec.replicas = -1;
        assert!(spec.validate().unwrap_err().is_configuration());
    }
}
