//! Desired-state builders for the Nuxeo workload
//!
//! The Deployment built here is deliberately minimal: one `nuxeo` container
//! with the image, replica count and labels from the Nuxeo resource. Bindings
//! and the binding configuration are layered on top with [`merge`].

pub mod merge;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, KeyToPath, PodSpec, PodTemplateSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::crd::Nuxeo;
use crate::reconcile::ownership::owner_reference;
use crate::Error;

/// Name of the Nuxeo server container
pub const NUXEO_CONTAINER: &str = "nuxeo";

/// Environment variable listing enabled Nuxeo templates
pub const NUXEO_TEMPLATES_ENV: &str = "NUXEO_TEMPLATES";

/// Delimiter between entries of [`NUXEO_TEMPLATES_ENV`]
pub const TEMPLATES_DELIMITER: &str = ",";

/// Directory Nuxeo reads extra configuration fragments from
pub const NUXEO_CONF_DIR: &str = "/etc/nuxeo/nuxeo.conf.d";

/// Key of the binding configuration inside its ConfigMap
pub const NUXEO_CONF_KEY: &str = "nuxeo.conf";

const BINDING_CONF_VOLUME: &str = "binding-conf";

/// Label holding the Nuxeo resource name
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Label telling apart the kinds of objects built for one Nuxeo resource
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";

/// Labels shared by every object built for a Nuxeo resource
pub fn labels(nuxeo: &Nuxeo) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "nuxeo".to_string()),
        (INSTANCE_LABEL.to_string(), nuxeo.name_any()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "nuxeo-operator".to_string(),
        ),
    ])
}

/// Metadata for an object owned by `nuxeo`
pub fn owned_meta(nuxeo: &Nuxeo, name: &str) -> Result<ObjectMeta, Error> {
    Ok(ObjectMeta {
        name: Some(name.to_string()),
        namespace: nuxeo.namespace(),
        labels: Some(labels(nuxeo)),
        owner_references: Some(vec![owner_reference(nuxeo)?]),
        ..Default::default()
    })
}

/// Build the desired Deployment for a Nuxeo resource
pub fn build_deployment(nuxeo: &Nuxeo) -> Result<Deployment, Error> {
    let labels = labels(nuxeo);

    let mut container = Container {
        name: NUXEO_CONTAINER.to_string(),
        image: Some(nuxeo.spec.image.clone()),
        ..Default::default()
    };
    for template in &nuxeo.spec.templates {
        merge::merge_env(
            &mut container,
            plain_env(NUXEO_TEMPLATES_ENV, template),
            Some(TEMPLATES_DELIMITER),
        )?;
    }

    Ok(Deployment {
        metadata: owned_meta(nuxeo, &nuxeo.name_any())?,
        spec: Some(DeploymentSpec {
            replicas: Some(nuxeo.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Plain (literal) environment variable
pub fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

/// The pod spec of a Deployment, which the builder always sets
pub fn pod_spec_mut(deployment: &mut Deployment) -> Result<&mut PodSpec, Error> {
    deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .ok_or_else(|| Error::internal_with_context("pod_spec_mut", "deployment has no pod spec"))
}

/// The Nuxeo container of a pod spec
pub fn nuxeo_container_mut(pod: &mut PodSpec) -> Result<&mut Container, Error> {
    pod.containers
        .iter_mut()
        .find(|c| c.name == NUXEO_CONTAINER)
        .ok_or_else(|| {
            Error::internal_with_context(
                "nuxeo_container_mut",
                format!("pod has no {} container", NUXEO_CONTAINER),
            )
        })
}

/// Name of the ConfigMap holding the combined binding configuration
pub fn binding_conf_name(nuxeo: &Nuxeo) -> String {
    format!("{}-binding-conf", nuxeo.name_any())
}

/// ConfigMap persisting the combined binding configuration text
pub fn build_binding_conf(nuxeo: &Nuxeo, text: &str) -> Result<ConfigMap, Error> {
    Ok(ConfigMap {
        metadata: owned_meta(nuxeo, &binding_conf_name(nuxeo))?,
        data: Some(BTreeMap::from([(
            NUXEO_CONF_KEY.to_string(),
            text.to_string(),
        )])),
        ..Default::default()
    })
}

/// Mount the binding configuration ConfigMap into the Nuxeo container
pub fn mount_binding_conf(nuxeo: &Nuxeo, pod: &mut PodSpec) -> Result<(), Error> {
    merge::add_volume(
        pod,
        Volume {
            name: BINDING_CONF_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: binding_conf_name(nuxeo),
                items: Some(vec![KeyToPath {
                    key: NUXEO_CONF_KEY.to_string(),
                    path: format!("{}-bindings.conf", nuxeo.name_any()),
                    mode: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
    )?;
    merge::add_volume_mount(
        nuxeo_container_mut(pod)?,
        VolumeMount {
            name: BINDING_CONF_VOLUME.to_string(),
            mount_path: NUXEO_CONF_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    )
}

#[cfg(test)]
pub(crate) fn test_nuxeo(name: &str, spec: crate::crd::NuxeoSpec) -> Nuxeo {
    let mut nuxeo = Nuxeo::new(name, spec);
    nuxeo.metadata.namespace = Some("prod".to_string());
    nuxeo.metadata.uid = Some(format!("uid-{}", name));
    nuxeo
}
