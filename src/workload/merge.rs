//! Idempotent merges into a pod template
//!
//! Each helper follows the same rule: add when absent, merge when compatible,
//! fail when conflicting. Running the same merge twice is a no-op, which is
//! what lets several bindings (and several passes) contribute to one pod
//! template.

use k8s_openapi::api::core::v1::{
    Container, EnvVar, KeyToPath, PodSpec, ProjectedVolumeSource, Volume, VolumeMount,
    VolumeProjection,
};
use serde_json::Value;

use crate::Error;

/// Name of the volume source a volume uses (`secret`, `configMap`, `projected`...)
fn source_kind(volume: &Volume) -> Result<String, Error> {
    let value = serde_json::to_value(volume)
        .map_err(|e| Error::serialization_for_kind("Volume", e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(Error::serialization_for_kind(
            "Volume",
            "volume did not serialize to an object",
        ));
    };
    fields
        .into_iter()
        .map(|(k, _)| k)
        .find(|k| k != "name")
        .ok_or_else(|| {
            Error::configuration_for(
                format!("volume {}", volume.name),
                "volume has no source",
            )
        })
}

/// Add a volume to the pod, merging with a same-named volume when compatible
pub fn add_volume(pod: &mut PodSpec, volume: Volume) -> Result<(), Error> {
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    let Some(existing) = volumes.iter_mut().find(|v| v.name == volume.name) else {
        volumes.push(volume);
        return Ok(());
    };

    let context = format!("volume {}", volume.name);
    let (existing_kind, new_kind) = (source_kind(existing)?, source_kind(&volume)?);
    if existing_kind != new_kind {
        return Err(Error::configuration_for(
            context,
            format!(
                "already defined with a {} source, cannot merge a {} source",
                existing_kind, new_kind
            ),
        ));
    }

    match new_kind.as_str() {
        "secret" => {
            let have = existing.secret.get_or_insert_with(Default::default);
            let add = volume.secret.unwrap_or_default();
            if have.secret_name != add.secret_name {
                return Err(Error::configuration_for(
                    context,
                    format!(
                        "refers to secret {:?}, cannot merge secret {:?}",
                        have.secret_name, add.secret_name
                    ),
                ));
            }
            merge_items(&mut have.items, add.items, &context)
        }
        "configMap" => {
            let have = existing.config_map.get_or_insert_with(Default::default);
            let add = volume.config_map.unwrap_or_default();
            if have.name != add.name {
                return Err(Error::configuration_for(
                    context,
                    format!(
                        "refers to config map {}, cannot merge config map {}",
                        have.name, add.name
                    ),
                ));
            }
            merge_items(&mut have.items, add.items, &context)
        }
        "projected" => {
            let have = existing.projected.get_or_insert_with(Default::default);
            merge_projected(have, volume.projected.unwrap_or_default(), &context)
        }
        _ if *existing == volume => Ok(()),
        _ => Err(Error::configuration_for(
            context,
            format!("conflicting {} volume definitions", new_kind),
        )),
    }
}

/// Merge key-to-path items: same key must map to the same path
fn merge_items(
    have: &mut Option<Vec<KeyToPath>>,
    add: Option<Vec<KeyToPath>>,
    context: &str,
) -> Result<(), Error> {
    let items = have.get_or_insert_with(Vec::new);
    for item in add.into_iter().flatten() {
        if let Some(existing) = items.iter().find(|i| i.key == item.key) {
            if existing.path != item.path || existing.mode != item.mode {
                return Err(Error::configuration_for(
                    context,
                    format!(
                        "key {} is already projected to {}, cannot project it to {}",
                        item.key, existing.path, item.path
                    ),
                ));
            }
            continue;
        }
        if let Some(existing) = items.iter().find(|i| i.path == item.path) {
            return Err(Error::configuration_for(
                context,
                format!(
                    "path {} is already used by key {}, cannot use it for key {}",
                    item.path, existing.key, item.key
                ),
            ));
        }
        items.push(item);
    }
    Ok(())
}

/// Merge projected sources: same secret/configMap merges items, others append
fn merge_projected(
    have: &mut ProjectedVolumeSource,
    add: ProjectedVolumeSource,
    context: &str,
) -> Result<(), Error> {
    if have.default_mode != add.default_mode && add.default_mode.is_some() {
        return Err(Error::configuration_for(
            context,
            "conflicting defaultMode on projected volume",
        ));
    }

    let sources = have.sources.get_or_insert_with(Vec::new);
    for source in add.sources.into_iter().flatten() {
        let same = sources.iter_mut().find(|s| same_projection_object(s, &source));
        match same {
            Some(existing) => match (existing, source) {
                (
                    VolumeProjection {
                        secret: Some(h), ..
                    },
                    VolumeProjection {
                        secret: Some(a), ..
                    },
                ) => merge_items(&mut h.items, a.items, context)?,
                (
                    VolumeProjection {
                        config_map: Some(h),
                        ..
                    },
                    VolumeProjection {
                        config_map: Some(a),
                        ..
                    },
                ) => merge_items(&mut h.items, a.items, context)?,
                (existing, source) => {
                    if *existing != source {
                        return Err(Error::configuration_for(
                            context,
                            "conflicting projected volume sources",
                        ));
                    }
                }
            },
            None => sources.push(source),
        }
    }
    Ok(())
}

fn same_projection_object(a: &VolumeProjection, b: &VolumeProjection) -> bool {
    match (a, b) {
        (
            VolumeProjection {
                secret: Some(x), ..
            },
            VolumeProjection {
                secret: Some(y), ..
            },
        ) => x.name == y.name,
        (
            VolumeProjection {
                config_map: Some(x),
                ..
            },
            VolumeProjection {
                config_map: Some(y),
                ..
            },
        ) => x.name == y.name,
        _ => a == b,
    }
}

/// Add a volume mount; a same-named mount must be identical
pub fn add_volume_mount(container: &mut Container, mount: VolumeMount) -> Result<(), Error> {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    match mounts.iter().find(|m| m.name == mount.name) {
        None => {
            mounts.push(mount);
            Ok(())
        }
        Some(existing) if *existing == mount => Ok(()),
        Some(existing) => Err(Error::configuration_for(
            format!("container {}", container.name),
            format!(
                "volume mount {} is already mounted at {}, cannot mount it at {}",
                mount.name, existing.mount_path, mount.mount_path
            ),
        )),
    }
}

/// Add or merge an environment variable
///
/// With a delimiter, two plain values are joined (`base` + `extra` with `,`
/// gives `base,extra`); a value already present in the list is not repeated.
/// Without one, only an identical variable is accepted. Reference-typed
/// variables never merge.
pub fn merge_env(
    container: &mut Container,
    var: EnvVar,
    delimiter: Option<&str>,
) -> Result<(), Error> {
    let context = format!("container {}", container.name);
    let env = container.env.get_or_insert_with(Vec::new);
    let Some(existing) = env.iter_mut().find(|e| e.name == var.name) else {
        env.push(var);
        return Ok(());
    };

    if *existing == var {
        return Ok(());
    }

    if existing.value_from.is_some() || var.value_from.is_some() {
        return Err(Error::configuration_for(
            context,
            format!(
                "env var {} is defined twice and one definition is a reference",
                var.name
            ),
        ));
    }

    let Some(delimiter) = delimiter else {
        return Err(Error::configuration_for(
            context,
            format!("env var {} is defined twice with different values", var.name),
        ));
    };

    let current = existing.value.clone().unwrap_or_default();
    let addition = var.value.unwrap_or_default();
    let already = current.split(delimiter).any(|part| part == addition);
    existing.value = Some(match (current.is_empty(), addition.is_empty(), already) {
        (_, true, _) | (_, _, true) => current,
        (true, false, _) => addition,
        (false, false, false) => format!("{}{}{}", current, delimiter, addition),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ConfigMapVolumeSource, EmptyDirVolumeSource, EnvVarSource, SecretKeySelector,
        SecretProjection, SecretVolumeSource,
    };

    fn item(key: &str, path: &str) -> KeyToPath {
        KeyToPath {
            key: key.to_string(),
            path: path.to_string(),
            mode: None,
        }
    }

    fn secret_volume(name: &str, secret: &str, items: Vec<KeyToPath>) -> Volume {
        Volume {
            name: name.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                items: Some(items),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn projected_volume(name: &str, secret: &str, items: Vec<KeyToPath>) -> Volume {
        Volume {
            name: name.to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    secret: Some(SecretProjection {
                        name: secret.to_string(),
                        items: Some(items),
                        optional: None,
                    }),
                    ..Default::default()
                }]),
                default_mode: None,
            }),
            ..Default::default()
        }
    }

    fn plain(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }
    }

    fn secret_ref(name: &str, secret: &str, key: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.to_string(),
                    key: key.to_string(),
                    optional: None,
                }),
                ..Default::default()
            }),
        }
    }

    fn container() -> Container {
        Container {
            name: "nuxeo".to_string(),
            ..Default::default()
        }
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    #[test]
    fn test_volume_kinds_must_match() {
        let mut pod = PodSpec::default();
        add_volume(&mut pod, secret_volume("data", "s", vec![item("a", "a")])).unwrap();

        let empty_dir = Volume {
            name: "data".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        };
        let err = add_volume(&mut pod, empty_dir).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("secret source"));
        assert!(err.to_string().contains("emptyDir source"));
    }

    #[test]
    fn test_disjoint_secret_keys_merge_into_union() {
        let mut pod = PodSpec::default();
        add_volume(&mut pod, secret_volume("data", "s", vec![item("a", "a.txt")])).unwrap();
        add_volume(&mut pod, secret_volume("data", "s", vec![item("b", "b.txt")])).unwrap();

        let volumes = pod.volumes.unwrap();
        assert_eq!(volumes.len(), 1);
        let items = volumes[0].secret.as_ref().unwrap().items.as_ref().unwrap();
        let keys: Vec<&str> = items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_same_key_different_path_conflicts() {
        let mut pod = PodSpec::default();
        add_volume(&mut pod, secret_volume("data", "s", vec![item("a", "a.txt")])).unwrap();
        let err =
            add_volume(&mut pod, secret_volume("data", "s", vec![item("a", "other.txt")]))
                .unwrap_err();
        assert!(err.to_string().contains("key a is already projected to a.txt"));
    }

    #[test]
    fn test_different_keys_same_path_conflict() {
        let mut pod = PodSpec::default();
        add_volume(&mut pod, secret_volume("data", "s", vec![item("a", "x")])).unwrap();
        assert!(add_volume(&mut pod, secret_volume("data", "s", vec![item("b", "x")])).is_err());
    }

    #[test]
    fn test_secret_volumes_must_name_same_secret() {
        let mut pod = PodSpec::default();
        add_volume(&mut pod, secret_volume("data", "s1", vec![])).unwrap();
        assert!(add_volume(&mut pod, secret_volume("data", "s2", vec![])).is_err());
    }

    #[test]
    fn test_config_map_items_merge() {
        let cm = |key: &str| Volume {
            name: "conf".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: "nuxeo-binding-conf".to_string(),
                items: Some(vec![item(key, key)]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut pod = PodSpec::default();
        add_volume(&mut pod, cm("nuxeo.conf")).unwrap();
        add_volume(&mut pod, cm("extra.conf")).unwrap();
        add_volume(&mut pod, cm("extra.conf")).unwrap();
        let volumes = pod.volumes.unwrap();
        assert_eq!(
            volumes[0].config_map.as_ref().unwrap().items.as_ref().unwrap().len(),
            2
        );
    }

    #[test]
    fn test_projected_sources_merge_per_object() {
        let mut pod = PodSpec::default();
        add_volume(&mut pod, projected_volume("binding-pg", "sec", vec![item("a", "a")]))
            .unwrap();
        add_volume(&mut pod, projected_volume("binding-pg", "sec", vec![item("b", "b")]))
            .unwrap();
        add_volume(&mut pod, projected_volume("binding-pg", "other", vec![item("c", "c")]))
            .unwrap();

        let volumes = pod.volumes.unwrap();
        let sources = volumes[0].projected.as_ref().unwrap().sources.as_ref().unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(
            sources[0].secret.as_ref().unwrap().items.as_ref().unwrap().len(),
            2
        );
    }

    #[test]
    fn test_identical_volume_is_noop() {
        let mut pod = PodSpec::default();
        let v = Volume {
            name: "tmp".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        };
        add_volume(&mut pod, v.clone()).unwrap();
        add_volume(&mut pod, v).unwrap();
        assert_eq!(pod.volumes.unwrap().len(), 1);
    }

    // =========================================================================
    // Volume mounts
    // =========================================================================

    #[test]
    fn test_volume_mount_identical_or_error() {
        let mount = |path: &str| VolumeMount {
            name: "binding-pg".to_string(),
            mount_path: path.to_string(),
            read_only: Some(true),
            ..Default::default()
        };
        let mut c = container();
        add_volume_mount(&mut c, mount("/etc/nuxeo/binding/pg")).unwrap();
        add_volume_mount(&mut c, mount("/etc/nuxeo/binding/pg")).unwrap();
        assert_eq!(c.volume_mounts.as_ref().unwrap().len(), 1);

        let err = add_volume_mount(&mut c, mount("/elsewhere")).unwrap_err();
        assert!(err.to_string().contains("container nuxeo"));
    }

    // =========================================================================
    // Environment
    // =========================================================================

    /// Story: two sources ask for Nuxeo templates and both get enabled
    #[test]
    fn story_templates_are_joined_with_delimiter() {
        let mut c = container();
        merge_env(&mut c, plain("NUXEO_TEMPLATES", "base"), Some(",")).unwrap();
        merge_env(&mut c, plain("NUXEO_TEMPLATES", "extra"), Some(",")).unwrap();
        assert_eq!(c.env.as_ref().unwrap()[0].value.as_deref(), Some("base,extra"));

        // Re-running the pass does not repeat entries
        merge_env(&mut c, plain("NUXEO_TEMPLATES", "extra"), Some(",")).unwrap();
        assert_eq!(c.env.as_ref().unwrap()[0].value.as_deref(), Some("base,extra"));
    }

    #[test]
    fn test_env_without_delimiter_must_match() {
        let mut c = container();
        merge_env(&mut c, plain("A", "1"), None).unwrap();
        merge_env(&mut c, plain("A", "1"), None).unwrap();
        assert!(merge_env(&mut c, plain("A", "2"), None).is_err());
        assert_eq!(c.env.unwrap().len(), 1);
    }

    #[test]
    fn test_reference_env_never_merges() {
        let mut c = container();
        merge_env(&mut c, secret_ref("DB_PASS", "pg", "password"), Some(",")).unwrap();
        merge_env(&mut c, secret_ref("DB_PASS", "pg", "password"), Some(",")).unwrap();
        assert!(merge_env(&mut c, plain("DB_PASS", "x"), Some(",")).is_err());
        assert!(merge_env(&mut c, secret_ref("DB_PASS", "pg", "other"), Some(",")).is_err());
    }
}
