//! Resource projection engine
//!
//! Binds a Nuxeo pod template to backing services. For each binding:
//!
//! 1. expand a preconfigured block into ordinary resource references
//! 2. validate, and pick one resolution strategy per referenced kind
//! 3. read each resource once and resolve every projection's value
//! 4. realize the projections: env vars, files under
//!    `<mount-base>/<binding>`, or key stores built from PEM material
//! 5. reconcile the binding's secondary secret, or remove it when the binding
//!    no longer needs one
//!
//! Bindings are all-or-nothing: a binding works on a copy of the pod template
//! and the copy is only kept when the whole binding succeeded. Different
//! bindings succeed or fail independently.

pub mod path;
pub mod preconfigured;
pub mod reader;
pub mod registry;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapKeySelector, EnvVar, EnvVarSource, KeyToPath, PodSpec, ProjectedVolumeSource, Secret,
    SecretKeySelector, SecretProjection, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::ByteString;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::crd::{
    BackingService, BackingServiceResource, CertTransform, CertTransformType, Nuxeo,
    ResourceProjection,
};
use crate::pki;
use crate::reconcile::comparer::SecretComparer;
use crate::reconcile::{self, ObjectClient, ReconcileOutcome, RemoveOutcome};
use crate::workload::{self, merge};
use crate::Error;

use path::PathExpression;
pub use reader::{KubeResourceReader, ResourceReader};
pub use registry::{KeyValueKind, KindRegistry, Strategy};

/// Default directory binding files are mounted under
pub const DEFAULT_MOUNT_BASE: &str = "/etc/nuxeo/binding";

/// Label naming the binding a secondary secret belongs to
pub const BINDING_LABEL: &str = "appzygy.net/binding";

/// Component label value of secondary secrets
pub const SECONDARY_COMPONENT: &str = "binding-secondary";

/// Label selector matching every secondary secret of a Nuxeo resource
pub fn secondary_selector(nuxeo_name: &str) -> String {
    format!(
        "{}={},{}={}",
        workload::INSTANCE_LABEL,
        nuxeo_name,
        workload::COMPONENT_LABEL,
        SECONDARY_COMPONENT
    )
}

/// Name of the secondary secret of a binding
pub fn secondary_secret_name(nuxeo_name: &str, binding: &str) -> String {
    format!("{}-secondary-{}", nuxeo_name, binding)
}

/// Name of the projected volume of a binding
pub fn binding_volume_name(binding: &str) -> String {
    format!("binding-{}", binding)
}

/// Result of projecting every binding of a Nuxeo resource
#[derive(Debug, Default)]
pub struct BindingReport {
    /// Bindings applied to the pod template, in declaration order
    pub applied: Vec<String>,
    /// Bindings that failed, with their error
    pub failed: Vec<(String, Error)>,
    /// Secondary secrets deleted because their binding left the spec
    pub pruned: Vec<String>,
    /// Configuration text of the applied bindings, trimmed and newline-joined
    pub nuxeo_conf: String,
}

impl BindingReport {
    /// Remove and return the first transient failure
    ///
    /// A transient failure means the pod template is missing a binding that
    /// may well be healthy, so nothing built from it should be written.
    pub fn take_transient(&mut self) -> Option<Error> {
        let index = self.failed.iter().position(|(_, e)| e.is_retryable())?;
        Some(self.failed.remove(index).1)
    }

    /// The error to report for the pass, if any binding failed
    ///
    /// A transient failure is preferred so the controller retries soon.
    pub fn into_error(self) -> Option<Error> {
        let mut failed = self.failed;
        let index = failed
            .iter()
            .position(|(_, e)| e.is_retryable())
            .unwrap_or(0);
        (!failed.is_empty()).then(|| failed.swap_remove(index).1)
    }
}

/// What one successfully projected binding contributes besides the pod template
#[derive(Debug)]
struct Projected {
    nuxeo_conf: String,
    secondary: Option<ReconcileOutcome>,
}

/// Projects bindings onto a pod template
pub struct Binder<'a> {
    registry: &'a KindRegistry,
    reader: &'a dyn ResourceReader,
    secrets: &'a dyn ObjectClient<Secret>,
    mount_base: &'a str,
}

impl<'a> Binder<'a> {
    /// Create a binder
    pub fn new(
        registry: &'a KindRegistry,
        reader: &'a dyn ResourceReader,
        secrets: &'a dyn ObjectClient<Secret>,
        mount_base: &'a str,
    ) -> Self {
        Self {
            registry,
            reader,
            secrets,
            mount_base,
        }
    }

    /// Project every binding of `nuxeo` onto `pod`
    ///
    /// Failed bindings are recorded in the report and leave `pod` untouched.
    pub async fn project_all(&self, nuxeo: &Nuxeo, pod: &mut PodSpec) -> BindingReport {
        let mut report = BindingReport::default();
        let mut conf = Vec::new();

        for binding in &nuxeo.spec.backing_services {
            match self.project(nuxeo, binding, pod).await {
                Ok(projected) => {
                    info!(
                        binding = %binding.name,
                        secondary = ?projected.secondary,
                        "binding projected"
                    );
                    if !projected.nuxeo_conf.is_empty() {
                        conf.push(projected.nuxeo_conf);
                    }
                    report.applied.push(binding.name.clone());
                }
                Err(e) => {
                    warn!(binding = %binding.name, error = %e, "binding failed, skipping");
                    report.failed.push((binding.name.clone(), e));
                }
            }
        }

        report.nuxeo_conf = conf.join("\n");

        match self.prune_secondaries(nuxeo).await {
            Ok(pruned) => report.pruned = pruned,
            Err(e) => {
                warn!(error = %e, "failed to prune stale secondary secrets");
                report.failed.push(("secondary secret cleanup".to_string(), e));
            }
        }
        report
    }

    /// Delete owned secondary secrets whose binding is no longer declared
    ///
    /// Secrets of declared bindings stay, even when the binding failed this
    /// pass.
    async fn prune_secondaries(&self, nuxeo: &Nuxeo) -> Result<Vec<String>, Error> {
        let namespace = nuxeo.namespace().unwrap_or_default();
        let nuxeo_name = nuxeo.name_any();
        let owner_uid = reconcile::ownership::owner_uid(nuxeo)?;
        let declared: Vec<String> = nuxeo
            .spec
            .backing_services
            .iter()
            .map(|b| secondary_secret_name(&nuxeo_name, &b.name))
            .collect();

        let mut pruned = Vec::new();
        for secret in self
            .secrets
            .list(&namespace, &secondary_selector(&nuxeo_name))
            .await?
        {
            let name = secret.name_any();
            if declared.contains(&name) || !reconcile::is_owner(&secret.metadata, &owner_uid) {
                continue;
            }
            info!(secret = %name, "removing secondary secret of a removed binding");
            self.secrets.delete(&namespace, &name).await?;
            pruned.push(name);
        }
        Ok(pruned)
    }

    /// Project one binding; `pod` only changes when the whole binding succeeds
    async fn project(
        &self,
        nuxeo: &Nuxeo,
        binding: &BackingService,
        pod: &mut PodSpec,
    ) -> Result<Projected, Error> {
        let name = binding.name.as_str();
        let namespace = nuxeo.namespace().unwrap_or_default();

        let expansion =
            preconfigured::expand(binding, self.mount_base).map_err(|e| e.in_binding(name))?;
        let binding = &expansion.binding;
        let references = self.validate(binding).map_err(|e| e.in_binding(name))?;

        let secondary_name = secondary_secret_name(&nuxeo.name_any(), name);
        let owner_uid = reconcile::ownership::owner_uid(nuxeo)?;
        let cached = self
            .secrets
            .get(&namespace, &secondary_name)
            .await?
            .filter(|s| reconcile::is_owner(&s.metadata, &owner_uid));

        let mut plan = Plan::new(secondary_name.clone());
        for (reference, strategy) in &references {
            let source = self.fetch(&namespace, reference, strategy).await?;
            for projection in &reference.projections {
                plan.realize(projection, &source, cached.as_ref())
                    .map_err(|e| e.in_binding(name))?;
            }
        }

        let mut candidate = pod.clone();
        plan.apply(
            &mut candidate,
            name,
            self.mount_base,
            &expansion.templates,
        )
        .map_err(|e| e.in_binding(name))?;

        let secondary = if plan.secondary.is_empty() {
            match reconcile::remove_if_owned::<Secret>(
                self.secrets,
                &namespace,
                &secondary_name,
                &owner_uid,
            )
            .await?
            {
                RemoveOutcome::Deleted => info!(binding = %name, "removed unused secondary secret"),
                RemoveOutcome::NotOwned => warn!(
                    binding = %name,
                    secret = %secondary_name,
                    "secondary secret name is taken by an object this Nuxeo does not own"
                ),
                RemoveOutcome::Absent => {}
            }
            None
        } else {
            let desired = build_secondary_secret(nuxeo, name, &secondary_name, plan.secondary)?;
            Some(
                reconcile::reconcile(
                    self.secrets,
                    &namespace,
                    &secondary_name,
                    &desired,
                    &SecretComparer,
                )
                .await?,
            )
        };

        *pod = candidate;
        Ok(Projected {
            nuxeo_conf: binding.nuxeo_conf.trim().to_string(),
            secondary,
        })
    }

    /// Resolve the strategy of every reference and check projections against it
    fn validate<'b>(
        &self,
        binding: &'b BackingService,
    ) -> Result<Vec<(&'b BackingServiceResource, Strategy)>, Error> {
        let mut references = Vec::with_capacity(binding.resources.len());

        for reference in &binding.resources {
            if reference.name.is_empty() {
                return Err(Error::configuration(format!(
                    "{} reference has no name",
                    reference.kind
                )));
            }
            let strategy =
                self.registry
                    .resolve(&reference.group, &reference.version, &reference.kind)?;
            let label = format!("{} {}", reference.kind, reference.name);

            let by_key = reference.projections.iter().any(|p| p.from.is_some());
            let by_path = reference.projections.iter().any(|p| p.path.is_some());
            if by_key && by_path {
                return Err(Error::configuration(format!(
                    "{} mixes key (from) and path projections",
                    label
                )));
            }

            for projection in &reference.projections {
                projection.validate()?;
                if let Some(mount) = &projection.mount {
                    check_file_name(mount)?;
                }
                if let Some(transform) = &projection.transform {
                    check_file_name(&transform.store)?;
                    check_secret_key(&transform.password)?;
                }
            }

            match &strategy {
                Strategy::KeyValue(_) if by_path => {
                    return Err(Error::configuration(format!(
                        "{} is read by key, use from instead of path",
                        label
                    )))
                }
                Strategy::Structured(_) if by_key => {
                    return Err(Error::configuration(format!(
                        "{} is read by path expression, use path instead of from",
                        label
                    )))
                }
                Strategy::Structured(_) => {
                    for projection in &reference.projections {
                        for selector in selectors(projection) {
                            PathExpression::parse(selector)?.secret_key()?;
                        }
                    }
                }
                Strategy::KeyValue(_) => {}
            }

            references.push((reference, strategy));
        }
        Ok(references)
    }

    /// Read a referenced resource once
    async fn fetch(
        &self,
        namespace: &str,
        reference: &BackingServiceResource,
        strategy: &Strategy,
    ) -> Result<Source, Error> {
        debug!(kind = %strategy.kind(), name = %reference.name, "reading binding source");
        match strategy {
            Strategy::KeyValue(kind @ KeyValueKind::Secret) => {
                let secret = self.reader.get_secret(namespace, &reference.name).await?;
                let mut data: BTreeMap<String, Vec<u8>> = secret
                    .string_data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, v.into_bytes()))
                    .collect();
                data.extend(secret.data.unwrap_or_default().into_iter().map(|(k, v)| (k, v.0)));
                Ok(Source::KeyValue {
                    kind: *kind,
                    name: reference.name.clone(),
                    data,
                })
            }
            Strategy::KeyValue(kind @ KeyValueKind::ConfigMap) => {
                let cm = self.reader.get_config_map(namespace, &reference.name).await?;
                let mut data: BTreeMap<String, Vec<u8>> = cm
                    .binary_data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, v.0))
                    .collect();
                data.extend(cm.data.unwrap_or_default().into_iter().map(|(k, v)| (k, v.into_bytes())));
                Ok(Source::KeyValue {
                    kind: *kind,
                    name: reference.name.clone(),
                    data,
                })
            }
            Strategy::Structured(ar) => {
                let object = self
                    .reader
                    .get_dynamic(namespace, &reference.name, ar)
                    .await?;
                let json = serde_json::to_value(&object)
                    .map_err(|e| Error::serialization_for_kind(&ar.kind, e.to_string()))?;
                Ok(Source::Structured {
                    label: format!("{} {}", ar.kind, reference.name),
                    json,
                })
            }
        }
    }
}

fn selectors(projection: &ResourceProjection) -> Vec<&str> {
    let mut out: Vec<&str> = projection
        .from
        .iter()
        .chain(projection.path.iter())
        .map(String::as_str)
        .collect();
    if let Some(t) = &projection.transform {
        out.push(&t.cert);
        out.extend(t.private_key.as_deref());
    }
    out
}

/// Secret keys are limited to `[-._a-zA-Z0-9]+`
fn check_secret_key(key: &str) -> Result<(), Error> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));
    if valid {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "'{}' is not a valid secret key",
            key
        )))
    }
}

/// Mounted files live directly in the binding directory
fn check_file_name(name: &str) -> Result<(), Error> {
    check_secret_key(name)?;
    if name == "." || name == ".." {
        return Err(Error::configuration(format!(
            "'{}' is not a valid file name",
            name
        )));
    }
    Ok(())
}

/// A resolved binding source
enum Source {
    KeyValue {
        kind: KeyValueKind,
        name: String,
        data: BTreeMap<String, Vec<u8>>,
    },
    Structured {
        label: String,
        json: Value,
    },
}

impl Source {
    /// Value of a key (key/value kinds) or path expression (structured kinds)
    fn lookup(&self, selector: &str) -> Result<Vec<u8>, Error> {
        match self {
            Source::KeyValue { kind, name, data } => data.get(selector).cloned().ok_or_else(|| {
                Error::configuration(format!(
                    "key '{}' not found in {:?} {}",
                    selector, kind, name
                ))
            }),
            Source::Structured { label, json } => PathExpression::parse(selector)?
                .resolve(json)
                .map(String::into_bytes)
                .map_err(|e| match e {
                    Error::Configuration { message, context } => Error::Configuration {
                        message: format!("{} in {}", message, label),
                        context,
                    },
                    other => other,
                }),
        }
    }

    /// Secondary-secret key for a value read with `selector`
    fn derived_key(&self, selector: &str) -> Result<String, Error> {
        match self {
            Source::KeyValue { .. } => Ok(selector.to_string()),
            Source::Structured { .. } => PathExpression::parse(selector)?.secret_key(),
        }
    }
}

/// Everything one binding adds, collected before touching the pod template
struct Plan {
    secondary_name: String,
    secondary: BTreeMap<String, Vec<u8>>,
    items: Vec<KeyToPath>,
    env: Vec<EnvVar>,
}

impl Plan {
    fn new(secondary_name: String) -> Self {
        Self {
            secondary_name,
            secondary: BTreeMap::new(),
            items: Vec::new(),
            env: Vec::new(),
        }
    }

    fn put(&mut self, key: String, value: Vec<u8>) -> Result<(), Error> {
        check_secret_key(&key)?;
        match self.secondary.get(&key) {
            Some(existing) if *existing != value => Err(Error::configuration(format!(
                "secondary secret key '{}' would receive two different values",
                key
            ))),
            Some(_) => Ok(()),
            None => {
                self.secondary.insert(key, value);
                Ok(())
            }
        }
    }

    fn mount(&mut self, key: String, file: &str) {
        self.items.push(KeyToPath {
            key,
            path: file.to_string(),
            mode: None,
        });
    }

    fn secondary_env(&mut self, env: &str, key: &str) {
        self.env.push(EnvVar {
            name: env.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: self.secondary_name.clone(),
                    key: key.to_string(),
                    optional: None,
                }),
                ..Default::default()
            }),
        });
    }

    fn realize(
        &mut self,
        projection: &ResourceProjection,
        source: &Source,
        cached: Option<&Secret>,
    ) -> Result<(), Error> {
        if let Some(transform) = &projection.transform {
            return self.transform(transform, source, cached);
        }

        let selector = projection
            .from
            .as_deref()
            .or(projection.path.as_deref())
            .ok_or_else(|| Error::configuration("projection has neither from nor path"))?;
        let value = source.lookup(selector)?;

        match (&projection.env, &projection.mount) {
            (Some(env), _) if projection.value => {
                let text = String::from_utf8(value).map_err(|_| {
                    Error::configuration(format!(
                        "value for env {} is not valid UTF-8 text",
                        env
                    ))
                })?;
                self.env.push(workload::plain_env(env, &text));
            }
            (Some(env), _) => match source {
                Source::KeyValue { kind, name, .. } => {
                    self.env.push(key_ref_env(env, *kind, name, selector));
                }
                Source::Structured { .. } => {
                    let key = source.derived_key(selector)?;
                    self.put(key.clone(), value)?;
                    self.secondary_env(env, &key);
                }
            },
            (None, Some(mount)) => {
                let key = match source {
                    Source::KeyValue { .. } => mount.clone(),
                    Source::Structured { .. } => source.derived_key(selector)?,
                };
                self.put(key.clone(), value)?;
                self.mount(key, mount);
            }
            (None, None) => {
                return Err(Error::configuration(
                    "projection must set exactly one of env, mount, transform",
                ))
            }
        }
        Ok(())
    }

    /// Build (or keep) a key store and expose it with its password
    fn transform(
        &mut self,
        transform: &CertTransform,
        source: &Source,
        cached: Option<&Secret>,
    ) -> Result<(), Error> {
        let cert = source.lookup(&transform.cert)?;
        let key = transform
            .private_key
            .as_deref()
            .map(|k| source.lookup(k))
            .transpose()?;

        let expected = match (&transform.type_, &key) {
            (CertTransformType::TrustStore, _) => pki::expected_trust_entries(&cert)?,
            (CertTransformType::KeyStore, Some(key)) => pki::expected_key_entries(&cert, key)?,
            (CertTransformType::KeyStore, None) => {
                return Err(Error::configuration(format!(
                    "KeyStore transform {} requires privateKey",
                    transform.store
                )))
            }
        };

        let cached_data = cached.and_then(|s| s.data.as_ref());
        let password = cached_data
            .and_then(|d| d.get(&transform.password))
            .and_then(|b| String::from_utf8(b.0.clone()).ok())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(pki::gen_password);

        // Keep the previous store when it still holds exactly this material
        let reusable = cached_data
            .and_then(|d| d.get(&transform.store))
            .filter(|b| pki::decode_store(&b.0, &password).ok().as_ref() == Some(&expected))
            .map(|b| b.0.clone());
        let store = match reusable {
            Some(bytes) => bytes,
            None => {
                debug!(store = %transform.store, "building key store");
                match &key {
                    Some(key) => pki::to_key_store(&cert, key, &password)?,
                    None => pki::to_trust_store(&cert, &password)?,
                }
            }
        };

        self.put(transform.store.clone(), store)?;
        self.put(transform.password.clone(), password.into_bytes())?;
        self.mount(transform.store.clone(), &transform.store);
        self.secondary_env(&transform.pass_env, &transform.password);
        Ok(())
    }

    /// Merge the plan into a pod template
    fn apply(
        &self,
        pod: &mut PodSpec,
        binding: &str,
        mount_base: &str,
        templates: &[String],
    ) -> Result<(), Error> {
        let volume_name = binding_volume_name(binding);

        for item in &self.items {
            merge::add_volume(
                pod,
                Volume {
                    name: volume_name.clone(),
                    projected: Some(ProjectedVolumeSource {
                        sources: Some(vec![VolumeProjection {
                            secret: Some(SecretProjection {
                                name: self.secondary_name.clone(),
                                items: Some(vec![item.clone()]),
                                optional: None,
                            }),
                            ..Default::default()
                        }]),
                        default_mode: None,
                    }),
                    ..Default::default()
                },
            )?;
        }

        let container = workload::nuxeo_container_mut(pod)?;
        if !self.items.is_empty() {
            merge::add_volume_mount(
                container,
                VolumeMount {
                    name: volume_name,
                    mount_path: format!("{}/{}", mount_base.trim_end_matches('/'), binding),
                    read_only: Some(true),
                    ..Default::default()
                },
            )?;
        }
        for env in &self.env {
            merge::merge_env(container, env.clone(), None)?;
        }
        for template in templates {
            merge::merge_env(
                container,
                workload::plain_env(workload::NUXEO_TEMPLATES_ENV, template),
                Some(workload::TEMPLATES_DELIMITER),
            )?;
        }
        Ok(())
    }
}

fn key_ref_env(env: &str, kind: KeyValueKind, name: &str, key: &str) -> EnvVar {
    let source = match kind {
        KeyValueKind::Secret => EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: name.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        },
        KeyValueKind::ConfigMap => EnvVarSource {
            config_map_key_ref: Some(ConfigMapKeySelector {
                name: name.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        },
    };
    EnvVar {
        name: env.to_string(),
        value: None,
        value_from: Some(source),
    }
}

fn build_secondary_secret(
    nuxeo: &Nuxeo,
    binding: &str,
    name: &str,
    data: BTreeMap<String, Vec<u8>>,
) -> Result<Secret, Error> {
    let mut metadata = workload::owned_meta(nuxeo, name)?;
    let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(
        workload::COMPONENT_LABEL.to_string(),
        SECONDARY_COMPONENT.to_string(),
    );
    labels.insert(BINDING_LABEL.to_string(), binding.to_string());

    Ok(Secret {
        metadata,
        type_: Some("Opaque".to_string()),
        data: Some(
            data.into_iter()
                .map(|(k, v)| (k, ByteString(v)))
                .collect(),
        ),
        ..Default::default()
    })
}
