//! Nuxeo controller
//!
//! One pass over a Nuxeo resource:
//!
//! 1. validate the spec
//! 2. build the desired Deployment
//! 3. project every binding onto its pod template; bindings with a
//!    configuration error are skipped so the others still reach the cluster,
//!    while a transient failure ends the pass before any workload write
//! 4. persist the combined binding configuration text into the
//!    `<name>-binding-conf` ConfigMap and mount it, or remove it when empty
//! 5. reconcile the Deployment
//! 6. report the first binding failure, if any, so the pass is retried

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::binding::{Binder, KindRegistry, KubeResourceReader, ResourceReader};
use crate::config::ControllerConfig;
use crate::crd::Nuxeo;
use crate::reconcile::comparer::{ConfigMapComparer, DeploymentComparer};
use crate::reconcile::{self as driver, KubeObjectClient, ObjectClient, RemoveOutcome};
use crate::workload;
use crate::Error;

/// Delay before retrying a pass that failed on a transient error
pub const TRANSIENT_REQUEUE: Duration = Duration::from_secs(5);

/// Controller context shared by every reconcile call
pub struct Context {
    /// Deployment access
    pub deployments: Arc<dyn ObjectClient<Deployment>>,
    /// ConfigMap access (binding configuration text)
    pub config_maps: Arc<dyn ObjectClient<ConfigMap>>,
    /// Secret access (secondary secrets)
    pub secrets: Arc<dyn ObjectClient<Secret>>,
    /// Reads of the resources bindings point at
    pub reader: Arc<dyn ResourceReader>,
    /// Kind lookups for binding references
    pub registry: KindRegistry,
    /// Controller settings
    pub config: ControllerConfig,
}

impl Context {
    /// Context backed by the Kubernetes API
    pub fn new(client: Client, registry: KindRegistry, config: ControllerConfig) -> Self {
        let objects = Arc::new(KubeObjectClient::new(client.clone()));
        Self {
            deployments: objects.clone(),
            config_maps: objects.clone(),
            secrets: objects,
            reader: Arc::new(KubeResourceReader::new(client)),
            registry,
            config,
        }
    }
}

/// Reconcile a Nuxeo resource
#[instrument(skip(nuxeo, ctx), fields(nuxeo = %nuxeo.name_any()))]
pub async fn reconcile(nuxeo: Arc<Nuxeo>, ctx: Arc<Context>) -> Result<Action, Error> {
    info!("reconciling nuxeo");

    nuxeo.spec.validate()?;
    let name = nuxeo.name_any();
    let namespace = nuxeo
        .namespace()
        .ok_or_else(|| Error::configuration_for("metadata", "Nuxeo resource has no namespace"))?;
    let owner_uid = driver::ownership::owner_uid(&nuxeo)?;

    let mut deployment = workload::build_deployment(&nuxeo)?;
    let pod = workload::pod_spec_mut(&mut deployment)?;

    let binder = Binder::new(
        &ctx.registry,
        ctx.reader.as_ref(),
        ctx.secrets.as_ref(),
        &ctx.config.binding_mount_base,
    );
    let mut report = binder.project_all(&nuxeo, pod).await;
    if let Some(error) = report.take_transient() {
        // The live Deployment keeps the binding until its sources read again
        warn!(%error, "transient binding failure, leaving the workload as is");
        return Err(error);
    }

    let conf_name = workload::binding_conf_name(&nuxeo);
    if report.nuxeo_conf.is_empty() {
        let removed = driver::remove_if_owned::<ConfigMap>(
            ctx.config_maps.as_ref(),
            &namespace,
            &conf_name,
            &owner_uid,
        )
        .await?;
        if removed == RemoveOutcome::NotOwned {
            warn!(config_map = %conf_name, "binding configuration name is taken by another owner");
        }
    } else {
        let desired = workload::build_binding_conf(&nuxeo, &report.nuxeo_conf)?;
        let outcome = driver::reconcile(
            ctx.config_maps.as_ref(),
            &namespace,
            &conf_name,
            &desired,
            &ConfigMapComparer,
        )
        .await?;
        debug!(?outcome, "binding configuration reconciled");
        workload::mount_binding_conf(&nuxeo, pod)?;
    }

    let outcome = driver::reconcile(
        ctx.deployments.as_ref(),
        &namespace,
        &name,
        &deployment,
        &DeploymentComparer,
    )
    .await?;
    info!(
        ?outcome,
        applied = report.applied.len(),
        failed = report.failed.len(),
        "deployment reconciled"
    );

    match report.into_error() {
        Some(e) => Err(e),
        None => Ok(Action::requeue(ctx.config.requeue_interval())),
    }
}

/// Requeue policy for failed passes
///
/// Transient platform errors retry quickly. Errors the user has to fix in the
/// resource wait for the regular interval; editing the resource triggers a
/// new pass anyway.
pub fn error_policy(nuxeo: Arc<Nuxeo>, error: &Error, ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(%error, nuxeo = %nuxeo.name_any(), "reconciliation failed, retrying");
        Action::requeue(TRANSIENT_REQUEUE)
    } else {
        error!(%error, nuxeo = %nuxeo.name_any(), "reconciliation failed");
        Action::requeue(ctx.config.requeue_interval())
    }
}
