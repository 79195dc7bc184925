//! Nuxeo operator - reconciles Nuxeo clusters and binds them to backing services

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, Resource};
use serde::de::DeserializeOwned;

use nuxeo_operator::binding::KindRegistry;
use nuxeo_operator::config::ControllerConfig;
use nuxeo_operator::controller::{error_policy, reconcile, Context};
use nuxeo_operator::crd::Nuxeo;
use nuxeo_operator::telemetry::init_telemetry;
use nuxeo_operator::FIELD_MANAGER;

/// Nuxeo operator - deploys Nuxeo and binds it to backing services
#[derive(Parser, Debug)]
#[command(name = "nuxeo-operator", version, about, long_about = None)]
struct Cli {
    /// Print the Nuxeo CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: ControllerConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    ///
    /// Installs the Nuxeo CRD, then watches Nuxeo resources and the
    /// Deployments, Secrets and ConfigMaps they own.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry().map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Nuxeo::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.config).await,
    }
}

/// Install or update the Nuxeo CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing Nuxeo CRD...");
    crds.patch(
        "nuxeos.appzygy.net",
        &params,
        &Patch::Apply(&Nuxeo::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Nuxeo CRD: {}", e))?;
    Ok(())
}

/// Api scoped to the watched namespace, or cluster-wide
fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid controller settings: {}", e))?;
    tracing::info!(?config, "Nuxeo controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let registry = match KindRegistry::from_discovery(client.clone()).await {
        Ok(registry) => registry,
        Err(e) => {
            // Bindings to builtin kinds still work without discovery
            tracing::warn!(error = %e, "API discovery failed, using builtin kinds only");
            KindRegistry::with_builtins()
        }
    };

    let namespace = config.watch_namespace.clone();
    let ns = namespace.as_deref();
    let nuxeos: Api<Nuxeo> = scoped(&client, ns);
    let deployments: Api<Deployment> = scoped(&client, ns);
    let secrets: Api<Secret> = scoped(&client, ns);
    let config_maps: Api<ConfigMap> = scoped(&client, ns);

    let ctx = Arc::new(Context::new(client, registry, config));

    tracing::info!(namespace = ?namespace, "Starting Nuxeo controller");

    Controller::new(nuxeos, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .owns(secrets, WatcherConfig::default())
        .owns(config_maps, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Nuxeo reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Nuxeo reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Nuxeo controller stopped");
    Ok(())
}
