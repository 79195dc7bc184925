//! Nuxeo operator - reconciles Nuxeo clusters and binds them to backing services
//!
//! A Nuxeo custom resource describes a Nuxeo deployment plus a list of
//! backing-service bindings. Each binding reads values from Secrets,
//! ConfigMaps or arbitrary resources and projects them into the Nuxeo pod as
//! environment variables, mounted files, or Java key stores built from PEM
//! material.
//!
//! # Modules
//!
//! - [`crd`] - The Nuxeo custom resource and its binding types
//! - [`controller`] - Reconcile loop and requeue policy
//! - [`reconcile`] - Generic create-or-update driver, comparers, ownership
//! - [`binding`] - Resource projection engine and preconfigured bindings
//! - [`workload`] - Deployment builder and pod-spec merge utilities
//! - [`pki`] - PEM parsing and JKS trust/key stores
//! - [`config`] - Controller settings
//! - [`telemetry`] - Log subscriber setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod binding;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod pki;
pub mod reconcile;
pub mod telemetry;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for server-side apply of the CRD
pub const FIELD_MANAGER: &str = "nuxeo-operator";
