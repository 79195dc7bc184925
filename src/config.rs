//! Controller settings
//!
//! Every setting is a command-line flag with an environment fallback, so the
//! same binary works from a shell and from a Deployment manifest.

use std::time::Duration;

use clap::Args;

use crate::binding::DEFAULT_MOUNT_BASE;
use crate::Error;

/// Default interval between periodic passes over a healthy Nuxeo resource
pub const DEFAULT_REQUEUE_SECS: u64 = 300;

/// Settings of the `controller` subcommand
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Only watch Nuxeo resources in this namespace (all namespaces when unset)
    #[arg(long, env = "NUXEO_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Directory under which binding files are mounted, one subdirectory per binding
    #[arg(long, env = "NUXEO_BINDING_MOUNT_BASE", default_value = DEFAULT_MOUNT_BASE)]
    pub binding_mount_base: String,

    /// Seconds between passes over a resource, and the delay after a
    /// configuration error
    #[arg(long, env = "NUXEO_REQUEUE_SECS", default_value_t = DEFAULT_REQUEUE_SECS)]
    pub requeue_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            binding_mount_base: DEFAULT_MOUNT_BASE.to_string(),
            requeue_secs: DEFAULT_REQUEUE_SECS,
        }
    }
}

impl ControllerConfig {
    /// Requeue interval as a Duration
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_secs)
    }

    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if !self.binding_mount_base.starts_with('/') {
            return Err(Error::configuration_for(
                "binding-mount-base",
                format!("must be an absolute path, got '{}'", self.binding_mount_base),
            ));
        }
        if self.requeue_secs == 0 {
            return Err(Error::configuration_for(
                "requeue-secs",
                "must be greater than zero",
            ));
        }
        if self.watch_namespace.as_deref() == Some("") {
            return Err(Error::configuration_for(
                "watch-namespace",
                "must not be empty when set",
            ));
        }
        Ok(())
    }
}
