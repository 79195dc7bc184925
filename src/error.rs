//! Error types for the Nuxeo operator
//!
//! Errors fall into three families that the controller treats differently:
//! configuration errors caused by the Nuxeo resource's content (never retried
//! automatically), transient platform errors (re-driven by the control loop),
//! and ownership conflicts (a same-named object belongs to someone else).

use thiserror::Error;

use crate::pki::PkiError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Nuxeo operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The Nuxeo resource asks for something that cannot be built
    #[error("configuration error [{context}]: {message}")]
    Configuration {
        /// Where the problem was found (binding name, container, volume...)
        context: String,
        /// Description of what's invalid
        message: String,
    },

    /// An object with the expected name exists but belongs to another owner
    #[error("{kind} {namespace}/{name} exists and is not owned by this Nuxeo resource")]
    OwnershipConflict {
        /// Kind of the conflicting object
        kind: String,
        /// Namespace of the conflicting object
        namespace: String,
        /// Name of the conflicting object
        name: String,
    },

    /// PEM decoding or key store encoding failed
    #[error("certificate error: {source}")]
    Certificate {
        /// The underlying PKI error
        #[from]
        source: PkiError,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a configuration error without specific context
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            context: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a configuration error attributed to a binding, volume, container...
    pub fn configuration_for(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create an ownership conflict error
    pub fn ownership_conflict(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::OwnershipConflict {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Attach a binding name to configuration errors raised without context
    pub fn in_binding(self, binding: &str) -> Self {
        match self {
            Error::Configuration { context, message } if context == UNKNOWN_CONTEXT => {
                Error::Configuration {
                    context: format!("binding {}", binding),
                    message,
                }
            }
            other => other,
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration, ownership, certificate and serialization errors come from
    /// the resource's content and will not resolve by re-running the pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                // Stale resourceVersion and throttling clear up on their own; a
                // missing binding source is usually published later by its operator
                kube::Error::Api(ae) if matches!(ae.code, 404 | 409 | 429) => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Configuration { .. } => false,
            Error::OwnershipConflict { .. } => false,
            Error::Certificate { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for errors the user must fix in the Nuxeo resource
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Configuration { .. } | Error::Certificate { .. }
        )
    }
}
