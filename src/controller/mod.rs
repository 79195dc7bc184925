//! Controller for Nuxeo resources
//!
//! The reconcile loop itself is thin: it builds the desired state and hands
//! the object writes to [`crate::reconcile`] and the bindings to
//! [`crate::binding`].

mod nuxeo;

pub use nuxeo::{error_policy, reconcile, Context, TRANSIENT_REQUEUE};
