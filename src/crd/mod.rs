//! Custom Resource Definitions for the Nuxeo operator

mod nuxeo;
mod types;

pub use nuxeo::{Nuxeo, NuxeoSpec};
pub use types::{
    BackingService, BackingServiceResource, CertTransform, CertTransformType,
    PreconfiguredBackingService, ResourceProjection,
};
