//! Ownership tracking by owner-reference UID

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::Nuxeo;
use crate::Error;

/// True iff any owner reference on `meta` carries `uid`
pub fn is_owner(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
}

/// True when `observed` is owned by someone other than the owners of `desired`
///
/// Objects without owner references are not in conflict, and neither are
/// desired objects that carry no owner.
pub fn conflicts(desired: &ObjectMeta, observed: &ObjectMeta) -> bool {
    let wanted: Vec<&str> = desired
        .owner_references
        .iter()
        .flatten()
        .map(|r| r.uid.as_str())
        .collect();
    if wanted.is_empty() {
        return false;
    }
    match observed.owner_references.as_deref() {
        None | Some([]) => false,
        Some(_) => !wanted.iter().any(|uid| is_owner(observed, uid)),
    }
}

/// Controller owner reference pointing at a Nuxeo resource
pub fn owner_reference(nuxeo: &Nuxeo) -> Result<OwnerReference, Error> {
    nuxeo.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "owner_reference",
            format!("Nuxeo {} has no uid yet", nuxeo.name_any()),
        )
    })
}

/// UID of a Nuxeo resource
pub fn owner_uid(nuxeo: &Nuxeo) -> Result<String, Error> {
    nuxeo.uid().ok_or_else(|| {
        Error::internal_with_context(
            "owner_uid",
            format!("Nuxeo {} has no uid yet", nuxeo.name_any()),
        )
    })
}

#[cfg(test)]
pub(crate) fn owned_by(uids: &[&str]) -> ObjectMeta {
    ObjectMeta {
        owner_references: Some(
            uids.iter()
                .map(|uid| OwnerReference {
                    api_version: "appzygy.net/v1alpha1".to_string(),
                    kind: "Nuxeo".to_string(),
                    name: format!("owner-{}", uid),
                    uid: uid.to_string(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                })
                .collect(),
        ),
        ..Default::default()
    }
}
