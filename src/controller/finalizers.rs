//! Finalizer handling outside of the `kube::runtime::finalizer` helper
//!
//! The watch loops on derived resources let the helper manage their own
//! finalizer. The NetworkPolicy finalizer is different: it is added by the
//! policy watch but released by the KuryrNetworkPolicy watch once the
//! security group is gone, so both ends are patched here.

use kube::{
    api::{Api, Patch, PatchParams},
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

use super::cluster::FIELD_MANAGER;
use crate::error::Result;

/// Whether a deletion was requested and finalizers are holding the object
pub fn is_being_deleted<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// The object's finalizers minus `finalizer`
pub fn without_finalizer<K: Resource>(obj: &K, finalizer: &str) -> Vec<String> {
    obj.finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect()
}

/// Add `finalizer` to `obj`; a no-op when it is already there
pub async fn add_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    if has_finalizer(obj, finalizer) {
        return Ok(());
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        &obj.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    debug!("Added finalizer {} to {}", finalizer, obj.name_any());
    Ok(())
}

/// Drop `finalizer` from `obj`; a no-op when it is not there
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    if !has_finalizer(obj, finalizer) {
        return Ok(());
    }
    let patch = json!({
        "metadata": {
            "finalizers": without_finalizer(obj, finalizer)
        }
    });
    api.patch(
        &obj.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    info!("Removed finalizer {} from {}", finalizer, obj.name_any());
    Ok(())
}
