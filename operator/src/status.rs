use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
};
use serde_json::json;
use tracing::debug;

use crate::{
    crd::{MLFlow, MLFlowStatus},
    error::Error,
};

const CONFLICT_RETRIES: usize = 3;

pub const PHASE_PROGRESSING: &str = "Progressing";
pub const PHASE_AVAILABLE: &str = "Available";

pub fn phase(ready: bool) -> String {
    let phase = if ready { PHASE_AVAILABLE } else { PHASE_PROGRESSING };
    phase.to_string()
}

/// Applies `modify` to the freshest status of `name` and writes it back.
///
/// The write is pinned to the resourceVersion it was read at and a conflict
/// re-reads and retries. Nothing is written when the status would not change.
pub async fn update(
    api: &Api<MLFlow>,
    name: &str,
    mut modify: impl FnMut(&mut MLFlowStatus),
) -> Result<MLFlowStatus, Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = api.get_status(name).await?;
        let before = current.status.clone();
        let mut status = before.clone().unwrap_or_default();
        modify(&mut status);

        if before.as_ref() == Some(&status) {
            return Ok(status);
        }

        let patch = json!({
            "metadata": { "resourceVersion": current.resource_version() },
            "status": status,
        });
        match api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => return Ok(status),
            Err(e) => {
                let e = Error::from(e);
                if e.is_conflict() && attempt < CONFLICT_RETRIES {
                    debug!(mlflow = %name, attempt, "status write conflicted, retrying");
                    continue;
                }
                return Err(e);
            }
        }
    }
}
