use std::sync::Arc;

use k8s_openapi::api::{
    apps::v1::Deployment,
    batch::v1::Job,
    core::v1::{PersistentVolumeClaim, Service},
};
use kube::{Api, ResourceExt};
use kube_runtime::{controller::Action, events::EventType};
use tracing::{debug, info, warn};

use crate::{
    converge::{ensure, ensure_present, is_ready},
    crd::{MLFlow, ResourceRef},
    error::Error,
    event::{Ctx, emit_event, with_event},
    finalizer::{FINALIZER, ensure_finalizer_present, is_deleting, remove_finalizer},
    manifest::{self, ARTIFACT_FOLDERS},
    model_sync::{self, ModelSync},
    registry::{self, RegistryClient},
    status,
};

pub async fn reconcile(obj: Arc<MLFlow>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let ns = obj.namespace().unwrap_or_else(|| "default".into());
    let name = obj.name_any();
    let api: Api<MLFlow> = Api::namespaced(ctx.client.clone(), &ns);

    let Some(mlflow) = api.get_opt(&name).await? else {
        debug!(mlflow = %name, namespace = %ns, "MLFlow no longer exists");
        return Ok(Action::await_change());
    };
    let uid = mlflow
        .uid()
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

    if is_deleting(&mlflow) {
        if ctx.syncs.stop(&uid) {
            info!(mlflow = %name, namespace = %ns, "stopped model sync");
        }
        remove_finalizer(&api, &mlflow, FINALIZER).await?;
        return Ok(Action::await_change());
    }

    info!(mlflow = %name, namespace = %ns, "reconciling MLFlow");
    ensure_finalizer_present(&api, &mlflow, FINALIZER).await?;

    let volumes = if ctx.settings.debug {
        ensure_artifact_volumes(&ctx, &mlflow, &ns).await?
    } else {
        Vec::new()
    };
    let volumes: Vec<&str> = volumes.iter().map(String::as_str).collect();

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ns);
    let (_, deployment) = with_event(
        &ctx,
        &mlflow,
        "ServerDeploymentReconciled",
        "Tracking server Deployment converged",
        "ServerDeploymentFailed",
        ensure(&deployments, manifest::server_deployment(&mlflow, &volumes)?),
    )
    .await?;

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &ns);
    with_event(
        &ctx,
        &mlflow,
        "ServerServiceReconciled",
        "Tracking server Service converged",
        "ServerServiceFailed",
        ensure(&services, manifest::server_service(&mlflow, ctx.settings.debug)?),
    )
    .await?;

    let ready = is_ready(&deployment);
    let active = ResourceRef::of(&deployment);
    status::update(&api, &name, |s| {
        s.active = Some(active.clone());
        s.phase = Some(status::phase(ready));
    })
    .await?;

    if !ready {
        info!(mlflow = %name, namespace = %ns, "tracking server not ready yet");
        return Ok(Action::requeue(ctx.settings.readiness_requeue()));
    }

    if ctx.settings.debug {
        let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
        with_event(
            &ctx,
            &mlflow,
            "ExampleJobCreated",
            "Example training Job created",
            "ExampleJobFailed",
            ensure_present(
                &jobs,
                manifest::example_job(&mlflow, &ctx.settings.example_job_image)?,
            ),
        )
        .await?;
    }

    let registry = RegistryClient::new(
        ctx.transport.clone(),
        registry::base_url(&name, &ns, ctx.settings.registry_override()),
    );
    let sync = ModelSync::new(ctx.clone(), registry, &mlflow);
    if ctx.syncs.start_once(&uid, sync.run(model_sync::period(&mlflow))) {
        info!(mlflow = %name, namespace = %ns, "model sync scheduled");
        let _ = emit_event(
            &ctx,
            &mlflow,
            "ModelSyncStarted",
            "Syncing production models from the registry",
            EventType::Normal,
        )
        .await;
    }

    Ok(Action::requeue(ctx.settings.resync()))
}

pub fn error_policy(obj: Arc<MLFlow>, error: &Error, ctx: Arc<Ctx>) -> Action {
    warn!(mlflow = %obj.name_any(), error = %error, "reconcile failed");
    Action::requeue(ctx.settings.error_requeue())
}

/// Creates the debug artifact claims when absent and returns their names.
async fn ensure_artifact_volumes(
    ctx: &Ctx,
    mlflow: &MLFlow,
    ns: &str,
) -> Result<Vec<String>, Error> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), ns);
    let mut names = Vec::with_capacity(ARTIFACT_FOLDERS.len());
    for folder in ARTIFACT_FOLDERS {
        let (_, pvc) = with_event(
            ctx,
            mlflow,
            "ArtifactVolumeCreated",
            "Artifact PersistentVolumeClaim created",
            "ArtifactVolumeFailed",
            ensure_present(&pvcs, manifest::artifact_pvc(mlflow, folder)?),
        )
        .await?;
        names.push(pvc.name_any());
    }
    Ok(names)
}
