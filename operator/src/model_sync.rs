//! Periodic deployment of the registry's production models.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, ResourceExt};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info, warn};

use crate::{
    converge::ensure,
    crd::{MAX_SYNC_INTERVAL_MINUTES, MLFlow, ResourceRef},
    error::Error,
    event::{Ctx, with_event},
    finalizer::is_deleting,
    manifest,
    registry::{Model, RegistryClient},
    status,
    tags::OperatorTags,
};

/// Background sync tasks keyed by MLFlow UID. A key runs at most one task.
#[derive(Default)]
pub struct SyncTasks {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SyncTasks {
    /// Spawns `task` unless one is already running for `key`.
    /// Returns whether it was spawned. Finished tasks are dropped first.
    pub fn start_once<F>(&self, key: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|_, h| !h.is_finished());
        if tasks.contains_key(key) {
            return false;
        }
        tasks.insert(key.to_string(), tokio::spawn(task));
        true
    }

    /// Aborts the task for `key`. Returns whether one was running.
    pub fn stop(&self, key: &str) -> bool {
        let handle = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match handle {
            Some(handle) => {
                let running = !handle.is_finished();
                handle.abort();
                running
            }
            None => false,
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|h| !h.is_finished())
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct SyncReport {
    pub deployed: Vec<String>,
    pub failed: Vec<Model>,
}

/// Sync period, clamped to `1..=MAX_SYNC_INTERVAL_MINUTES` minutes.
pub fn period(mlflow: &MLFlow) -> Duration {
    let minutes = mlflow
        .spec
        .model_sync_interval_minutes
        .clamp(1, MAX_SYNC_INTERVAL_MINUTES);
    Duration::from_secs(minutes.saturating_mul(60))
}

pub struct ModelSync {
    ctx: Arc<Ctx>,
    registry: RegistryClient,
    name: String,
    namespace: String,
    uid: Option<String>,
}

impl ModelSync {
    pub fn new(ctx: Arc<Ctx>, registry: RegistryClient, mlflow: &MLFlow) -> Self {
        Self {
            ctx,
            registry,
            name: mlflow.name_any(),
            namespace: mlflow.namespace().unwrap_or_else(|| "default".into()),
            uid: mlflow.uid(),
        }
    }

    /// Ticks every `period`, the first one immediately, until the MLFlow it
    /// serves is gone or being deleted.
    pub async fn run(self, period: Duration) {
        let api: Api<MLFlow> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            mlflow = %self.name,
            namespace = %self.namespace,
            registry = %self.registry.base_url(),
            ?period,
            "model sync started"
        );

        loop {
            ticker.tick().await;
            let mlflow = match api.get_opt(&self.name).await {
                Ok(Some(m)) if m.uid() == self.uid && !is_deleting(&m) => m,
                Ok(_) => {
                    info!(mlflow = %self.name, namespace = %self.namespace, "MLFlow is gone, stopping model sync");
                    return;
                }
                Err(e) => {
                    warn!(mlflow = %self.name, error = %e, "unable to fetch MLFlow, skipping tick");
                    continue;
                }
            };

            match self.tick(&mlflow).await {
                Ok(report) => info!(
                    mlflow = %self.name,
                    deployed = report.deployed.len(),
                    failed = report.failed.len(),
                    "model sync tick finished"
                ),
                Err(e) => warn!(mlflow = %self.name, error = %e, "unable to list production models"),
            }
        }
    }

    /// One pass over the production models. Only the listing can fail the
    /// tick; every model is handled independently.
    pub async fn tick(&self, mlflow: &MLFlow) -> Result<SyncReport, Error> {
        let models = self.registry.get_production_models().await?;
        let mut report = SyncReport::default();

        for model in models {
            match self.sync_model(mlflow, &model).await {
                Some(name) => report.deployed.push(name),
                None => report.failed.push(model),
            }
        }
        Ok(report)
    }

    async fn sync_model(&self, mlflow: &MLFlow, model: &Model) -> Option<String> {
        let detail = match self
            .registry
            .get_model_version_detail(&model.name, &model.version)
            .await
        {
            Ok(detail) => detail,
            Err(e) => {
                warn!(%model, error = %e, "unable to fetch model version, skipping");
                return None;
            }
        };

        let tags = OperatorTags::parse(&detail.tags);
        let desired = match manifest::model_deployment(mlflow, model, &tags) {
            Ok(d) => d,
            Err(e) => {
                error!(%model, error = %e, "unable to build model Deployment");
                return None;
            }
        };
        let deployment_name = desired.name_any();

        let api: Api<Deployment> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        let deployment = match with_event(
            &self.ctx,
            mlflow,
            "ModelDeploymentReconciled",
            &format!("Serving {model} as {deployment_name}"),
            "ModelDeploymentFailed",
            ensure(&api, desired),
        )
        .await
        {
            Ok((_, deployment)) => deployment,
            Err(e) => {
                error!(%model, deployment = %deployment_name, error = %e, "unable to deploy model");
                self.describe(
                    model,
                    &format!(
                        "mlflow-operator failed to deploy version {} as {}: {}",
                        model.version, deployment_name, e
                    ),
                )
                .await;
                return None;
            }
        };

        let mlflows: Api<MLFlow> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        let reference = ResourceRef::of(&deployment);
        if let Err(e) = status::update(&mlflows, &self.name, |s| {
            s.models.insert(deployment_name.clone(), reference.clone());
        })
        .await
        {
            warn!(%model, error = %e, "unable to record model Deployment in status");
        }

        self.describe(
            model,
            &format!(
                "Version {} is served by mlflow-operator as Deployment {} in namespace {}",
                model.version, deployment_name, self.namespace
            ),
        )
        .await;
        info!(%model, deployment = %deployment_name, "model synced");
        Some(deployment_name)
    }

    async fn describe(&self, model: &Model, message: &str) {
        if let Err(e) = self.registry.update_description(&model.name, message).await {
            warn!(%model, error = %e, "unable to update model description");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        registry::fake::FakeTransport,
        testing::{FakeApiServer, MLFLOW_PATH, deployment_path, mlflow, settings},
    };
    use http::Method;
    use serde_json::json;

    const BASE: &str = "http://mlflow.ml:5000/api/2.0/mlflow";

    fn registry_with_abc() -> Arc<FakeTransport> {
        let transport = FakeTransport::new();
        transport.respond(
            &format!("{BASE}/registered-models/search"),
            json!({
                "registered_models": [
                    {"name": "A", "latest_versions": [
                        {"name": "A", "version": "1", "current_stage": "Staging"},
                        {"name": "A", "version": "2", "current_stage": "Production"},
                    ]},
                    {"name": "B", "latest_versions": [
                        {"name": "B", "version": "1", "current_stage": "Production"},
                    ]},
                    {"name": "C", "latest_versions": [
                        {"name": "C", "version": "1", "current_stage": "Staging"},
                    ]},
                ]
            })
            .to_string(),
        );
        for (name, version, tags) in [
            ("A", "2", json!([{"key": "mlflowOperator-cpuLimit", "value": "500m"}])),
            ("B", "1", json!([])),
        ] {
            transport.respond(
                &format!("{BASE}/model-versions/get?name={name}&version={version}"),
                json!({"model_version": {"name": name, "version": version, "tags": tags}})
                    .to_string(),
            );
        }
        transport.respond(
            &format!("{BASE}/registered-models/update"),
            json!({"registered_model": {"name": "A"}}).to_string(),
        );
        transport
    }

    fn sync(transport: Arc<FakeTransport>) -> (ModelSync, FakeApiServer) {
        let (client, server) = FakeApiServer::start();
        server.insert(MLFLOW_PATH, mlflow());
        let ctx = Arc::new(Ctx::new(client, settings(), transport.clone()));
        let registry = RegistryClient::new(transport, BASE);
        (ModelSync::new(ctx, registry, &mlflow()), server)
    }

    #[tokio::test]
    async fn deploys_only_production_versions() {
        let transport = registry_with_abc();
        let (sync, server) = sync(transport.clone());

        let report = sync.tick(&mlflow()).await.unwrap();

        assert_eq!(report.deployed, ["mlflow-a-2-model", "mlflow-b-1-model"]);
        assert!(report.failed.is_empty());
        assert_eq!(
            server.count(Method::POST, "/apis/apps/v1/namespaces/ml/deployments"),
            2
        );
        assert!(server.get(&deployment_path("mlflow-c-1-model")).is_none());

        let a = server.get(&deployment_path("mlflow-a-2-model")).unwrap();
        assert_eq!(
            a["spec"]["template"]["spec"]["containers"][0]["resources"]["limits"]["cpu"],
            "500m"
        );

        let status = &server.get(MLFLOW_PATH).unwrap()["status"]["models"];
        assert_eq!(status["mlflow-a-2-model"]["kind"], "Deployment");
        assert_eq!(status["mlflow-b-1-model"]["name"], "mlflow-b-1-model");

        assert_eq!(
            transport
                .calls_to("PATCH", &format!("{BASE}/registered-models/update"))
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn failed_detail_does_not_block_siblings() {
        let transport = registry_with_abc();
        transport
            .responses
            .lock()
            .unwrap()
            .remove(&format!("{BASE}/model-versions/get?name=A&version=2"));
        let (sync, server) = sync(transport);

        let report = sync.tick(&mlflow()).await.unwrap();

        assert_eq!(report.deployed, ["mlflow-b-1-model"]);
        assert_eq!(report.failed, [Model::new("A", "2")]);
        assert!(server.get(&deployment_path("mlflow-a-2-model")).is_none());
    }

    #[tokio::test]
    async fn failed_deployment_is_described_and_skipped() {
        let transport = registry_with_abc();
        let (sync, server) = sync(transport.clone());
        server.fail_once(Method::GET, &deployment_path("mlflow-a-2-model"), 500);

        let report = sync.tick(&mlflow()).await.unwrap();

        assert_eq!(report.deployed, ["mlflow-b-1-model"]);
        assert_eq!(report.failed, [Model::new("A", "2")]);
        let status = &server.get(MLFLOW_PATH).unwrap()["status"]["models"];
        assert!(status.get("mlflow-a-2-model").is_none());
        // failure for A, success for B
        assert_eq!(
            transport
                .calls_to("PATCH", &format!("{BASE}/registered-models/update"))
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn second_tick_changes_nothing() {
        let (sync, server) = sync(registry_with_abc());

        sync.tick(&mlflow()).await.unwrap();
        sync.tick(&mlflow()).await.unwrap();

        assert_eq!(server.count(Method::POST, "/apis/apps/v1"), 2);
        assert_eq!(server.count(Method::PUT, "/apis/apps/v1"), 0);
    }

    #[tokio::test]
    async fn listing_failure_fails_the_tick() {
        let (sync, server) = sync(FakeTransport::new());

        assert!(sync.tick(&mlflow()).await.is_err());
        assert_eq!(server.count(Method::POST, "/apis/apps/v1"), 0);
    }

    #[tokio::test]
    async fn run_stops_when_mlflow_is_gone() {
        let (client, server) = FakeApiServer::start();
        let transport = FakeTransport::new();
        let ctx = Arc::new(Ctx::new(client, settings(), transport.clone()));
        let sync = ModelSync::new(ctx, RegistryClient::new(transport, BASE), &mlflow());

        tokio::time::timeout(Duration::from_secs(5), sync.run(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(server.count(Method::GET, MLFLOW_PATH), 1);
    }

    #[tokio::test]
    async fn start_once_per_key() {
        let tasks = SyncTasks::default();
        let started = Arc::new(AtomicUsize::new(0));
        let task = |started: Arc<AtomicUsize>| async move {
            started.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await
        };

        assert!(tasks.start_once("uid-1", task(started.clone())));
        assert!(!tasks.start_once("uid-1", task(started.clone())));
        assert!(tasks.start_once("uid-2", task(started.clone())));
        tokio::task::yield_now().await;
        assert!(tasks.is_running("uid-1"));

        assert!(tasks.stop("uid-1"));
        assert!(!tasks.is_running("uid-1"));
        assert!(!tasks.stop("uid-1"));
        assert!(tasks.is_running("uid-2"));
    }

    #[tokio::test]
    async fn finished_tasks_are_evicted() {
        let tasks = SyncTasks::default();
        assert!(tasks.start_once("uid-1", async {}));
        while tasks.is_running("uid-1") {
            tokio::task::yield_now().await;
        }

        assert!(tasks.start_once("uid-2", std::future::pending::<()>()));
        let keys: Vec<String> = tasks.tasks.lock().unwrap().keys().cloned().collect();
        assert_eq!(keys, ["uid-2"]);

        assert!(tasks.start_once("uid-1", std::future::pending::<()>()));
        assert!(tasks.is_running("uid-1"));
    }

    #[tokio::test]
    async fn failed_status_write_still_counts_as_deployed() {
        let transport = registry_with_abc();
        let (sync, server) = sync(transport.clone());
        server.fail_once(Method::PATCH, &format!("{MLFLOW_PATH}/status"), 500);

        let report = sync.tick(&mlflow()).await.unwrap();

        assert_eq!(report.deployed, ["mlflow-a-2-model", "mlflow-b-1-model"]);
        assert!(report.failed.is_empty());
        let models = &server.get(MLFLOW_PATH).unwrap()["status"]["models"];
        assert!(models.get("mlflow-a-2-model").is_none());
        assert_eq!(models["mlflow-b-1-model"]["name"], "mlflow-b-1-model");
        assert_eq!(
            transport
                .calls_to("PATCH", &format!("{BASE}/registered-models/update"))
                .len(),
            2
        );
    }

    #[test]
    fn period_follows_interval() {
        let mut m = mlflow();
        assert_eq!(period(&m), Duration::from_secs(60));
        m.spec.model_sync_interval_minutes = 15;
        assert_eq!(period(&m), Duration::from_secs(900));
    }

    #[tokio::test]
    async fn oversized_interval_is_clamped() {
        let mut m = mlflow();
        for minutes in [u64::MAX / 2, 1 << 62, u64::MAX] {
            m.spec.model_sync_interval_minutes = minutes;
            let p = period(&m);
            assert_eq!(p, Duration::from_secs(MAX_SYNC_INTERVAL_MINUTES * 60));
            // a zero period would panic here
            let _ = tokio::time::interval(p);
        }

        m.spec.model_sync_interval_minutes = 0;
        assert_eq!(period(&m), Duration::from_secs(60));
    }
}
