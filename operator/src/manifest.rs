//! Builders turning an [`MLFlow`] into the objects it owns.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        batch::v1::{Job, JobSpec},
        core::v1::{
            ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar,
            PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
            PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
            VolumeResourceRequirements,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, OwnerReference},
        util::intstr::IntOrString,
    },
};
use kube::{Resource, ResourceExt, api::ObjectMeta};

use crate::{crd::MLFlow, error::Error, registry::Model, tags::OperatorTags};

pub const MLFLOW_PORT: i32 = 5000;
pub const DEBUG_NODE_PORT: i32 = 30099;
pub const ARTIFACT_FOLDERS: [&str; 2] = ["mlartifacts", "mlruns"];

const APP_LABEL: &str = "app";
const MODEL_SERVE_PORT: i32 = 8080;

pub fn owner_ref(mlflow: &MLFlow) -> Result<OwnerReference, Error> {
    mlflow
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))
}

fn namespace(mlflow: &MLFlow) -> String {
    mlflow.namespace().unwrap_or_else(|| "default".into())
}

fn labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), app.to_string())])
}

fn metadata(mlflow: &MLFlow, name: &str, app: &str) -> Result<ObjectMeta, Error> {
    Ok(ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace(mlflow)),
        labels: Some(labels(app)),
        owner_references: Some(vec![owner_ref(mlflow)?]),
        ..Default::default()
    })
}

fn deployment(
    mlflow: &MLFlow,
    name: &str,
    replicas: i32,
    pod: PodSpec,
) -> Result<Deployment, Error> {
    Ok(Deployment {
        metadata: metadata(mlflow, name, name)?,
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels(name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(name)),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// In-cluster address of the tracking server, handed to model servers.
pub fn tracking_uri(mlflow: &MLFlow) -> String {
    format!(
        "http://{}.{}:{}",
        mlflow.name_any(),
        namespace(mlflow),
        MLFLOW_PORT
    )
}

pub fn pvc_name(mlflow: &MLFlow, folder: &str) -> String {
    format!("{}-{}", mlflow.name_any(), folder)
}

/// Tracking server Deployment. `volumes` are PVC names mounted by folder.
pub fn server_deployment(mlflow: &MLFlow, volumes: &[&str]) -> Result<Deployment, Error> {
    let name = mlflow.name_any();

    let container = Container {
        name: name.clone(),
        image: Some(mlflow.spec.image.clone()),
        image_pull_policy: Some("IfNotPresent".into()),
        command: Some(vec!["mlflow".into()]),
        args: Some(vec![
            "server".into(),
            "--serve-artifacts".into(),
            "--host".into(),
            "0.0.0.0".into(),
            "--port".into(),
            MLFLOW_PORT.to_string(),
        ]),
        env_from: Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: mlflow.spec.config_map_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            container_port: MLFLOW_PORT,
            ..Default::default()
        }]),
        volume_mounts: (!volumes.is_empty()).then(|| {
            volumes
                .iter()
                .zip(ARTIFACT_FOLDERS)
                .map(|(claim, folder)| VolumeMount {
                    name: claim.to_string(),
                    mount_path: format!("/{}", folder),
                    ..Default::default()
                })
                .collect()
        }),
        ..Default::default()
    };

    let pod = PodSpec {
        containers: vec![container],
        volumes: (!volumes.is_empty()).then(|| {
            volumes
                .iter()
                .map(|claim| Volume {
                    name: claim.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect()
        }),
        ..Default::default()
    };

    deployment(mlflow, &name, mlflow.spec.replicas, pod)
}

/// Tracking server Service; a fixed NodePort in debug mode.
pub fn server_service(mlflow: &MLFlow, debug: bool) -> Result<Service, Error> {
    let name = mlflow.name_any();

    Ok(Service {
        metadata: metadata(mlflow, &name, &name)?,
        spec: Some(ServiceSpec {
            selector: Some(labels(&name)),
            type_: Some(if debug { "NodePort" } else { "ClusterIP" }.into()),
            ports: Some(vec![ServicePort {
                port: MLFLOW_PORT,
                protocol: Some("TCP".into()),
                target_port: Some(IntOrString::Int(MLFLOW_PORT)),
                node_port: debug.then_some(DEBUG_NODE_PORT),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Serving Deployment for one model version.
pub fn model_deployment(
    mlflow: &MLFlow,
    model: &Model,
    tags: &OperatorTags,
) -> Result<Deployment, Error> {
    let name = model.deployment_name(&mlflow.name_any());

    let container = Container {
        name: name.clone(),
        image: Some(mlflow.spec.model_image.clone()),
        image_pull_policy: Some("IfNotPresent".into()),
        env: Some(vec![EnvVar {
            name: "MLFLOW_TRACKING_URI".into(),
            value: Some(tracking_uri(mlflow)),
            ..Default::default()
        }]),
        resources: tags.resources(),
        command: Some(vec!["mlflow".into()]),
        args: Some(vec![
            "models".into(),
            "serve".into(),
            "-m".into(),
            format!("models:/{}/{}", model.name, model.version),
            "--host".into(),
            "0.0.0.0".into(),
            "--port".into(),
            MODEL_SERVE_PORT.to_string(),
            "--env-manager".into(),
            "conda".into(),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: MODEL_SERVE_PORT,
            ..Default::default()
        }]),
        ..Default::default()
    };

    let pod = PodSpec {
        containers: vec![container],
        ..Default::default()
    };

    deployment(mlflow, &name, 1, pod)
}

/// Local artifact storage used in debug mode.
pub fn artifact_pvc(mlflow: &MLFlow, folder: &str) -> Result<PersistentVolumeClaim, Error> {
    Ok(PersistentVolumeClaim {
        metadata: metadata(mlflow, &pvc_name(mlflow, folder), &mlflow.name_any())?,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            volume_mode: Some("Filesystem".into()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity("1Gi".into()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// One-off training Job that registers an example model in debug mode.
pub fn example_job(mlflow: &MLFlow, image: &str) -> Result<Job, Error> {
    let name = format!("{}-example", mlflow.name_any());

    Ok(Job {
        metadata: metadata(mlflow, &name, &name)?,
        spec: Some(JobSpec {
            backoff_limit: Some(4),
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    restart_policy: Some("Never".into()),
                    containers: vec![Container {
                        name: name.clone(),
                        image: Some(image.into()),
                        image_pull_policy: Some("IfNotPresent".into()),
                        env: Some(vec![EnvVar {
                            name: "TRACKING_URL".into(),
                            value: Some(tracking_uri(mlflow)),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
