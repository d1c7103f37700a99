use std::collections::BTreeMap;

use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const MAX_SYNC_INTERVAL_MINUTES: u64 = 10080;

pub const DEFAULT_MODEL_IMAGE: &str = "erayarslan/mlflow_serve:v2.6.0-conda";

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "mlflow.jedimindtricks.example",
    version = "v1beta1",
    kind = "MLFlow",
    plural = "mlflows",
    derive = "Default",
    status = "MLFlowStatus",
    shortname = "mlf",
    namespaced
)]
pub struct MLFlowSpec {
    /// Image of the MLflow tracking server.
    pub image: String,

    #[serde(default = "default_replicas")]
    #[schemars(range(min = 1))]
    pub replicas: i32,

    /// ConfigMap injected into the tracking server as environment.
    #[schemars(length(min = 1))]
    pub config_map_name: String,

    #[serde(default = "default_model_image")]
    pub model_image: String,

    /// Minutes between model syncs, at most one week.
    #[serde(default = "default_sync_interval")]
    #[schemars(range(min = 1, max = 10080))]
    pub model_sync_interval_minutes: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MLFlowStatus {
    pub phase: Option<String>,
    pub active: Option<ResourceRef>,
    #[serde(default)]
    pub models: BTreeMap<String, ResourceRef>,
}

/// Points at an object this operator manages.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub uid: Option<String>,
}

impl ResourceRef {
    pub fn of<K>(obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            name: obj.name_any(),
            namespace: obj.namespace(),
            uid: obj.uid(),
        }
    }
}

fn default_replicas() -> i32 {
    1
}
fn default_model_image() -> String {
    DEFAULT_MODEL_IMAGE.into()
}
fn default_sync_interval() -> u64 {
    1
}
