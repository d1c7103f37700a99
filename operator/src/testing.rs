//! Shared fixtures and an in-memory API server for controller tests.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use clap::Parser;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use kube::{Client, api::ObjectMeta, client::Body};
use serde_json::{Value, json};

use crate::{
    config::{Args, Settings},
    crd::{MLFlow, MLFlowSpec},
};

pub fn mlflow() -> MLFlow {
    MLFlow {
        metadata: ObjectMeta {
            name: Some("mlflow".into()),
            namespace: Some("ml".into()),
            uid: Some("uid-1".into()),
            ..Default::default()
        },
        spec: MLFlowSpec {
            image: "ghcr.io/mlflow/mlflow:v2.6.0".into(),
            replicas: 2,
            config_map_name: "mlflow-env".into(),
            model_image: "mlflow-serve:2.6.0".into(),
            model_sync_interval_minutes: 1,
        },
        status: None,
    }
}

pub fn settings() -> Settings {
    Args::parse_from(["mlflow-operator"]).settings
}

pub const MLFLOW_PATH: &str = "/apis/mlflow.jedimindtricks.example/v1beta1/namespaces/ml/mlflows/mlflow";

pub fn deployment_path(name: &str) -> String {
    format!("/apis/apps/v1/namespaces/ml/deployments/{name}")
}

pub fn service_path(name: &str) -> String {
    format!("/api/v1/namespaces/ml/services/{name}")
}

type Handle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// Stores objects by their API path and answers the subset of verbs the
/// controller uses: get, create, replace and patch (including status).
/// Server-side apply of a missing object creates it, as events need.
#[derive(Clone, Default)]
pub struct FakeApiServer {
    objects: Arc<Mutex<BTreeMap<String, Value>>>,
    calls: Arc<Mutex<Vec<(Method, String)>>>,
    failures: Arc<Mutex<Vec<(Method, String, u16)>>>,
}

impl FakeApiServer {
    /// A client wired to a fresh server running on the current runtime.
    pub fn start() -> (Client, Self) {
        let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let server = Self::default();
        tokio::spawn(server.clone().serve(handle));
        (Client::new(service, "default"), server)
    }

    pub fn insert(&self, path: &str, object: impl serde::Serialize) {
        let mut object = serde_json::to_value(object).unwrap();
        if object.pointer("/metadata/resourceVersion").is_none() {
            object["metadata"]["resourceVersion"] = json!("1");
        }
        self.objects.lock().unwrap().insert(path.to_string(), object);
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    /// Answers the next `method` on `path` with `code` instead of handling it.
    pub fn fail_once(&self, method: Method, path: &str, code: u16) {
        self.failures
            .lock()
            .unwrap()
            .push((method, path.to_string(), code));
    }

    /// Number of `method` requests whose path starts with `prefix`.
    pub fn count(&self, method: Method, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, path)| *m == method && path.starts_with(prefix))
            .count()
    }

    async fn serve(self, mut handle: Handle) {
        while let Some((request, send)) = handle.next_request().await {
            let method = request.method().clone();
            let path = request.uri().path().to_string();
            let apply = request
                .headers()
                .get(http::header::CONTENT_TYPE)
                .is_some_and(|ct| ct.as_bytes().starts_with(b"application/apply-patch"));
            let body = request.into_body().collect().await.unwrap().to_bytes();
            let body: Value = if body.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&body).unwrap()
            };

            self.calls.lock().unwrap().push((method.clone(), path.clone()));
            let (status, payload) = self.answer(&method, &path, body, apply);
            send.send_response(
                Response::builder()
                    .status(status)
                    .body(Body::from(serde_json::to_vec(&payload).unwrap()))
                    .unwrap(),
            );
        }
    }

    fn answer(&self, method: &Method, path: &str, body: Value, apply: bool) -> (StatusCode, Value) {
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(i) = failures
                .iter()
                .position(|(m, p, _)| m == method && p == path)
            {
                let (_, _, code) = failures.remove(i);
                return failure(code, "injected failure");
            }
        }

        let (object_path, subresource) = match path.strip_suffix("/status") {
            Some(p) => (p.to_string(), true),
            None => (path.to_string(), false),
        };
        let mut objects = self.objects.lock().unwrap();

        match *method {
            Method::GET => match objects.get(&object_path) {
                Some(obj) => (StatusCode::OK, obj.clone()),
                None => failure(404, "not found"),
            },
            Method::POST => {
                let mut obj = body;
                let name = match obj.pointer("/metadata/name").and_then(Value::as_str) {
                    Some(name) => name.to_string(),
                    None => format!("generated-{}", objects.len()),
                };
                let key = format!("{path}/{name}");
                if objects.contains_key(&key) {
                    return failure(409, "already exists");
                }
                obj["metadata"]["name"] = json!(name);
                obj["metadata"]["resourceVersion"] = json!("1");
                objects.insert(key, obj.clone());
                (StatusCode::CREATED, obj)
            }
            Method::PATCH if apply && !objects.contains_key(&object_path) => {
                let mut obj = body;
                obj["metadata"]["resourceVersion"] = json!("1");
                objects.insert(object_path, obj.clone());
                (StatusCode::CREATED, obj)
            }
            Method::PUT | Method::PATCH => {
                let Some(stored) = objects.get_mut(&object_path) else {
                    return failure(404, "not found");
                };
                let expected = body.pointer("/metadata/resourceVersion").cloned();
                let current = stored["metadata"]["resourceVersion"].clone();
                if expected.is_some_and(|rv| !rv.is_null() && rv != current) {
                    return failure(409, "the object has been modified");
                }

                if *method == Method::PUT {
                    if subresource {
                        stored["status"] = body["status"].clone();
                    } else {
                        *stored = body;
                    }
                } else {
                    merge(stored, &body);
                }

                let next = current
                    .as_str()
                    .and_then(|rv| rv.parse::<u64>().ok())
                    .unwrap_or(0)
                    + 1;
                stored["metadata"]["resourceVersion"] = json!(next.to_string());
                (StatusCode::OK, stored.clone())
            }
            _ => failure(405, "method not allowed"),
        }
    }
}

fn failure(code: u16, message: &str) -> (StatusCode, Value) {
    let reason = match code {
        404 => "NotFound",
        409 => "Conflict",
        _ => "InternalError",
    };
    (
        StatusCode::from_u16(code).unwrap(),
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code,
        }),
    )
}

/// JSON merge patch (RFC 7386).
fn merge(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = json!({});
            }
            for (key, value) in fields {
                if value.is_null() {
                    if let Some(map) = target.as_object_mut() {
                        map.remove(key);
                    }
                } else {
                    merge(&mut target[key.as_str()], value);
                }
            }
        }
        other => *target = other.clone(),
    }
}
