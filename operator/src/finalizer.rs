use crate::error::Error;
use crate::{crd::MLFlow, event::Outcome};
use kube::{
    Api, Resource, ResourceExt,
    api::{Patch, PatchParams},
};
use serde_json::json;

pub const FINALIZER: &str = "mlflow.jedimindtricks.example/finalizer";

pub fn is_deleting(mlflow: &MLFlow) -> bool {
    mlflow.meta().deletion_timestamp.is_some()
}

pub fn has_finalizer(mlflow: &MLFlow, finalizer: &str) -> bool {
    mlflow.finalizers().iter().any(|x| x == finalizer)
}

pub async fn ensure_finalizer_present(
    api: &Api<MLFlow>,
    mlflow: &MLFlow,
    finalizer: &str,
) -> Result<Outcome, Error> {
    if has_finalizer(mlflow, finalizer) {
        return Ok(Outcome::NoOp);
    }

    let mut finalizers = mlflow.finalizers().to_vec();
    finalizers.push(finalizer.into());
    patch_finalizers(api, mlflow, finalizers).await?;
    Ok(Outcome::Created)
}

pub async fn remove_finalizer(
    api: &Api<MLFlow>,
    mlflow: &MLFlow,
    finalizer: &str,
) -> Result<Outcome, Error> {
    if !has_finalizer(mlflow, finalizer) {
        return Ok(Outcome::NoOp);
    }

    let mut finalizers = mlflow.finalizers().to_vec();
    finalizers.retain(|x| x != finalizer);
    patch_finalizers(api, mlflow, finalizers).await?;
    Ok(Outcome::Updated)
}

async fn patch_finalizers(
    api: &Api<MLFlow>,
    mlflow: &MLFlow,
    finalizers: Vec<String>,
) -> Result<(), Error> {
    // Pinned to the observed version so a concurrent edit is not overwritten.
    let patch = json!({
        "metadata": {
            "resourceVersion": mlflow.resource_version(),
            "finalizers": finalizers,
        }
    });
    api.patch_metadata(&mlflow.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeApiServer, MLFLOW_PATH, mlflow};
    use http::Method;

    #[tokio::test]
    async fn adds_finalizer_once() {
        let (client, server) = FakeApiServer::start();
        let api: Api<MLFlow> = Api::namespaced(client, "ml");
        let m = mlflow();
        server.insert(MLFLOW_PATH, &m);

        let outcome = ensure_finalizer_present(&api, &m, FINALIZER).await.unwrap();
        assert_eq!(outcome, Outcome::Created);
        assert_eq!(
            server.get(MLFLOW_PATH).unwrap()["metadata"]["finalizers"][0],
            FINALIZER
        );

        let mut with = m.clone();
        with.metadata.finalizers = Some(vec![FINALIZER.into()]);
        let outcome = ensure_finalizer_present(&api, &with, FINALIZER).await.unwrap();
        assert_eq!(outcome, Outcome::NoOp);
        assert_eq!(server.count(Method::PATCH, MLFLOW_PATH), 1);
    }

    #[tokio::test]
    async fn removes_only_our_finalizer() {
        let (client, server) = FakeApiServer::start();
        let api: Api<MLFlow> = Api::namespaced(client, "ml");
        let mut m = mlflow();
        m.metadata.finalizers = Some(vec!["other/finalizer".into(), FINALIZER.into()]);
        server.insert(MLFLOW_PATH, &m);

        let outcome = remove_finalizer(&api, &m, FINALIZER).await.unwrap();

        assert_eq!(outcome, Outcome::Updated);
        let stored = server.get(MLFLOW_PATH).unwrap();
        assert_eq!(stored["metadata"]["finalizers"], json!(["other/finalizer"]));
    }
}
