//! Client for the MLflow tracking server REST API.

mod transport;
mod types;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{Level, debug, instrument};
use url::Url;

use crate::error::Error;

pub use transport::{HttpTransport, Transport, is_retryable};
pub use types::*;

const DEFAULT_NAMESPACE: &str = "default";
const API_PREFIX: &str = "api/2.0/mlflow";

/// Where the tracking server for `name` in `namespace` answers.
///
/// `override_url` wins when set; debug setups reach the server through a
/// NodePort on localhost.
pub fn base_url(name: &str, namespace: &str, override_url: Option<&str>) -> String {
    if let Some(url) = override_url {
        return url.trim_end_matches('/').to_string();
    }
    if namespace == DEFAULT_NAMESPACE {
        format!("http://{}:{}/{}", name, crate::manifest::MLFLOW_PORT, API_PREFIX)
    } else {
        format!(
            "http://{}.{}:{}/{}",
            name,
            namespace,
            crate::manifest::MLFLOW_PORT,
            API_PREFIX
        )
    }
}

#[derive(Clone)]
pub struct RegistryClient {
    transport: Arc<dyn Transport>,
    base_url: String,
}

impl RegistryClient {
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Every registered model, across all pages.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn list_registered_models(&self) -> Result<Vec<RegisteredModel>, Error> {
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let query: Vec<(&str, &str)> = match &page_token {
                Some(token) => vec![("page_token", token.as_str())],
                None => vec![],
            };
            let url = self.endpoint("registered-models/search", &query)?;
            let response: RegisteredModelsResponse = self.get_json(&url).await?;

            models.extend(response.registered_models);

            match response.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(models)
    }

    /// Every version of `name`, across all pages.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn list_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>, Error> {
        let filter = format!("name='{}'", name);
        let mut versions = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("filter", filter.as_str())];
            if let Some(token) = &page_token {
                query.push(("page_token", token.as_str()));
            }
            let url = self.endpoint("model-versions/search", &query)?;
            let response: ModelVersionsResponse = self.get_json(&url).await?;

            versions.extend(response.model_versions);

            match response.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(versions)
    }

    /// All versions of all registered models, flattened.
    pub async fn get_latest_models(&self) -> Result<Vec<Model>, Error> {
        let mut models = Vec::new();
        for registered in self.list_registered_models().await? {
            let versions = self.list_model_versions(&registered.name).await?;
            models.extend(
                versions
                    .into_iter()
                    .map(|v| Model::new(registered.name.clone(), v.version)),
            );
        }
        Ok(models)
    }

    /// Versions currently promoted to the Production stage.
    pub async fn get_production_models(&self) -> Result<Vec<Model>, Error> {
        let models = self
            .list_registered_models()
            .await?
            .into_iter()
            .flat_map(|registered| {
                let name = registered.name;
                registered
                    .latest_versions
                    .into_iter()
                    .filter(|v| v.current_stage == PRODUCTION_STAGE)
                    .map(move |v| Model::new(name.clone(), v.version))
            })
            .collect();
        Ok(models)
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn get_model_version_detail(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ModelVersionDetail, Error> {
        let url = self.endpoint("model-versions/get", &[("name", name), ("version", version)])?;
        let response: ModelVersionDetailResponse = self.get_json(&url).await?;
        Ok(response.model_version)
    }

    #[instrument(level = Level::DEBUG, skip(self, message))]
    pub async fn update_description(&self, name: &str, message: &str) -> Result<(), Error> {
        let url = self.endpoint("registered-models/update", &[])?;
        let body = json!({
            "name": name,
            "description": message,
        });

        let raw = self.transport.patch(&url, &body).await?;
        let response: UpdateDescriptionResponse = serde_json::from_str(&raw)?;
        debug!(
            model = %response.registered_model.name,
            "model description updated"
        );
        Ok(())
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<String, Error> {
        let mut url = Url::parse(&format!("{}/{}", self.base_url, path))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url.into())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, Error> {
        let raw = self.transport.get(url).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}
