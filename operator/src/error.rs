use kube::Error as KubeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] KubeError),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP request to {url} failed with status: {status}")]
    Status { url: String, status: u16 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// The API server rejected a write because the resourceVersion was stale.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(KubeError::Api(ae)) if ae.code == 409)
    }
}
