use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const PRODUCTION_STAGE: &str = "Production";

/// Kubernetes object names used as container names and label values.
const MAX_NAME_LEN: usize = 63;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LatestVersion {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub current_stage: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RegisteredModel {
    pub name: String,
    #[serde(default)]
    pub latest_versions: Vec<LatestVersion>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RegisteredModelsResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub registered_models: Vec<RegisteredModel>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ModelVersion {
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ModelVersionsResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub model_versions: Vec<ModelVersion>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ModelVersionDetailResponse {
    pub model_version: ModelVersionDetail,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ModelVersionDetail {
    pub name: String,
    pub version: String,
    pub creation_timestamp: i64,
    pub last_updated_timestamp: i64,
    pub current_stage: String,
    pub description: String,
    pub source: String,
    pub run_id: String,
    pub status: String,
    pub tags: Vec<ModelVersionTag>,
    pub run_link: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ModelVersionTag {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UpdateDescriptionResponse {
    #[serde(default)]
    pub registered_model: RegisteredModel,
}

/// A deployable model version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Model {
    pub name: String,
    pub version: String,
}

impl Model {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn lower_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Name of the serving Deployment for this version under `server`.
    ///
    /// Characters Kubernetes rejects in names are replaced with `-`; names
    /// over 63 characters are cut and suffixed with a hash of the full name.
    pub fn deployment_name(&self, server: &str) -> String {
        let raw = format!("{}-{}-{}-model", server, self.lower_name(), self.version);
        let name: String = raw
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();

        if name.len() <= MAX_NAME_LEN {
            return name;
        }

        let digest = hex::encode(Sha256::digest(raw.as_bytes()));
        let keep = MAX_NAME_LEN - 9;
        format!("{}-{}", name[..keep].trim_end_matches('-'), &digest[..8])
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}
