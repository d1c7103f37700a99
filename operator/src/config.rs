use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "mlflow-operator", version, about = "Runs MLflow tracking servers and serves their production models")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub settings: Settings,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the MLFlow CustomResourceDefinition as YAML.
    Crd,
    /// Run the controller (the default).
    Run,
}

#[derive(clap::Args, Debug, Clone)]
pub struct Settings {
    /// Local development mode: NodePort server, artifact volumes and an example Job.
    #[arg(long, env = "MLFLOW_OPERATOR_DEBUG")]
    pub debug: bool,

    /// Registry endpoint used instead of in-cluster DNS in debug mode.
    #[arg(
        long,
        env = "MLFLOW_OPERATOR_DEBUG_REGISTRY_URL",
        default_value = "http://localhost:30099/api/2.0/mlflow"
    )]
    pub debug_registry_url: String,

    #[arg(long, env = "MLFLOW_OPERATOR_HTTP_TIMEOUT_SECS", default_value_t = 10)]
    pub http_timeout_secs: u64,

    #[arg(long, env = "MLFLOW_OPERATOR_HTTP_MAX_ATTEMPTS", default_value_t = 5)]
    pub http_max_attempts: u32,

    /// Delay before checking again on a server that is not ready yet.
    #[arg(long, env = "MLFLOW_OPERATOR_READINESS_REQUEUE_SECS", default_value_t = 10)]
    pub readiness_requeue_secs: u64,

    #[arg(long, env = "MLFLOW_OPERATOR_ERROR_REQUEUE_SECS", default_value_t = 10)]
    pub error_requeue_secs: u64,

    #[arg(long, env = "MLFLOW_OPERATOR_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Reporting instance attached to published events.
    #[arg(long, env = "MLFLOW_OPERATOR_INSTANCE", default_value = "dev")]
    pub instance: String,

    #[arg(
        long,
        env = "MLFLOW_OPERATOR_EXAMPLE_JOB_IMAGE",
        default_value = "erayarslan/mlflow_wine_quality_example:v2.6.0"
    )]
    pub example_job_image: String,
}

impl Settings {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn readiness_requeue(&self) -> Duration {
        Duration::from_secs(self.readiness_requeue_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    /// The registry URL override in effect, if any.
    pub fn registry_override(&self) -> Option<&str> {
        self.debug.then_some(self.debug_registry_url.as_str())
    }
}
