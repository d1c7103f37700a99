mod config;
mod converge;
mod crd;
mod diff;
mod error;
mod event;
mod finalizer;
mod manifest;
mod model_sync;
mod quantity;
mod reconcile;
mod registry;
mod status;
mod tags;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use kube::{Api, Client, CustomResourceExt};
use kube_runtime::{Controller, watcher};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{Args, Command},
    crd::MLFlow,
    error::Error,
    event::Ctx,
    reconcile::{error_policy, reconcile},
    registry::HttpTransport,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    if args.command == Some(Command::Crd) {
        print!("{}", serde_yaml::to_string(&MLFlow::crd())?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = args.settings;
    let client = Client::try_default().await?;
    let transport = Arc::new(HttpTransport::new(
        settings.http_timeout(),
        settings.http_max_attempts,
    )?);
    let ctx = Arc::new(Ctx::new(client.clone(), settings, transport));

    let mlflows: Api<MLFlow> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client);

    info!(debug = ctx.settings.debug, "starting mlflow-operator");
    Controller::new(mlflows, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(mlflow = %obj.name, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;

    Ok(())
}
