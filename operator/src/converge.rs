//! Create-or-update of owned child objects.

use std::fmt::Debug;

use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use kube::{Api, Resource, ResourceExt, api::PostParams};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info};

use crate::{diff, error::Error, event::Outcome};

/// A child object whose spec the controller owns.
pub trait Converge:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned
{
    /// Whether `observed` drifted from `self`, ignoring server-populated fields.
    fn needs_update(&self, observed: &Self) -> bool;

    /// Carries the desired spec onto the live object, keeping its metadata.
    fn adopt(&mut self, desired: Self);
}

impl Converge for Deployment {
    fn needs_update(&self, observed: &Self) -> bool {
        diff::needs_update(&self.spec, &observed.spec)
    }

    fn adopt(&mut self, desired: Self) {
        self.spec = desired.spec;
    }
}

impl Converge for Service {
    fn needs_update(&self, observed: &Self) -> bool {
        diff::needs_update(&self.spec, &observed.spec)
    }

    fn adopt(&mut self, desired: Self) {
        let allocated = self.spec.take();
        self.spec = desired.spec.map(|mut spec| {
            // Allocated addresses are immutable.
            if let Some(allocated) = allocated {
                spec.cluster_ip = spec.cluster_ip.or(allocated.cluster_ip);
                spec.cluster_ips = spec.cluster_ips.or(allocated.cluster_ips);
            }
            spec
        });
    }
}

/// Makes the cluster hold `desired`: creates it when absent, replaces the
/// spec when it drifted, otherwise leaves it alone.
///
/// Returns the object as last known to the controller.
pub async fn ensure<K: Converge>(api: &Api<K>, desired: K) -> Result<(Outcome, K), Error> {
    let name = desired.name_any();

    let Some(mut existing) = api.get_opt(&name).await? else {
        api.create(&PostParams::default(), &desired).await?;
        info!(kind = %K::kind(&()), %name, "created");
        return Ok((Outcome::Created, desired));
    };

    if !desired.needs_update(&existing) {
        debug!(kind = %K::kind(&()), %name, "up to date");
        return Ok((Outcome::NoOp, existing));
    }

    existing.adopt(desired);
    let updated = api.replace(&name, &PostParams::default(), &existing).await?;
    info!(kind = %K::kind(&()), %name, "updated");
    Ok((Outcome::Updated, updated))
}

/// Creates `desired` unless an object of that name already exists.
/// Existing objects are never modified.
pub async fn ensure_present<K>(api: &Api<K>, desired: K) -> Result<(Outcome, K), Error>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = desired.name_any();
    match api.create(&PostParams::default(), &desired).await {
        Ok(created) => {
            info!(kind = %K::kind(&()), %name, "created");
            Ok((Outcome::Created, created))
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(kind = %K::kind(&()), %name, "already exists");
            Ok((Outcome::NoOp, desired))
        }
        Err(e) => Err(e.into()),
    }
}

/// A Deployment is ready once every desired replica reports ready.
pub fn is_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready == desired
}
