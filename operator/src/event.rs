use std::sync::Arc;

use kube::runtime::events::{Event, EventType};
use kube::{Client, Resource};
use kube_runtime::events::{Recorder, Reporter};

use crate::{config::Settings, model_sync::SyncTasks, registry::Transport};

#[derive(Clone)]
pub struct Ctx {
    pub client: Client,
    pub recorder: Recorder,
    pub settings: Settings,
    pub transport: Arc<dyn Transport>,
    pub syncs: Arc<SyncTasks>,
}

impl Ctx {
    pub fn new(client: Client, settings: Settings, transport: Arc<dyn Transport>) -> Self {
        let recorder = Recorder::new(client.clone(), make_reporter(&settings.instance));
        Self {
            client,
            recorder,
            settings,
            transport,
            syncs: Arc::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NoOp,
    Created,
    Updated,
}

pub fn make_reporter(instance: &str) -> Reporter {
    Reporter {
        controller: "mlflow-operator".into(),
        instance: Some(instance.into()),
    }
}

pub async fn emit_event<K>(
    ctx: &Ctx,
    obj: &K,
    reason: &str,
    note: &str,
    event_type: EventType,
) -> Result<(), kube::Error>
where
    K: Resource<DynamicType = ()> + std::fmt::Debug,
{
    ctx.recorder
        .publish(
            &Event {
                type_: event_type,
                reason: reason.into(),
                note: Some(note.into()),
                action: reason.into(),
                secondary: None,
            },
            &obj.object_ref(&()),
        )
        .await
}

/// Runs a convergence step and records its result as an Event on `obj`.
///
/// Publishing failures are dropped; the step's own result is returned as is.
pub async fn with_event<T, E, K>(
    ctx: &Ctx,
    obj: &K,
    success_reason: &str,
    success_note: &str,
    fail_reason: &str,
    op: impl std::future::Future<Output = Result<(Outcome, T), E>>,
) -> Result<(Outcome, T), E>
where
    E: std::fmt::Display,
    K: Resource<DynamicType = ()> + std::fmt::Debug,
{
    match op.await {
        Ok((outcome, value)) => {
            match outcome {
                Outcome::Created | Outcome::Updated => {
                    let note = format!("{} ({:?})", success_note, outcome);
                    let _ =
                        emit_event(ctx, obj, success_reason, &note, EventType::Normal).await;
                }
                Outcome::NoOp => {}
            }
            Ok((outcome, value))
        }
        Err(e) => {
            let _ = emit_event(ctx, obj, fail_reason, &e.to_string(), EventType::Warning).await;
            Err(e)
        }
    }
}
