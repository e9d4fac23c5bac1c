use crate::crd::ConsensusSet;
use crate::errors::*;
use async_trait::async_trait;
use kube::{Client, Resource};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
#[cfg(test)]
use mockall::automock;

/// An event raised by a transformer, published once the plan has run.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaEvent {
    pub type_: EventType,
    pub reason: String,
    pub action: String,
    pub message: String,
}

impl ReplicaEvent {
    pub fn normal(reason: &str, action: &str, message: impl Into<String>) -> Self {
        ReplicaEvent {
            type_: EventType::Normal,
            reason: reason.to_string(),
            action: action.to_string(),
            message: message.into(),
        }
    }

    pub fn warning(reason: &str, action: &str, message: impl Into<String>) -> Self {
        ReplicaEvent {
            type_: EventType::Warning,
            reason: reason.to_string(),
            action: action.to_string(),
            message: message.into(),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, owner: &ConsensusSet, event: &ReplicaEvent) -> Result<()>;
}

/// Publishes through the `events.k8s.io` API.
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        KubeEventRecorder {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, owner: &ConsensusSet, event: &ReplicaEvent) -> Result<()> {
        let ev = Event {
            type_: event.type_,
            reason: event.reason.clone(),
            note: Some(event.message.clone()),
            action: event.action.clone(),
            secondary: None,
        };
        self.recorder.publish(&ev, &owner.object_ref(&())).await?;
        Ok(())
    }
}
