//! Cluster event recording.
//!
//! Controllers surface anything an operator can act on as Events on the
//! owning object; a failed publish is logged and otherwise ignored.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[derive(Clone)]
pub struct EventRecorder {
    client: Client,
    reporter: Reporter,
}

impl EventRecorder {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: "dcloud-dhcp-controller".to_string(),
            instance: None,
        };
        Self { client, reporter }
    }

    pub async fn normal(&self, reference: &ObjectReference, reason: &str, note: String) {
        self.publish(reference, EventType::Normal, reason, note).await;
    }

    pub async fn warning(&self, reference: &ObjectReference, reason: &str, note: String) {
        self.publish(reference, EventType::Warning, reason, note).await;
    }

    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference.clone());
        if let Err(e) = recorder.publish(event).await {
            warn!("(events.publish) cannot record event on {:?}: {}", reference.name, e);
        }
    }
}
