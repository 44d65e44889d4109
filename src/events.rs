//! User visible notifications about managed resources.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use log::{debug, warn};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub reason: String,
    pub message: String,
}

impl Notification {
    pub fn normal<R: Into<String>, M: Into<String>>(reason: R, message: M) -> Self {
        Notification {
            severity: Severity::Normal,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn error<R: Into<String>, M: Into<String>>(reason: R, message: M) -> Self {
        Notification {
            severity: Severity::Warning,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// An attempt to change a field that cannot change after creation.
    pub fn immutable_field(field: &str) -> Self {
        Self::error(
            "ImmutableFieldChanged",
            format!("field '{}' cannot be changed and has been reset", field),
        )
    }
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, object: &ObjectReference, notification: Notification);
}

/// Publishes notifications as Kubernetes events.
pub struct KubeRecorder {
    recorder: Recorder,
}

impl KubeRecorder {
    pub fn new(client: Client, controller: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance,
        };
        KubeRecorder {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeRecorder {
    async fn record(&self, object: &ObjectReference, notification: Notification) {
        let type_ = match notification.severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        };
        let event = Event {
            type_,
            action: notification.reason.clone(),
            reason: notification.reason.clone(),
            note: Some(notification.message.clone()),
            secondary: None,
        };
        // Losing an event is never worth failing a reconciliation over.
        if let Err(err) = self.recorder.publish(&event, object).await {
            warn!(
                "failed to publish event {} for {:?}: {}",
                notification.reason, object.name, err
            );
        }
    }
}

/// Keeps every notification in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryRecorder {
    recorded: Mutex<Vec<(String, Notification)>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().iter().map(|(_, n)| n.clone()).collect()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.lock().iter().map(|(_, n)| n.reason.clone()).collect()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.lock().iter().filter(|(_, n)| n.reason == reason).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, Notification)>> {
        self.recorded.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn record(&self, object: &ObjectReference, notification: Notification) {
        let name = object.name.clone().unwrap_or_default();
        debug!("{}: {} {}", name, notification.reason, notification.message);
        self.lock().push((name, notification));
    }
}
