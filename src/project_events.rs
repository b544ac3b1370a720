//! The project-event consumer (§4.F): tears down every disk in a project
//! when the event bus delivers a `project-remove` event.

use crate::error::DiskError;
use crate::service::DiskService;
use crate::{labels, naming};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The `project-remove` event payload on the `platform-admin` stream.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectRemoveEvent {
    pub org: String,
    pub project: String,
}

/// One delivery off the stream: the event plus the tag needed to
/// acknowledge it, once handling is complete.
pub struct ReceivedEvent {
    pub event: ProjectRemoveEvent,
    pub tag: String,
}

/// Abstracts the event-bus collaborator so the teardown logic below never
/// depends on a concrete transport (grounded in the same trait-at-the-seam
/// style the gateway uses for the K8s client).
#[async_trait]
pub trait EventsClient: Send + Sync {
    /// Blocks until the next `project-remove` event is available, or
    /// returns `Ok(None)` if the stream has been closed.
    async fn receive(&self) -> Result<Option<ReceivedEvent>, DiskError>;

    /// Acknowledges an event by its tag so it is not redelivered.
    async fn ack(&self, tag: &str) -> Result<(), DiskError>;
}

/// Consumes `project-remove` events until the stream closes or is
/// cancelled. A per-event failure is logged and does not stop the loop
/// (§4.F, matching the other watchers' "log and continue" posture).
pub async fn run(client: Arc<dyn EventsClient>, service: Arc<DiskService>) {
    loop {
        match client.receive().await {
            Ok(Some(received)) => {
                if let Err(e) = handle_project_remove(&service, &received.event).await {
                    error!(
                        org = %received.event.org,
                        project = %received.event.project,
                        error = %e,
                        "project-remove handling failed"
                    );
                }
                if let Err(e) = client.ack(&received.tag).await {
                    warn!(tag = %received.tag, error = %e, "failed to ack project-remove event");
                }
            }
            Ok(None) => {
                info!("project-event stream closed");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to receive from project-event stream, retrying");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Removes every disk of `event`'s project, best-effort (§4.F steps 1-2).
async fn handle_project_remove(
    service: &DiskService,
    event: &ProjectRemoveEvent,
) -> Result<(), DiskError> {
    let org = labels::normalize_org(Some(event.org.as_str()));
    let namespace = naming::generate_namespace_name(&org, &event.project);

    let disks = service.get_all_disks(Some(&namespace)).await?;
    info!(
        org = %org,
        project = %event.project,
        count = disks.len(),
        "tearing down disks for removed project"
    );

    for disk in disks {
        match service.remove_disk(&namespace, &disk.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(id = %disk.id, error = %e, "failed to remove disk during project teardown"),
        }
    }
    Ok(())
}

/// Polls the `platform-admin` stream over HTTP: `GET {url}/streams/{name}/next`
/// for the next event, `POST {url}/streams/{name}/ack/{tag}` to acknowledge
/// it. The event bus itself is external, out-of-scope infrastructure (§2);
/// this is the thinnest client that can talk to it.
pub struct HttpEventsClient {
    http: reqwest::Client,
    base_url: String,
    stream: String,
}

impl HttpEventsClient {
    pub fn new(base_url: String, token: Option<String>, stream: String) -> Result<Self, DiskError> {
        let mut builder = reqwest::Client::builder();
        if let Some(token) = token {
            let mut headers = reqwest::header::HeaderMap::new();
            let mut value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| DiskError::Fatal(format!("invalid events bus token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }
        let http = builder
            .build()
            .map_err(|e| DiskError::Fatal(format!("failed to build events bus client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            stream,
        })
    }
}

#[async_trait]
impl EventsClient for HttpEventsClient {
    async fn receive(&self) -> Result<Option<ReceivedEvent>, DiskError> {
        let url = format!("{}/streams/{}/next", self.base_url, self.stream);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DiskError::Transient(format!("events bus request failed: {e}")))?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DiskError::from_status_code(
                response.status().as_u16(),
                response.status().to_string(),
            ));
        }
        #[derive(Deserialize)]
        struct Delivery {
            tag: String,
            #[serde(flatten)]
            event: ProjectRemoveEvent,
        }
        let delivery: Delivery = response
            .json()
            .await
            .map_err(|e| DiskError::Validation(format!("malformed event payload: {e}")))?;
        Ok(Some(ReceivedEvent {
            event: delivery.event,
            tag: delivery.tag,
        }))
    }

    async fn ack(&self, tag: &str) -> Result<(), DiskError> {
        let url = format!("{}/streams/{}/ack/{}", self.base_url, self.stream, tag);
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| DiskError::Transient(format!("events bus ack failed: {e}")))?;
        if !response.status().is_success() {
            return Err(DiskError::from_status_code(
                response.status().as_u16(),
                response.status().to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedClient {
        events: Mutex<Vec<ReceivedEvent>>,
        acked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventsClient for ScriptedClient {
        async fn receive(&self) -> Result<Option<ReceivedEvent>, DiskError> {
            Ok(self.events.lock().unwrap().pop())
        }

        async fn ack(&self, tag: &str) -> Result<(), DiskError> {
            self.acked.lock().unwrap().push(tag.to_string());
            Ok(())
        }
    }

    #[test]
    fn project_remove_event_deserializes() {
        let raw = r#"{"org":"acme","project":"web"}"#;
        let event: ProjectRemoveEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.org, "acme");
        assert_eq!(event.project, "web");
    }

    #[tokio::test]
    async fn client_acks_after_each_delivery() {
        let client = ScriptedClient {
            events: Mutex::new(vec![ReceivedEvent {
                event: ProjectRemoveEvent {
                    org: "acme".to_string(),
                    project: "web".to_string(),
                },
                tag: "tag-1".to_string(),
            }]),
            acked: Mutex::new(Vec::new()),
        };
        let received = client.receive().await.unwrap().unwrap();
        client.ack(&received.tag).await.unwrap();
        assert_eq!(client.acked.lock().unwrap().as_slice(), ["tag-1".to_string()]);
    }
}
