//! Client for the forwarding engine's local control API.
//!
//! ```text
//! POST   /namespaces        {"namespace": "...", "selectors": [...]}
//! DELETE /namespaces/{ns}
//! GET    /services
//! GET    /health
//! GET    /events            text/event-stream
//! ```
//!
//! Calls never retry on their own. Transport failures (refused, timed out)
//! surface as [`DaemonError::ControlUnreachable`]; 4xx answers as
//! [`DaemonError::ControlRejected`].

use super::events::{parse_event, EngineEvent, SseDecoder};
use crate::error::{DaemonError, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub type EventStream = BoxStream<'static, Result<EngineEvent>>;

/// Engine-reported state of one forwarded service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    #[serde(alias = "active", alias = "running")]
    Connected,
    Reconnecting,
    Disconnected,
    #[serde(alias = "failed")]
    Error,
    #[serde(other)]
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub namespace: String,
    #[serde(alias = "name")]
    pub service: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ServiceList {
    Bare(Vec<ServiceSummary>),
    Wrapped { services: Vec<ServiceSummary> },
}

#[derive(Serialize)]
struct AddNamespaceBody<'a> {
    namespace: &'a str,
    selectors: &'a [String],
}

#[async_trait]
pub trait EngineControl: Send + Sync {
    /// Attach a namespace. Attaching an attached namespace succeeds.
    async fn add_namespace(&self, namespace: &str, selectors: &[String]) -> Result<()>;

    /// Detach a namespace. Detaching an absent namespace succeeds.
    async fn remove_namespace(&self, namespace: &str) -> Result<()>;

    async fn list_services(&self) -> Result<Vec<ServiceSummary>>;

    async fn health(&self) -> Result<bool>;

    /// Open the server-push event subscription.
    async fn subscribe(&self) -> Result<EventStream>;
}

pub struct ControlApiClient {
    base_url: String,
    client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl ControlApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DaemonError::Protocol(format!("failed to build HTTP client: {e}")))?;
        // The event stream stays open indefinitely; only connecting is bounded.
        let stream_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| DaemonError::Protocol(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            stream_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport(operation: &str, err: reqwest::Error) -> DaemonError {
    DaemonError::unreachable(operation, err)
}

/// Map a non-success status to the error taxonomy.
async fn rejection(operation: &str, response: reqwest::Response) -> DaemonError {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    let message = message.trim().to_string();
    if status.is_client_error() {
        DaemonError::ControlRejected {
            operation: operation.to_string(),
            status: status.as_u16(),
            message,
        }
    } else {
        DaemonError::ControlFailed {
            operation: operation.to_string(),
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl EngineControl for ControlApiClient {
    async fn add_namespace(&self, namespace: &str, selectors: &[String]) -> Result<()> {
        const OP: &str = "add_namespace";
        debug!(namespace, ?selectors, "POST /namespaces");

        let response = self
            .client
            .post(self.url("/namespaces"))
            .json(&AddNamespaceBody {
                namespace,
                selectors,
            })
            .send()
            .await
            .map_err(|e| transport(OP, e))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                trace!(namespace, "Namespace already attached");
                Ok(())
            }
            _ => Err(rejection(OP, response).await),
        }
    }

    async fn remove_namespace(&self, namespace: &str) -> Result<()> {
        const OP: &str = "remove_namespace";
        debug!(namespace, "DELETE /namespaces/{}", namespace);

        let url = reqwest::Url::parse(&self.url("/namespaces/"))
            .and_then(|base| base.join(namespace))
            .map_err(|e| DaemonError::Protocol(format!("invalid namespace URL: {e}")))?;
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| transport(OP, e))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                trace!(namespace, "Namespace already detached");
                Ok(())
            }
            _ => Err(rejection(OP, response).await),
        }
    }

    async fn list_services(&self) -> Result<Vec<ServiceSummary>> {
        const OP: &str = "list_services";
        let response = self
            .client
            .get(self.url("/services"))
            .send()
            .await
            .map_err(|e| transport(OP, e))?;

        if !response.status().is_success() {
            return Err(rejection(OP, response).await);
        }

        let body = response.bytes().await.map_err(|e| transport(OP, e))?;
        let list: ServiceList = serde_json::from_slice(&body)?;
        Ok(match list {
            ServiceList::Bare(services) => services,
            ServiceList::Wrapped { services } => services,
        })
    }

    async fn health(&self) -> Result<bool> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| transport("health", e))?;
        Ok(response.status().is_success())
    }

    async fn subscribe(&self) -> Result<EventStream> {
        const OP: &str = "subscribe";
        let response = self
            .stream_client
            .get(self.url("/events"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| transport(OP, e))?;

        if !response.status().is_success() {
            return Err(rejection(OP, response).await);
        }
        debug!("Event stream opened");

        let bytes = Box::pin(response.bytes_stream());
        let state = (bytes, SseDecoder::new(), VecDeque::new());
        let stream = futures::stream::unfold(state, |(mut bytes, mut decoder, mut ready)| async move {
            loop {
                if let Some(event) = ready.pop_front() {
                    return Some((Ok(event), (bytes, decoder, ready)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        for payload in decoder.feed(&chunk) {
                            match parse_event(&payload) {
                                Ok(event) => ready.push_back(event),
                                Err(e) => {
                                    warn!(error = %e, data = %payload, "Skipping malformed engine event")
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let err = DaemonError::StreamDisconnect(e.to_string());
                        return Some((Err(err), (bytes, decoder, ready)));
                    }
                    None => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
