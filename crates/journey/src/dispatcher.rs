//! Action dispatch: outbound HTTP calls, analytics routing and host hooks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use wayfinder_core::config::DispatchConfig;
use wayfinder_core::error::ActionDispatchError;
use wayfinder_core::event_bus::{make_event, noop_sink, EventSink};
use wayfinder_core::types::{Action, ActionType, EventType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpReply {
    pub status: u16,
    pub body: Option<Value>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl TransportError {
    /// Network-level failures and timeouts are retried once.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::Timeout)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        request: OutboundRequest,
        timeout: Duration,
    ) -> Result<HttpReply, TransportError>;
}

/// Production transport backed by a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: OutboundRequest,
        timeout: Duration,
    ) -> Result<HttpReply, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::Invalid(e.to_string()))?;
        let mut builder = self.client.request(method, &request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else if e.is_builder() {
                TransportError::Invalid(e.to_string())
            } else {
                TransportError::Network(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        // Empty or non-JSON bodies are not an error.
        let body = response.json::<Value>().await.ok();
        Ok(HttpReply { status, body })
    }
}

/// Host integration for actions the engine cannot perform itself.
pub trait ActionHooks: Send + Sync {
    fn navigate(&self, url: &str, context: &DispatchContext) {
        info!(flow_id = %context.flow_id, url = %url, "Navigation requested");
    }

    fn custom(&self, action: &Action, context: &DispatchContext) {
        info!(flow_id = %context.flow_id, action_id = %action.id, "Custom action requested");
    }
}

/// Hooks that only log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHooks;

impl ActionHooks for LoggingHooks {}

/// Who an action is dispatched for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchContext {
    pub flow_id: String,
    pub step_id: Option<String>,
    pub visitor_id: String,
    pub variant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Http(HttpReply),
    Emitted(EventType),
    Navigated(String),
    Custom,
}

#[derive(Clone)]
pub struct ActionDispatcher {
    transport: Arc<dyn HttpTransport>,
    hooks: Arc<dyn ActionHooks>,
    event_sink: Arc<dyn EventSink>,
    request_timeout: Duration,
    retry_transient: bool,
    analytics_endpoint: Option<String>,
}

impl ActionDispatcher {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            transport: Arc::new(ReqwestTransport::new()),
            hooks: Arc::new(LoggingHooks),
            event_sink: noop_sink(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            retry_transient: config.retry_transient,
            analytics_endpoint: config.analytics_endpoint.clone(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ActionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub async fn dispatch(
        &self,
        action: &Action,
        context: &DispatchContext,
    ) -> Result<ActionOutcome, ActionDispatchError> {
        metrics::counter!("actions.dispatched").increment(1);
        let result = match action.action_type {
            ActionType::ApiCall => self.call_api(action).await,
            ActionType::Analytics => self.route_analytics(action, context).await,
            ActionType::Navigation => {
                let url = action.endpoint.clone().or_else(|| {
                    action
                        .payload
                        .as_ref()
                        .and_then(|p| p.get("url"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
                match url {
                    Some(url) => {
                        self.hooks.navigate(&url, context);
                        Ok(ActionOutcome::Navigated(url))
                    }
                    None => Err(ActionDispatchError::MissingEndpoint {
                        action_id: action.id.clone(),
                    }),
                }
            }
            ActionType::Custom => {
                self.hooks.custom(action, context);
                Ok(ActionOutcome::Custom)
            }
        };

        if let Err(error) = &result {
            metrics::counter!("actions.failed").increment(1);
            warn!(
                flow_id = %context.flow_id,
                step_id = ?context.step_id,
                error = %error,
                blocking = action.blocking,
                "Action dispatch failed"
            );
        }
        result
    }

    /// Dispatches on the runtime without waiting; failures are only logged.
    pub fn dispatch_detached(&self, action: Action, context: DispatchContext) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            // Already logged and counted by `dispatch`.
            let _ = dispatcher.dispatch(&action, &context).await;
        })
    }

    async fn call_api(&self, action: &Action) -> Result<ActionOutcome, ActionDispatchError> {
        let endpoint = action
            .endpoint
            .as_deref()
            .ok_or_else(|| ActionDispatchError::MissingEndpoint {
                action_id: action.id.clone(),
            })?;
        let method = action.method.as_deref().unwrap_or("POST").to_ascii_uppercase();
        if reqwest::Method::from_bytes(method.as_bytes()).is_err() {
            return Err(ActionDispatchError::InvalidMethod {
                action_id: action.id.clone(),
                method,
            });
        }

        let request = OutboundRequest {
            method,
            url: endpoint.to_string(),
            headers: action.headers.clone(),
            body: action.payload.clone(),
        };
        let reply = self.send_with_retry(&action.id, request).await?;
        if reply.status >= 400 {
            return Err(ActionDispatchError::Status {
                action_id: action.id.clone(),
                status: reply.status,
            });
        }
        debug!(action_id = %action.id, status = reply.status, "API action succeeded");
        Ok(ActionOutcome::Http(reply))
    }

    async fn route_analytics(
        &self,
        action: &Action,
        context: &DispatchContext,
    ) -> Result<ActionOutcome, ActionDispatchError> {
        let event_type = action
            .payload
            .as_ref()
            .and_then(|p| p.get("event_type"))
            .and_then(Value::as_str)
            .and_then(EventType::parse)
            .unwrap_or(EventType::Click);
        let event = make_event(
            event_type,
            context.flow_id.clone(),
            context.step_id.clone(),
            context.variant_id.clone(),
            Some(context.visitor_id.clone()),
        );

        match action.endpoint.as_ref().or(self.analytics_endpoint.as_ref()) {
            Some(endpoint) => {
                let body = serde_json::to_value(&event).map_err(|e| {
                    ActionDispatchError::Transport {
                        action_id: action.id.clone(),
                        message: e.to_string(),
                    }
                })?;
                let request = OutboundRequest {
                    method: "POST".into(),
                    url: endpoint.clone(),
                    headers: action.headers.clone(),
                    body: Some(body),
                };
                let reply = self.send_with_retry(&action.id, request).await?;
                if reply.status >= 400 {
                    return Err(ActionDispatchError::Status {
                        action_id: action.id.clone(),
                        status: reply.status,
                    });
                }
            }
            None => self.event_sink.emit(event),
        }
        Ok(ActionOutcome::Emitted(event_type))
    }

    async fn send_with_retry(
        &self,
        action_id: &str,
        request: OutboundRequest,
    ) -> Result<HttpReply, ActionDispatchError> {
        let first = self
            .transport
            .send(request.clone(), self.request_timeout)
            .await;
        let result = match first {
            Err(error) if error.is_transient() && self.retry_transient => {
                debug!(action_id = %action_id, error = %error, "Transient failure, retrying once");
                self.transport.send(request, self.request_timeout).await
            }
            other => other,
        };
        result.map_err(|error| match error {
            TransportError::Timeout => ActionDispatchError::Timeout {
                action_id: action_id.to_string(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            },
            other => ActionDispatchError::Transport {
                action_id: action_id.to_string(),
                message: other.to_string(),
            },
        })
    }
}
