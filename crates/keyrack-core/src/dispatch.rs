use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::router::{Route, route};
use crate::selector::Selection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Performs the vendor call for a routed command with an acquired credential.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, route: &Route, credential: &Selection) -> Result<serde_json::Value>;
}

/// Uniform JSON envelope returned for every command.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResponse {
    pub success: bool,
    pub command: String,
    pub action: String,
    pub service: String,
    /// Name of the credential used, never its secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Routes free-text commands, acquires a credential for the target service
/// and hands both to a [`ServiceHandler`].
pub struct Dispatcher<'a, H> {
    registry: &'a Registry,
    handler: H,
    fallback: String,
}

impl<'a, H: ServiceHandler> Dispatcher<'a, H> {
    pub fn new(registry: &'a Registry, handler: H, fallback: &str) -> Self {
        Self {
            registry,
            handler,
            fallback: fallback.to_string(),
        }
    }

    /// Never fails: every outcome, including "no credential", is rendered
    /// into the response envelope.
    pub async fn dispatch(&self, command: &str) -> DispatchResponse {
        let route = route(command, &self.fallback);
        let mut response = DispatchResponse {
            success: false,
            command: command.trim().to_string(),
            action: route.action.clone(),
            service: route.service.clone(),
            credential: None,
            data: None,
            error: None,
            timestamp: self.registry.now(),
        };

        let Some(selection) = self.registry.acquire(&route.service) else {
            response.error = Some(
                Error::NoUsableCredential {
                    service: route.service.clone(),
                }
                .to_string(),
            );
            return response;
        };
        response.credential = Some(selection.name.clone());

        match self.handler.handle(&route, &selection).await {
            Ok(data) => {
                response.success = true;
                response.data = Some(data);
            }
            Err(e) => {
                // The vendor refused the credential itself; take it out of rotation
                if let Error::HttpError { status: 401 | 403, .. } = e {
                    self.registry.report_failure(&selection.service, &selection.name);
                }
                tracing::warn!(
                    service = %route.service,
                    credential = %selection.name,
                    error = %e,
                    "command failed"
                );
                response.error = Some(e.to_string());
            }
        }
        response
    }
}

/// Handler that makes no vendor call and reports what would have been used.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunHandler;

#[async_trait]
impl ServiceHandler for DryRunHandler {
    async fn handle(&self, route: &Route, credential: &Selection) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "dry_run": true,
            "route": route,
            "credential": credential.summary(),
        }))
    }
}
