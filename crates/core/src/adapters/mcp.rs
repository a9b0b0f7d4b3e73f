//! # MCP HTTP Adapters
//!
//! One adapter per MCP server. Operations map to `POST {endpoint}/{operation}`
//! with the idempotency key in the `Idempotency-Key` header.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{classify_http_failure, AdapterError, AdapterRegistry, AdapterRequest, Capability, CapabilityAdapter};

/// Static description of a known MCP server
#[derive(Debug, Clone, Copy)]
pub struct McpService {
    pub name: &'static str,
    pub endpoint_env: &'static str,
    pub default_endpoint: &'static str,
    pub capabilities: &'static [Capability],
    /// Operations the service cannot deduplicate
    pub non_idempotent: &'static [&'static str],
}

/// The MCP servers SuperMon talks to, in capability-precedence order
pub const MCP_SERVICES: [McpService; 5] = [
    McpService {
        name: "slack",
        endpoint_env: "SLACK_MCP_ENDPOINT",
        default_endpoint: "http://localhost:8001",
        capabilities: &[Capability::Messaging],
        non_idempotent: &["send_message"],
    },
    McpService {
        name: "whatsapp",
        endpoint_env: "WHATSAPP_MCP_ENDPOINT",
        default_endpoint: "http://localhost:8002",
        capabilities: &[Capability::Messaging],
        non_idempotent: &["send_message"],
    },
    McpService {
        name: "webex",
        endpoint_env: "WEBEX_MCP_ENDPOINT",
        default_endpoint: "http://localhost:8003",
        capabilities: &[Capability::Calendar, Capability::Messaging],
        non_idempotent: &["schedule_meeting", "send_message"],
    },
    McpService {
        name: "notion",
        endpoint_env: "NOTION_MCP_ENDPOINT",
        default_endpoint: "http://localhost:8004",
        capabilities: &[Capability::Documentation],
        non_idempotent: &["create_page"],
    },
    McpService {
        name: "github",
        endpoint_env: "GITHUB_MCP_ENDPOINT",
        default_endpoint: "http://localhost:8005",
        capabilities: &[Capability::IssueTracker],
        non_idempotent: &["create_issue"],
    },
];

/// HTTP client for one MCP server
pub struct McpAdapter {
    service: McpService,
    endpoint: String,
    client: reqwest::Client,
}

impl McpAdapter {
    pub fn new(service: McpService, endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Permanent(format!("http client: {}", e)))?;
        Ok(Self {
            service,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Endpoint from the service's environment variable, else its default.
    pub fn from_env(service: McpService, timeout: Duration) -> Result<Self, AdapterError> {
        let endpoint = std::env::var(service.endpoint_env)
            .unwrap_or_else(|_| service.default_endpoint.to_string());
        Self::new(service, endpoint, timeout)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_idempotent(&self, operation: &str) -> bool {
        !self.service.non_idempotent.contains(&operation)
    }
}

/// Register every known MCP server.
pub fn register_mcp_adapters(registry: &mut AdapterRegistry) -> Result<(), AdapterError> {
    for service in MCP_SERVICES {
        let adapter = McpAdapter::from_env(service, registry.call_timeout())?;
        tracing::info!(service = service.name, endpoint = %adapter.endpoint(), "Registered MCP adapter");
        registry.register(Arc::new(adapter));
    }
    Ok(())
}

#[async_trait]
impl CapabilityAdapter for McpAdapter {
    fn name(&self) -> &str {
        self.service.name
    }

    fn capabilities(&self) -> &[Capability] {
        self.service.capabilities
    }

    async fn invoke(&self, request: AdapterRequest) -> Result<Value, AdapterError> {
        let url = format!("{}/{}", self.endpoint, request.operation);
        let idempotent = self.is_idempotent(&request.operation);

        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", request.idempotency_key.as_str())
            .json(&request.params)
            .send()
            .await
            .map_err(|e| {
                let sent = !(e.is_connect() || e.is_builder());
                classify_http_failure(e.status().map(|s| s.as_u16()), sent, idempotent, &e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(Some(status.as_u16()), true, idempotent, &body));
        }

        response.json::<Value>().await.map_err(|e| {
            if idempotent {
                AdapterError::Transient(format!("malformed response from {}: {}", self.service.name, e))
            } else {
                AdapterError::Permanent(format!(
                    "{} applied {} but the response was unreadable: {}",
                    self.service.name, request.operation, e
                ))
            }
        })
    }

    async fn health(&self) -> Result<(), AdapterError> {
        let url = format!("{}/health", self.endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_http_failure(None, !e.is_connect(), true, &e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(classify_http_failure(Some(response.status().as_u16()), true, true, "health check"))
        }
    }
}
