//! # Capability Adapters
//!
//! Uniform boundary between stage processors and external services. Every
//! call carries an idempotency key and fails with a classified
//! [`AdapterError`].

pub mod llm;
pub mod mcp;
pub mod memory;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub use crate::error::AdapterError;
pub use llm::{complete_json, LanguageModelAdapter};
pub use mcp::{register_mcp_adapters, McpAdapter, McpService, MCP_SERVICES};
pub use memory::{
    InMemoryCalendar, InMemoryDocumentation, InMemoryIssueTracker, InMemoryMessaging,
    ScriptedLanguageModel,
};
pub use retry::{with_retry, BackoffPolicy, RetryPolicy};

use crate::workflow::Stage;

/// What an adapter can do for a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    LanguageModel,
    Messaging,
    Calendar,
    IssueTracker,
    Documentation,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LanguageModel => "language_model",
            Self::Messaging => "messaging",
            Self::Calendar => "calendar",
            Self::IssueTracker => "issue_tracker",
            Self::Documentation => "documentation",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key that lets a service recognise a repeated call.
///
/// Stable for a given (run, stage, scope), so a re-invoked stage sends the
/// same keys as the attempt it replaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(run_id: &str, stage: Stage, scope: &str) -> Self {
        Self(format!("{}:{}:{}", run_id, stage, scope))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One adapter call
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    pub capability: Capability,
    pub operation: String,
    pub params: Value,
    pub idempotency_key: IdempotencyKey,
}

/// Connection status of one adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterStatus {
    pub name: String,
    pub capabilities: Vec<Capability>,
    pub connected: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

/// An external service wrapped behind the capability contract
#[async_trait]
pub trait CapabilityAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    async fn invoke(&self, request: AdapterRequest) -> Result<Value, AdapterError>;

    /// Connection check; adapters without one report connected.
    async fn health(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Classify a failed HTTP exchange.
///
/// `status` is `None` when no response arrived. A request that may have
/// reached a non-idempotent endpoint is not safe to repeat, so an unknown
/// outcome there is permanent.
pub fn classify_http_failure(
    status: Option<u16>,
    request_sent: bool,
    idempotent: bool,
    detail: &str,
) -> AdapterError {
    match status {
        Some(code) if code == 408 || code == 425 || code == 429 || (500..600).contains(&code) => {
            AdapterError::Transient(format!("HTTP {}: {}", code, detail))
        }
        Some(code) => AdapterError::Permanent(format!("HTTP {}: {}", code, detail)),
        None if !request_sent => AdapterError::Transient(format!("connection failed: {}", detail)),
        None if idempotent => AdapterError::Transient(format!("no response: {}", detail)),
        None => AdapterError::Permanent(format!(
            "outcome unknown for non-idempotent call, not retrying: {}",
            detail
        )),
    }
}

/// Adapters bound to capabilities. The first adapter registered for a
/// capability serves it.
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn CapabilityAdapter>>,
    bindings: HashMap<Capability, Arc<dyn CapabilityAdapter>>,
    call_timeout: Duration,
}

impl AdapterRegistry {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            adapters: Vec::new(),
            bindings: HashMap::new(),
            call_timeout,
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn CapabilityAdapter>) {
        for capability in adapter.capabilities() {
            self.bindings
                .entry(*capability)
                .or_insert_with(|| Arc::clone(&adapter));
        }
        tracing::debug!(adapter = adapter.name(), capabilities = ?adapter.capabilities(), "Registered adapter");
        self.adapters.push(adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn CapabilityAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, capability: Capability) -> Option<Arc<dyn CapabilityAdapter>> {
        self.bindings.get(&capability).cloned()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// A view limited to `allowed`, with calls bounded by `deadline`.
    pub fn scoped(&self, allowed: &[Capability], deadline: Instant) -> ScopedCapabilities {
        let bindings = allowed
            .iter()
            .filter_map(|cap| self.get(*cap).map(|adapter| (*cap, adapter)))
            .collect();
        ScopedCapabilities {
            allowed: allowed.to_vec(),
            bindings,
            call_timeout: self.call_timeout,
            deadline,
        }
    }

    /// Health of every registered adapter
    pub async fn connection_status(&self) -> Vec<AdapterStatus> {
        let mut statuses = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let result = tokio::time::timeout(self.call_timeout, adapter.health()).await;
            let (connected, detail) = match result {
                Ok(Ok(())) => (true, None),
                Ok(Err(e)) => (false, Some(e.to_string())),
                Err(_) => (false, Some("health check timed out".to_string())),
            };
            statuses.push(AdapterStatus {
                name: adapter.name().to_string(),
                capabilities: adapter.capabilities().to_vec(),
                connected,
                detail,
            });
        }
        statuses
    }
}

/// The capabilities one stage may use during one attempt
pub struct ScopedCapabilities {
    allowed: Vec<Capability>,
    bindings: HashMap<Capability, Arc<dyn CapabilityAdapter>>,
    call_timeout: Duration,
    deadline: Instant,
}

impl ScopedCapabilities {
    /// Permitted and backed by an adapter.
    pub fn has(&self, capability: Capability) -> bool {
        self.bindings.contains_key(&capability)
    }

    pub fn allowed(&self) -> &[Capability] {
        &self.allowed
    }

    /// Invoke `operation` on the adapter serving `capability`.
    ///
    /// Fails permanently for capabilities outside the stage's role, and
    /// transiently when the call outlives its timeout or the stage budget.
    pub async fn invoke(
        &self,
        capability: Capability,
        operation: &str,
        params: Value,
        idempotency_key: IdempotencyKey,
    ) -> Result<Value, AdapterError> {
        if !self.allowed.contains(&capability) {
            return Err(AdapterError::Permanent(format!(
                "capability {} is not permitted for this stage",
                capability
            )));
        }
        let adapter = self.bindings.get(&capability).ok_or_else(|| {
            AdapterError::Permanent(format!("no adapter registered for {}", capability))
        })?;

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AdapterError::Transient("stage time budget exhausted".to_string()));
        }
        let timeout = self.call_timeout.min(remaining);

        let request = AdapterRequest {
            capability,
            operation: operation.to_string(),
            params,
            idempotency_key,
        };

        tracing::debug!(
            adapter = adapter.name(),
            %capability,
            operation,
            key = %request.idempotency_key,
            "Adapter call"
        );

        match tokio::time::timeout(timeout, adapter.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Transient(format!(
                "{} {} timed out after {:?}",
                adapter.name(),
                operation,
                timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_http_classification() {
        assert!(classify_http_failure(Some(429), true, false, "").is_transient());
        assert!(classify_http_failure(Some(503), true, false, "").is_transient());
        assert!(classify_http_failure(Some(408), true, true, "").is_transient());
        assert!(!classify_http_failure(Some(400), true, true, "").is_transient());
        assert!(!classify_http_failure(Some(404), true, true, "").is_transient());
        assert!(classify_http_failure(None, false, false, "refused").is_transient());
        assert!(classify_http_failure(None, true, true, "reset").is_transient());
        assert!(!classify_http_failure(None, true, false, "reset").is_transient());
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let a = IdempotencyKey::new("run-1", Stage::MeetingCoordination, "meeting");
        let b = IdempotencyKey::new("run-1", Stage::MeetingCoordination, "meeting");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "run-1:meeting_coordination:meeting");
    }

    #[tokio::test]
    async fn test_scope_rejects_disallowed_capability() {
        let registry = AdapterRegistry::new(Duration::from_secs(1))
            .with(Arc::new(InMemoryMessaging::new()))
            .with(Arc::new(InMemoryCalendar::new()));
        let scoped = registry.scoped(
            &[Capability::LanguageModel],
            Instant::now() + Duration::from_secs(5),
        );

        assert!(!scoped.has(Capability::Messaging));
        let err = scoped
            .invoke(
                Capability::Messaging,
                "send_message",
                json!({"channel": "general", "text": "hi"}),
                IdempotencyKey::new("r", Stage::Extraction, "x"),
            )
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.reason().contains("not permitted"));

        let err = scoped
            .invoke(
                Capability::LanguageModel,
                "complete",
                json!({}),
                IdempotencyKey::new("r", Stage::Extraction, "y"),
            )
            .await
            .unwrap_err();
        assert!(err.reason().contains("no adapter registered"));
    }

    #[tokio::test]
    async fn test_call_timeout_is_transient() {
        let slow = ScriptedLanguageModel::new().with_delay(Duration::from_millis(200));
        let registry = AdapterRegistry::new(Duration::from_millis(20)).with(Arc::new(slow));
        let scoped = registry.scoped(
            &[Capability::LanguageModel],
            Instant::now() + Duration::from_secs(5),
        );

        let err = scoped
            .invoke(
                Capability::LanguageModel,
                "complete",
                json!({"prompt": "x"}),
                IdempotencyKey::new("r", Stage::Extraction, "llm"),
            )
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.reason().contains("timed out"));
    }

    #[tokio::test]
    async fn test_first_registration_wins() {
        let registry = AdapterRegistry::new(Duration::from_secs(1))
            .with(Arc::new(InMemoryMessaging::named("slack")))
            .with(Arc::new(InMemoryMessaging::named("whatsapp")));
        let adapter = registry.get(Capability::Messaging).unwrap();
        assert_eq!(adapter.name(), "slack");

        let statuses = registry.connection_status().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.connected));
    }
}
