//! # In-Memory Adapters
//!
//! Process-local stand-ins for messaging, calendar, issue tracker,
//! documentation and language model. Used by tests and by `supermon run --offline`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{AdapterError, AdapterRequest, Capability, CapabilityAdapter};
use crate::state::Conversation;

fn poisoned<T>(e: std::sync::PoisonError<T>) -> AdapterError {
    AdapterError::Permanent(format!("adapter state poisoned: {}", e))
}

fn str_param<'a>(request: &'a AdapterRequest, key: &str) -> Result<&'a str, AdapterError> {
    request
        .params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| AdapterError::Permanent(format!("missing parameter '{}'", key)))
}

fn unsupported(adapter: &str, request: &AdapterRequest) -> AdapterError {
    AdapterError::Permanent(format!(
        "{} does not support operation '{}'",
        adapter, request.operation
    ))
}

/// A message delivered through [`InMemoryMessaging`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentMessage {
    pub message_id: String,
    pub channel: String,
    pub recipient: Option<String>,
    pub text: String,
    pub idempotency_key: String,
}

/// Messaging platform holding conversations and recording sends.
/// Repeated sends with the same idempotency key are delivered once.
pub struct InMemoryMessaging {
    name: String,
    conversations: Mutex<HashMap<String, Conversation>>,
    sent: Mutex<Vec<SentMessage>>,
    delivered: Mutex<HashMap<String, String>>,
    failures: Mutex<VecDeque<AdapterError>>,
    rejected: Mutex<Vec<(String, AdapterError)>>,
}

impl Default for InMemoryMessaging {
    fn default() -> Self {
        Self::named("memory-messaging")
    }
}

impl InMemoryMessaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            conversations: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            delivered: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            rejected: Mutex::new(Vec::new()),
        }
    }

    pub fn with_conversation(self, conversation: Conversation) -> Self {
        self.add_conversation(conversation);
        self
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        if let Ok(mut map) = self.conversations.lock() {
            map.insert(conversation.reference.clone(), conversation);
        }
    }

    /// The next call fails with `err`.
    pub fn fail_next(&self, err: AdapterError) {
        if let Ok(mut queue) = self.failures.lock() {
            queue.push_back(err);
        }
    }

    /// Every send whose text starts with `prefix` fails with `err`.
    pub fn reject_sends_starting_with(&self, prefix: &str, err: AdapterError) {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.push((prefix.to_string(), err));
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CapabilityAdapter for InMemoryMessaging {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Messaging]
    }

    async fn invoke(&self, request: AdapterRequest) -> Result<Value, AdapterError> {
        if let Some(err) = self.failures.lock().map_err(poisoned)?.pop_front() {
            return Err(err);
        }

        match request.operation.as_str() {
            "fetch_conversation" => {
                let reference = str_param(&request, "conversation_ref")?;
                let conversations = self.conversations.lock().map_err(poisoned)?;
                let conversation = conversations.get(reference).ok_or_else(|| {
                    AdapterError::Permanent(format!("conversation not found: {}", reference))
                })?;
                serde_json::to_value(conversation)
                    .map_err(|e| AdapterError::Permanent(e.to_string()))
            }
            "send_message" => {
                let channel = str_param(&request, "channel")?.to_string();
                let text = str_param(&request, "text")?.to_string();
                let recipient = request
                    .params
                    .get("recipient")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let key = request.idempotency_key.as_str().to_string();

                if let Some((_, err)) = self
                    .rejected
                    .lock()
                    .map_err(poisoned)?
                    .iter()
                    .find(|(prefix, _)| text.starts_with(prefix.as_str()))
                {
                    return Err(err.clone());
                }

                let mut delivered = self.delivered.lock().map_err(poisoned)?;
                if let Some(existing) = delivered.get(&key) {
                    return Ok(json!({ "message_id": existing, "duplicate": true }));
                }

                let mut sent = self.sent.lock().map_err(poisoned)?;
                let message_id = format!("msg-{}", sent.len() + 1);
                sent.push(SentMessage {
                    message_id: message_id.clone(),
                    channel,
                    recipient,
                    text,
                    idempotency_key: key.clone(),
                });
                delivered.insert(key, message_id.clone());
                Ok(json!({ "message_id": message_id }))
            }
            _ => Err(unsupported(&self.name, &request)),
        }
    }
}

/// Calendar without server-side deduplication: every `schedule_meeting`
/// creates an entry. Callers look up by key first.
pub struct InMemoryCalendar {
    meetings: Mutex<HashMap<String, Value>>,
    created: AtomicUsize,
    failures: Mutex<VecDeque<AdapterError>>,
    lose_next_response: Mutex<bool>,
}

impl Default for InMemoryCalendar {
    fn default() -> Self {
        Self {
            meetings: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            lose_next_response: Mutex::new(false),
        }
    }
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calendar entries ever created
    pub fn meetings_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, err: AdapterError) {
        if let Ok(mut queue) = self.failures.lock() {
            queue.push_back(err);
        }
    }

    /// The next `schedule_meeting` creates the entry, then reports a
    /// transient failure as if the response was lost.
    pub fn lose_next_response(&self) {
        if let Ok(mut flag) = self.lose_next_response.lock() {
            *flag = true;
        }
    }
}

#[async_trait]
impl CapabilityAdapter for InMemoryCalendar {
    fn name(&self) -> &str {
        "memory-calendar"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Calendar]
    }

    async fn invoke(&self, request: AdapterRequest) -> Result<Value, AdapterError> {
        if let Some(err) = self.failures.lock().map_err(poisoned)?.pop_front() {
            return Err(err);
        }

        match request.operation.as_str() {
            "find_meeting" => {
                let key = str_param(&request, "idempotency_key")?;
                let meetings = self.meetings.lock().map_err(poisoned)?;
                Ok(json!({ "meeting": meetings.get(key).cloned() }))
            }
            "schedule_meeting" => {
                let key = str_param(&request, "idempotency_key")?.to_string();
                let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
                let mut meeting = request.params.clone();
                if let Some(obj) = meeting.as_object_mut() {
                    obj.insert("meeting_id".to_string(), json!(format!("cal-{}", n)));
                }
                self.meetings
                    .lock()
                    .map_err(poisoned)?
                    .insert(key, meeting.clone());

                let mut lose = self.lose_next_response.lock().map_err(poisoned)?;
                if *lose {
                    *lose = false;
                    return Err(AdapterError::Transient("response lost".to_string()));
                }
                Ok(meeting)
            }
            _ => Err(unsupported("memory-calendar", &request)),
        }
    }
}

/// Issue tracker keyed by idempotency key
#[derive(Default)]
pub struct InMemoryIssueTracker {
    issues: Mutex<HashMap<String, Value>>,
    created: AtomicUsize,
}

impl InMemoryIssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issues_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityAdapter for InMemoryIssueTracker {
    fn name(&self) -> &str {
        "memory-issues"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::IssueTracker]
    }

    async fn invoke(&self, request: AdapterRequest) -> Result<Value, AdapterError> {
        match request.operation.as_str() {
            "find_issue" => {
                let key = str_param(&request, "idempotency_key")?;
                let issues = self.issues.lock().map_err(poisoned)?;
                Ok(json!({ "issue": issues.get(key).cloned() }))
            }
            "create_issue" => {
                let key = str_param(&request, "idempotency_key")?.to_string();
                let title = str_param(&request, "title")?.to_string();
                let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
                let issue = json!({ "issue_id": format!("ISSUE-{}", n), "title": title });
                self.issues
                    .lock()
                    .map_err(poisoned)?
                    .insert(key, issue.clone());
                Ok(issue)
            }
            _ => Err(unsupported("memory-issues", &request)),
        }
    }
}

/// Documentation space without server-side deduplication, like the
/// calendar: callers look a page up by key before creating it.
#[derive(Default)]
pub struct InMemoryDocumentation {
    pages: Mutex<HashMap<String, Value>>,
    created: AtomicUsize,
    lose_next_response: Mutex<bool>,
}

impl InMemoryDocumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pages_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// The next `create_page` stores the page, then reports a transient
    /// failure as if the response was lost.
    pub fn lose_next_response(&self) {
        if let Ok(mut flag) = self.lose_next_response.lock() {
            *flag = true;
        }
    }
}

#[async_trait]
impl CapabilityAdapter for InMemoryDocumentation {
    fn name(&self) -> &str {
        "memory-docs"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Documentation]
    }

    async fn invoke(&self, request: AdapterRequest) -> Result<Value, AdapterError> {
        match request.operation.as_str() {
            "find_page" => {
                let key = str_param(&request, "idempotency_key")?;
                let pages = self.pages.lock().map_err(poisoned)?;
                Ok(json!({ "page": pages.get(key).cloned() }))
            }
            "create_page" => {
                let key = str_param(&request, "idempotency_key")?.to_string();
                let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
                let mut page = request.params.clone();
                if let Some(obj) = page.as_object_mut() {
                    obj.insert("page_id".to_string(), json!(format!("page-{}", n)));
                }
                self.pages.lock().map_err(poisoned)?.insert(key, page.clone());

                let mut lose = self.lose_next_response.lock().map_err(poisoned)?;
                if *lose {
                    *lose = false;
                    return Err(AdapterError::Transient("response lost".to_string()));
                }
                Ok(page)
            }
            _ => Err(unsupported("memory-docs", &request)),
        }
    }
}

type Responder = Box<dyn Fn(&AdapterRequest) -> Result<Value, AdapterError> + Send + Sync>;

/// Language model answering from a queue of scripted responses, then from
/// an optional responder function.
pub struct ScriptedLanguageModel {
    queue: Mutex<VecDeque<Result<Value, AdapterError>>>,
    responder: Option<Responder>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl Default for ScriptedLanguageModel {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }
}

impl ScriptedLanguageModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call not covered by the queue with `f`.
    pub fn responding_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&AdapterRequest) -> Result<Value, AdapterError> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(f));
        self
    }

    /// Sleep before each answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a completion whose text is `value` serialized.
    pub fn push_json(&self, value: Value) {
        self.push_text(&value.to_string());
    }

    pub fn push_text(&self, text: &str) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Ok(json!({ "text": text })));
        }
    }

    pub fn push_error(&self, err: AdapterError) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Err(err));
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityAdapter for ScriptedLanguageModel {
    fn name(&self) -> &str {
        "scripted-llm"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::LanguageModel]
    }

    async fn invoke(&self, request: AdapterRequest) -> Result<Value, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self.queue.lock().map_err(poisoned)?.pop_front();
        match (queued, &self.responder) {
            (Some(result), _) => result,
            (None, Some(responder)) => responder(&request),
            (None, None) => Err(AdapterError::Permanent(
                "no scripted response left".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::IdempotencyKey;
    use crate::workflow::Stage;

    fn request(capability: Capability, operation: &str, params: Value, scope: &str) -> AdapterRequest {
        AdapterRequest {
            capability,
            operation: operation.to_string(),
            params,
            idempotency_key: IdempotencyKey::new("run-1", Stage::MeetingCoordination, scope),
        }
    }

    #[tokio::test]
    async fn test_messaging_dedups_by_key() {
        let messaging = InMemoryMessaging::new();
        let params = json!({"channel": "general", "text": "Planning meeting tomorrow"});

        let first = messaging
            .invoke(request(Capability::Messaging, "send_message", params.clone(), "announce"))
            .await
            .unwrap();
        let second = messaging
            .invoke(request(Capability::Messaging, "send_message", params, "announce"))
            .await
            .unwrap();

        assert_eq!(first["message_id"], second["message_id"]);
        assert_eq!(messaging.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_calendar_find_after_lost_response() {
        let calendar = InMemoryCalendar::new();
        calendar.lose_next_response();

        let params = json!({"title": "Planning", "idempotency_key": "k1"});
        let err = calendar
            .invoke(request(Capability::Calendar, "schedule_meeting", params, "meeting"))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let found = calendar
            .invoke(request(
                Capability::Calendar,
                "find_meeting",
                json!({"idempotency_key": "k1"}),
                "meeting",
            ))
            .await
            .unwrap();
        assert_eq!(found["meeting"]["meeting_id"], "cal-1");
        assert_eq!(calendar.meetings_created(), 1);
    }

    #[tokio::test]
    async fn test_scripted_model_queue_then_responder() {
        let model = ScriptedLanguageModel::new()
            .responding_with(|_| Ok(json!({"text": "fallback"})));
        model.push_text("first");

        let req = || request(Capability::LanguageModel, "complete", json!({}), "llm");
        assert_eq!(model.invoke(req()).await.unwrap()["text"], "first");
        assert_eq!(model.invoke(req()).await.unwrap()["text"], "fallback");
        assert_eq!(model.calls(), 2);
    }
}
