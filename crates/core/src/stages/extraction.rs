//! # Requirements Extraction
//!
//! Reads each referenced conversation through the messaging capability and
//! pulls out candidate requirements, with the language model when one is
//! registered and keyword heuristics otherwise.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::OnceLock;

use super::{prompts, PriorOutputs, RunContext, StageProcessor};
use crate::adapters::{complete_json, Capability, ScopedCapabilities};
use crate::error::StageError;
use crate::state::{
    Conversation, ConversationMessage, ExtractionOutput, Requirement, RequirementCategory,
    SourceRef, StagePayload,
};
use crate::workflow::Stage;

#[derive(Debug, Deserialize)]
struct ExtractedBatch {
    #[serde(default)]
    requirements: Vec<ExtractedRequirement>,
}

#[derive(Debug, Deserialize)]
struct ExtractedRequirement {
    text: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    message_ids: Vec<String>,
}

/// Candidate before ids are assigned
struct Candidate {
    text: String,
    category: RequirementCategory,
    confidence: f64,
    sources: Vec<SourceRef>,
}

pub struct ExtractionProcessor;

#[async_trait]
impl StageProcessor for ExtractionProcessor {
    fn stage(&self) -> Stage {
        Stage::Extraction
    }

    #[tracing::instrument(skip_all, fields(run_id = %ctx.run_id, attempt = ctx.attempt))]
    async fn process(
        &self,
        ctx: &RunContext,
        _prior: &PriorOutputs,
        caps: &ScopedCapabilities,
    ) -> Result<StagePayload, StageError> {
        if ctx.conversation_refs.is_empty() {
            return Err(StageError::Permanent(
                "run has no conversation references".to_string(),
            ));
        }

        let use_model = caps.has(Capability::LanguageModel);
        let mut candidates = Vec::new();
        let mut discarded = 0;
        let mut non_empty = 0;

        for reference in &ctx.conversation_refs {
            let conversation = fetch_conversation(ctx, caps, reference).await?;
            if conversation.messages.is_empty() {
                tracing::warn!(conversation = %reference, "Conversation has no messages");
                continue;
            }
            non_empty += 1;

            let found = if use_model {
                model_candidates(ctx, caps, &conversation).await?
            } else {
                heuristic_candidates(&conversation, ctx.thresholds.heuristic_confidence)
            };

            for candidate in found {
                if candidate.confidence < ctx.thresholds.confidence_floor {
                    discarded += 1;
                } else {
                    candidates.push(candidate);
                }
            }
        }

        if non_empty == 0 {
            return Err(StageError::Permanent(
                "referenced conversations contain no messages".to_string(),
            ));
        }

        let candidates: Vec<Requirement> = candidates
            .into_iter()
            .enumerate()
            .map(|(i, c)| Requirement {
                id: format!("REQ-{:03}", i + 1),
                text: c.text,
                category: c.category,
                confidence: c.confidence,
                sources: c.sources,
                dedup_key: String::new(),
                needs_review: false,
                review_reason: None,
            })
            .collect();

        tracing::info!(
            candidates = candidates.len(),
            discarded,
            heuristics = !use_model,
            "Extracted requirement candidates"
        );

        Ok(StagePayload::Extraction(ExtractionOutput {
            candidates,
            discarded,
            conversations: ctx.conversation_refs.clone(),
            used_heuristics: !use_model,
        }))
    }
}

async fn fetch_conversation(
    ctx: &RunContext,
    caps: &ScopedCapabilities,
    reference: &str,
) -> Result<Conversation, StageError> {
    let value = caps
        .invoke(
            Capability::Messaging,
            "fetch_conversation",
            json!({ "conversation_ref": reference }),
            ctx.key(&format!("fetch:{}", reference)),
        )
        .await?;

    let mut conversation: Conversation = serde_json::from_value(value).map_err(|e| {
        StageError::Permanent(format!("malformed conversation {}: {}", reference, e))
    })?;
    conversation.reference = reference.to_string();
    conversation.messages.sort_by_key(|m| m.timestamp);
    Ok(conversation)
}

fn transcript(conversation: &Conversation) -> String {
    conversation
        .messages
        .iter()
        .map(|m| format!("[{}] {} {}: {}", m.id, m.timestamp.to_rfc3339(), m.sender, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn source_for(conversation: &Conversation, message: &ConversationMessage) -> SourceRef {
    SourceRef {
        timestamp: message.timestamp,
        conversation_ref: conversation.reference.clone(),
        message_id: message.id.clone(),
    }
}

async fn model_candidates(
    ctx: &RunContext,
    caps: &ScopedCapabilities,
    conversation: &Conversation,
) -> Result<Vec<Candidate>, StageError> {
    let prompt = format!(
        "Conversation {}:\n{}",
        conversation.reference,
        transcript(conversation)
    );
    let batch: ExtractedBatch = complete_json(
        caps,
        prompts::REQUIREMENTS_EXTRACTOR,
        &prompt,
        ctx.key(&format!("llm:{}", conversation.reference)),
    )
    .await?;

    let mut candidates = Vec::new();
    for item in batch.requirements {
        let text = item.text.trim();
        if text.is_empty() {
            continue;
        }

        let mut sources: Vec<SourceRef> = conversation
            .messages
            .iter()
            .filter(|m| item.message_ids.iter().any(|id| id == &m.id))
            .map(|m| source_for(conversation, m))
            .collect();
        if sources.is_empty() {
            // Model cited nothing usable; attribute to the opening message.
            if let Some(first) = conversation.messages.first() {
                sources.push(source_for(conversation, first));
            }
        }

        let confidence = item
            .confidence
            .filter(|c| c.is_finite())
            .unwrap_or(ctx.thresholds.heuristic_confidence)
            .clamp(0.0, 1.0);

        candidates.push(Candidate {
            text: text.to_string(),
            category: RequirementCategory::from_label(&item.category),
            confidence,
            sources,
        });
    }
    Ok(candidates)
}

fn sentence_splitter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?;\n]+").expect("static regex"))
}

fn requirement_keywords() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(need|needs|must|should|require|requires|required|want|wants|have to|has to|support|allow|allows|ability|able to|make sure|ensure)\b",
        )
        .expect("static regex")
    })
}

fn strong_keywords() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(must|required|have to|has to)\b").expect("static regex"))
}

/// Guess a category from vocabulary.
pub fn categorize(text: &str) -> RequirementCategory {
    static NON_FUNCTIONAL: OnceLock<Regex> = OnceLock::new();
    static TECHNICAL: OnceLock<Regex> = OnceLock::new();
    static BUSINESS: OnceLock<Regex> = OnceLock::new();

    let non_functional = NON_FUNCTIONAL.get_or_init(|| {
        Regex::new(r"(?i)\b(fast|faster|performance|latency|secure|security|encrypt\w*|scal\w*|reliab\w*|uptime|availability|accessib\w*|responsive)\b")
            .expect("static regex")
    });
    let technical = TECHNICAL.get_or_init(|| {
        Regex::new(r"(?i)\b(api|apis|database|integrat\w*|deploy\w*|infrastructure|migrat\w*|architecture|backend|server|webhook\w*)\b")
            .expect("static regex")
    });
    let business = BUSINESS.get_or_init(|| {
        Regex::new(r"(?i)\b(revenue|cost|costs|budget|customer\w*|market\w*|sales|pricing|roi|compliance|billing)\b")
            .expect("static regex")
    });

    if non_functional.is_match(text) {
        RequirementCategory::NonFunctional
    } else if technical.is_match(text) {
        RequirementCategory::Technical
    } else if business.is_match(text) {
        RequirementCategory::Business
    } else {
        RequirementCategory::Functional
    }
}

/// Keyword extraction: every sentence with requirement vocabulary and at
/// least three words becomes a candidate.
fn heuristic_candidates(conversation: &Conversation, base_confidence: f64) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for message in &conversation.messages {
        for sentence in sentence_splitter().split(&message.content) {
            let sentence = sentence.trim();
            if sentence.split_whitespace().count() < 3 || !requirement_keywords().is_match(sentence) {
                continue;
            }
            let confidence = if strong_keywords().is_match(sentence) {
                (base_confidence + 0.2).min(1.0)
            } else {
                base_confidence
            };
            candidates.push(Candidate {
                text: sentence.to_string(),
                category: categorize(sentence),
                confidence,
                sources: vec![source_for(conversation, message)],
            });
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterError, InMemoryMessaging, ScriptedLanguageModel};
    use crate::stages::testing::{context, scoped};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn conversation(reference: &str, lines: &[(&str, &str)]) -> Conversation {
        Conversation {
            reference: reference.to_string(),
            channel: Some("product".to_string()),
            participants: vec!["alice".into(), "bob".into()],
            messages: lines
                .iter()
                .enumerate()
                .map(|(i, (id, content))| ConversationMessage {
                    id: id.to_string(),
                    sender: if i % 2 == 0 { "alice".into() } else { "bob".into() },
                    content: content.to_string(),
                    timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 10, i as u32, 0).unwrap(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_no_references_is_permanent() {
        let mut ctx = context(Stage::Extraction);
        ctx.conversation_refs.clear();
        let caps = scoped(vec![], &[Capability::Messaging]);

        let err = ExtractionProcessor
            .process(&ctx, &PriorOutputs::default(), &caps)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_empty_conversation_is_permanent() {
        let ctx = context(Stage::Extraction);
        let messaging = InMemoryMessaging::new().with_conversation(conversation("slack:C42", &[]));
        let caps = scoped(vec![Arc::new(messaging)], &[Capability::Messaging]);

        let err = ExtractionProcessor
            .process(&ctx, &PriorOutputs::default(), &caps)
            .await
            .unwrap_err();
        assert!(err.reason().contains("no messages"));
    }

    #[tokio::test]
    async fn test_heuristic_extraction_without_model() {
        let ctx = context(Stage::Extraction);
        let messaging = InMemoryMessaging::new().with_conversation(conversation(
            "slack:C42",
            &[
                ("m1", "Morning all! Users must be able to reset their password via email."),
                ("m2", "ok"),
                ("m3", "The dashboard should load fast for every user."),
            ],
        ));
        let caps = scoped(vec![Arc::new(messaging)], &[Capability::LanguageModel, Capability::Messaging]);

        let payload = ExtractionProcessor
            .process(&ctx, &PriorOutputs::default(), &caps)
            .await
            .unwrap();
        let StagePayload::Extraction(out) = payload else {
            panic!("wrong payload");
        };

        assert!(out.used_heuristics);
        assert_eq!(out.candidates.len(), 2);
        assert_eq!(out.candidates[0].id, "REQ-001");
        assert!((out.candidates[0].confidence - 0.7).abs() < 1e-9);
        assert_eq!(out.candidates[0].sources[0].message_id, "m1");
        assert_eq!(out.candidates[1].category, RequirementCategory::NonFunctional);
    }

    #[tokio::test]
    async fn test_model_extraction_applies_floor() {
        let ctx = context(Stage::Extraction);
        let messaging = InMemoryMessaging::new().with_conversation(conversation(
            "slack:C42",
            &[("m1", "We need SSO"), ("m2", "maybe dark mode someday")],
        ));
        let model = ScriptedLanguageModel::new();
        model.push_json(json!({"requirements": [
            {"text": "Support single sign-on", "category": "technical", "confidence": 0.9, "message_ids": ["m1"]},
            {"text": "Dark mode", "category": "functional", "confidence": 0.1, "message_ids": ["m2"]},
            {"text": "  ", "confidence": 0.9}
        ]}));
        let caps = scoped(
            vec![Arc::new(messaging), Arc::new(model)],
            &[Capability::LanguageModel, Capability::Messaging],
        );

        let payload = ExtractionProcessor
            .process(&ctx, &PriorOutputs::default(), &caps)
            .await
            .unwrap();
        let StagePayload::Extraction(out) = payload else {
            panic!("wrong payload");
        };

        assert!(!out.used_heuristics);
        assert_eq!(out.discarded, 1);
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].category, RequirementCategory::Technical);
        assert_eq!(out.candidates[0].sources[0].conversation_ref, "slack:C42");
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_classification() {
        let ctx = context(Stage::Extraction);
        let messaging = InMemoryMessaging::new();
        messaging.fail_next(AdapterError::Transient("rate limited".into()));
        let caps = scoped(vec![Arc::new(messaging)], &[Capability::Messaging]);

        let err = ExtractionProcessor
            .process(&ctx, &PriorOutputs::default(), &caps)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_categorize() {
        assert_eq!(categorize("Pages must load fast"), RequirementCategory::NonFunctional);
        assert_eq!(categorize("Expose a REST API for orders"), RequirementCategory::Technical);
        assert_eq!(categorize("Reduce billing disputes"), RequirementCategory::Business);
        assert_eq!(categorize("Users can export reports"), RequirementCategory::Functional);
    }
}
