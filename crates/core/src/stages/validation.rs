//! # Validation and Deduplication
//!
//! Folds candidates that say the same thing into one requirement and flags
//! weak ones for review. Review-flagged requirements stay in the payload but
//! do not block the run.

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use super::{PriorOutputs, RunContext, StageProcessor};
use crate::adapters::ScopedCapabilities;
use crate::config::Thresholds;
use crate::error::StageError;
use crate::state::{Requirement, StagePayload, ValidationOutput};
use crate::workflow::Stage;

/// Cause recorded when nothing survives validation
pub const NO_SIGNAL: &str = "no-signal";

const STOPWORDS: &[&str] = &[
    "a", "able", "about", "all", "also", "an", "and", "any", "are", "as", "at", "be", "being",
    "by", "can", "could", "do", "for", "from", "have", "has", "i", "in", "into", "is", "it",
    "its", "just", "let", "like", "make", "more", "must", "need", "needs", "of", "on", "or",
    "our", "please", "really", "should", "so", "some", "sure", "that", "the", "their", "them",
    "there", "they", "this", "to", "us", "via", "want", "wants", "we", "will", "with", "would",
    "you", "your",
];

/// Runs of letters and digits in any script. Han and kana are written
/// without spaces, so each of their characters counts as a word.
fn word_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\p{Han}|\p{Hiragana}|\p{Katakana}|[\p{L}\p{N}&&[^\p{Han}\p{Hiragana}\p{Katakana}]]+")
            .expect("static regex")
    })
}

fn normalize_token(token: &str) -> String {
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        token[..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}

/// Content words of `text`, lowercased and singularized, in order.
fn meaningful_words(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    word_pattern()
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|w| !STOPWORDS.contains(w))
        .map(normalize_token)
        .collect()
}

/// Normalized fingerprint: texts that differ only in word order, case,
/// punctuation, filler words or plurals share a key.
pub fn dedup_key(text: &str) -> String {
    let mut words = meaningful_words(text);
    words.sort();
    words.dedup();

    let basis = if words.is_empty() {
        text.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    } else {
        words.join(" ")
    };
    let digest = Sha256::digest(basis.as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

/// Merge candidates sharing a dedup key. The survivor keeps the first id,
/// the highest confidence with its text, and the union of sources.
/// Returns the merged requirements in first-seen order and the number of
/// candidates folded away.
pub fn deduplicate(candidates: Vec<Requirement>) -> (Vec<Requirement>, usize) {
    let mut merged: Vec<Requirement> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut folded = 0;

    for mut candidate in candidates {
        candidate.dedup_key = dedup_key(&candidate.text);
        match by_key.get(&candidate.dedup_key) {
            Some(&index) => {
                folded += 1;
                let survivor = &mut merged[index];
                if candidate.confidence > survivor.confidence {
                    survivor.confidence = candidate.confidence;
                    survivor.text = candidate.text;
                    survivor.category = candidate.category;
                }
                survivor.sources.extend(candidate.sources);
                survivor.sources.sort();
                survivor.sources.dedup();
            }
            None => {
                candidate.sources.sort();
                candidate.sources.dedup();
                by_key.insert(candidate.dedup_key.clone(), merged.len());
                merged.push(candidate);
            }
        }
    }

    (merged, folded)
}

/// Set `needs_review` and the reason on weak requirements.
fn flag_for_review(requirement: &mut Requirement, thresholds: &Thresholds) {
    let reason = if requirement.confidence < thresholds.acceptance_threshold {
        Some(format!(
            "confidence {:.2} below acceptance threshold {:.2}",
            requirement.confidence, thresholds.acceptance_threshold
        ))
    } else if meaningful_words(&requirement.text).len() < thresholds.min_meaningful_words {
        Some("too vague to act on".to_string())
    } else {
        None
    };
    requirement.needs_review = reason.is_some();
    requirement.review_reason = reason;
}

fn summarize(requirements: &[Requirement], counts: &BTreeMap<String, usize>) -> String {
    let review = requirements.iter().filter(|r| r.needs_review).count();
    let breakdown = counts
        .iter()
        .map(|(category, n)| format!("{} {}", n, category))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{} requirements ({} accepted, {} need review): {}",
        requirements.len(),
        requirements.len() - review,
        review,
        breakdown
    )
}

pub struct ValidationProcessor;

#[async_trait]
impl StageProcessor for ValidationProcessor {
    fn stage(&self) -> Stage {
        Stage::Validation
    }

    fn inputs(&self) -> &'static [Stage] {
        &[Stage::Extraction]
    }

    #[tracing::instrument(skip_all, fields(run_id = %ctx.run_id, attempt = ctx.attempt))]
    async fn process(
        &self,
        ctx: &RunContext,
        prior: &PriorOutputs,
        _caps: &ScopedCapabilities,
    ) -> Result<StagePayload, StageError> {
        let extraction = prior.extraction()?;
        let (mut requirements, merged) = deduplicate(extraction.candidates.clone());

        for requirement in &mut requirements {
            flag_for_review(requirement, &ctx.thresholds);
        }

        let accepted = requirements.iter().filter(|r| !r.needs_review).count();
        if accepted == 0 {
            return Err(StageError::Permanent(format!(
                "{}: none of {} requirements passed validation",
                NO_SIGNAL,
                requirements.len()
            )));
        }

        let mut category_counts = BTreeMap::new();
        for requirement in &requirements {
            *category_counts
                .entry(requirement.category.as_str().to_string())
                .or_insert(0) += 1;
        }
        let summary = summarize(&requirements, &category_counts);

        tracing::info!(
            requirements = requirements.len(),
            merged,
            accepted,
            "Validated requirements"
        );

        Ok(StagePayload::Validation(ValidationOutput {
            requirements,
            merged,
            category_counts,
            summary,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ExtractionOutput, RequirementCategory};
    use crate::stages::testing::{context, requirement, scoped};
    use proptest::prelude::*;

    fn prior(candidates: Vec<Requirement>) -> PriorOutputs {
        PriorOutputs::default().with(
            "extraction#1",
            StagePayload::Extraction(ExtractionOutput {
                candidates,
                discarded: 0,
                conversations: vec!["slack:C42".into()],
                used_heuristics: false,
            }),
        )
    }

    #[test]
    fn test_dedup_key_ignores_noise() {
        assert_eq!(
            dedup_key("Users must be able to reset their passwords."),
            dedup_key("we need: password reset for USERS")
        );
        assert_ne!(dedup_key("Export reports as PDF"), dedup_key("Import reports as PDF"));
        assert_eq!(dedup_key("x").len(), 16);
    }

    #[test]
    fn test_dedup_key_handles_other_scripts() {
        assert_ne!(dedup_key("用户必须能够重置密码"), dedup_key("系统需要支持导出报表"));
        assert_eq!(dedup_key("用户必须能够重置密码。"), dedup_key("用户必须能够重置密码"));
        assert_eq!(
            dedup_key("Пользователи должны сбрасывать пароль"),
            dedup_key("пользователи должны сбрасывать пароль!")
        );
        assert_ne!(
            dedup_key("Пользователи должны сбрасывать пароль"),
            dedup_key("Отчёты экспортируются в PDF")
        );
        assert_ne!(dedup_key("!!!"), dedup_key("???"));
    }

    #[test]
    fn test_distinct_non_latin_requirements_survive() {
        let (merged, folded) = deduplicate(vec![
            requirement("REQ-001", "用户必须能够重置密码", RequirementCategory::Functional, 0.8, 1),
            requirement("REQ-002", "系统需要支持导出报表", RequirementCategory::Functional, 0.8, 2),
        ]);
        assert_eq!(folded, 0);
        assert_eq!(merged.len(), 2);
        assert!(meaningful_words(&merged[0].text).len() >= Thresholds::default().min_meaningful_words);
    }

    #[test]
    fn test_merge_keeps_strongest_text_and_all_sources() {
        let (merged, folded) = deduplicate(vec![
            requirement("REQ-001", "Users need password reset", RequirementCategory::Functional, 0.6, 5),
            requirement("REQ-002", "Export to CSV", RequirementCategory::Functional, 0.8, 6),
            requirement("REQ-003", "Users must be able to reset passwords", RequirementCategory::Functional, 0.9, 1),
        ]);

        assert_eq!(folded, 1);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, "REQ-001");
        assert_eq!(merged[0].confidence, 0.9);
        assert_eq!(merged[0].text, "Users must be able to reset passwords");
        assert_eq!(merged[0].sources.len(), 2);
        assert_eq!(merged[0].sources[0].message_id, "m1");
    }

    #[tokio::test]
    async fn test_flags_weak_requirements() {
        let ctx = context(Stage::Validation);
        let payload = ValidationProcessor
            .process(
                &ctx,
                &prior(vec![
                    requirement("REQ-001", "Support single sign-on with Okta", RequirementCategory::Technical, 0.9, 1),
                    requirement("REQ-002", "Dashboard widgets for sales", RequirementCategory::Business, 0.4, 2),
                    requirement("REQ-003", "We need it", RequirementCategory::Functional, 0.8, 3),
                ]),
                &scoped(vec![], &[]),
            )
            .await
            .unwrap();
        let StagePayload::Validation(out) = payload else {
            panic!("wrong payload");
        };

        assert_eq!(out.accepted().count(), 1);
        let review: Vec<_> = out.needs_review().map(|r| r.id.as_str()).collect();
        assert_eq!(review, vec!["REQ-002", "REQ-003"]);
        assert!(out.requirements[1].review_reason.as_deref().unwrap().contains("threshold"));
        assert_eq!(out.category_counts.get("technical"), Some(&1));
        assert!(out.summary.starts_with("3 requirements (1 accepted, 2 need review)"));
    }

    #[tokio::test]
    async fn test_no_accepted_requirement_is_no_signal() {
        let ctx = context(Stage::Validation);
        let err = ValidationProcessor
            .process(
                &ctx,
                &prior(vec![requirement("REQ-001", "Maybe dark mode", RequirementCategory::Functional, 0.35, 1)]),
                &scoped(vec![], &[]),
            )
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.reason().starts_with(NO_SIGNAL));

        let err = ValidationProcessor
            .process(&ctx, &prior(vec![]), &scoped(vec![], &[]))
            .await
            .unwrap_err();
        assert!(err.reason().starts_with(NO_SIGNAL));
    }

    const WORDS: &[&str] = &["user", "users", "export", "report", "reports", "must", "the", "pdf", "login", "fast"];

    proptest! {
        #[test]
        fn prop_dedup_is_idempotent(texts in prop::collection::vec(prop::collection::vec(0..WORDS.len(), 1..5), 0..12)) {
            let candidates: Vec<Requirement> = texts
                .iter()
                .enumerate()
                .map(|(i, words)| {
                    let text = words.iter().map(|w| WORDS[*w]).collect::<Vec<_>>().join(" ");
                    requirement(&format!("REQ-{:03}", i + 1), &text, RequirementCategory::Functional, 0.5 + (i % 5) as f64 / 10.0, (i % 60) as u32)
                })
                .collect();

            let (once, _) = deduplicate(candidates);
            let (twice, folded) = deduplicate(once.clone());
            prop_assert_eq!(folded, 0);
            prop_assert_eq!(once, twice);
        }
    }
}
