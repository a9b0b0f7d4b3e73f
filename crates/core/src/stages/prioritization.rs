//! Ranks accepted requirements by confidence times business weight.

use async_trait::async_trait;
use std::cmp::Ordering;

use super::{PriorOutputs, RunContext, StageProcessor};
use crate::adapters::ScopedCapabilities;
use crate::error::StageError;
use crate::state::{PrioritizationOutput, PrioritizedRequirement, Priority, ProjectSettings, Requirement, StagePayload};
use crate::workflow::Stage;

/// Highest score first; ties go to the earliest source, then the id.
pub fn rank(requirements: Vec<Requirement>, settings: &ProjectSettings) -> Vec<PrioritizedRequirement> {
    let mut scored: Vec<PrioritizedRequirement> = requirements
        .into_iter()
        .map(|requirement| {
            let business_weight = settings.weight_for(requirement.category);
            let score = requirement.confidence * business_weight;
            PrioritizedRequirement {
                priority: Priority::from_score(score),
                requirement,
                business_weight,
                score,
                rank: 0,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.requirement.earliest_source().cmp(&b.requirement.earliest_source()))
            .then_with(|| a.requirement.id.cmp(&b.requirement.id))
    });

    for (i, item) in scored.iter_mut().enumerate() {
        item.rank = i as u32 + 1;
    }
    scored
}

pub struct PrioritizationProcessor;

#[async_trait]
impl StageProcessor for PrioritizationProcessor {
    fn stage(&self) -> Stage {
        Stage::Prioritization
    }

    fn inputs(&self) -> &'static [Stage] {
        &[Stage::Validation]
    }

    async fn process(
        &self,
        ctx: &RunContext,
        prior: &PriorOutputs,
        _caps: &ScopedCapabilities,
    ) -> Result<StagePayload, StageError> {
        let accepted: Vec<Requirement> = prior.validation()?.accepted().cloned().collect();
        let ranked = rank(accepted, &ctx.settings);

        tracing::info!(run_id = %ctx.run_id, ranked = ranked.len(), "Prioritized requirements");
        Ok(StagePayload::Prioritization(PrioritizationOutput { ranked }))
    }
}
