//! # Agent Registry
//!
//! Binds each stage to the processor that runs it and to the role whose
//! capabilities that processor may use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::pipeline::Stage;
use crate::adapters::Capability;
use crate::stages::{
    EpicGenerationProcessor, ExtractionProcessor, FollowupProcessor,
    MeetingCoordinationProcessor, PrioritizationProcessor, StageProcessor,
    StoryGenerationProcessor, ValidationProcessor,
};

/// Agent role; each stage runs under exactly one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Requirements,
    Testing,
    Planning,
    Development,
    Communication,
}

impl AgentRole {
    pub const ALL: [AgentRole; 5] = [
        AgentRole::Requirements,
        AgentRole::Testing,
        AgentRole::Planning,
        AgentRole::Development,
        AgentRole::Communication,
    ];

    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Extraction => Self::Requirements,
            Stage::Validation => Self::Testing,
            Stage::Prioritization | Stage::EpicGeneration => Self::Planning,
            Stage::StoryGeneration => Self::Development,
            Stage::MeetingCoordination | Stage::Followup => Self::Communication,
        }
    }

    /// Capabilities a processor running under this role may invoke.
    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            Self::Requirements => &[Capability::LanguageModel, Capability::Messaging],
            Self::Testing => &[Capability::LanguageModel],
            Self::Planning => &[
                Capability::LanguageModel,
                Capability::Documentation,
                Capability::IssueTracker,
            ],
            Self::Development => &[Capability::LanguageModel, Capability::IssueTracker],
            Self::Communication => &[Capability::Messaging, Capability::Calendar],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requirements => "requirements",
            Self::Testing => "testing",
            Self::Planning => "planning",
            Self::Development => "development",
            Self::Communication => "communication",
        }
    }
}

/// Introspection record for one role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub role: AgentRole,
    pub stages: Vec<Stage>,
    pub capabilities: Vec<Capability>,
}

/// Stage to processor bindings
pub struct AgentRegistry {
    processors: BTreeMap<Stage, Arc<dyn StageProcessor>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl AgentRegistry {
    pub fn empty() -> Self {
        Self {
            processors: BTreeMap::new(),
        }
    }

    /// One processor per stage, the built-in set.
    pub fn standard() -> Self {
        Self::empty()
            .with(Arc::new(ExtractionProcessor))
            .with(Arc::new(ValidationProcessor))
            .with(Arc::new(PrioritizationProcessor))
            .with(Arc::new(EpicGenerationProcessor))
            .with(Arc::new(StoryGenerationProcessor))
            .with(Arc::new(MeetingCoordinationProcessor))
            .with(Arc::new(FollowupProcessor))
    }

    /// Bind `processor` to its stage, replacing any previous binding.
    pub fn with(mut self, processor: Arc<dyn StageProcessor>) -> Self {
        self.processors.insert(processor.stage(), processor);
        self
    }

    pub fn processor(&self, stage: Stage) -> Option<Arc<dyn StageProcessor>> {
        self.processors.get(&stage).cloned()
    }

    pub fn role_for(&self, stage: Stage) -> AgentRole {
        AgentRole::for_stage(stage)
    }

    pub fn describe(&self) -> Vec<AgentDescriptor> {
        AgentRole::ALL
            .iter()
            .map(|role| AgentDescriptor {
                role: *role,
                stages: Stage::ALL
                    .iter()
                    .copied()
                    .filter(|s| AgentRole::for_stage(*s) == *role && self.processors.contains_key(s))
                    .collect(),
                capabilities: role.capabilities().to_vec(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_every_stage() {
        let registry = AgentRegistry::standard();
        for stage in Stage::ALL {
            let processor = registry.processor(stage).unwrap();
            assert_eq!(processor.stage(), stage);
        }
    }

    #[test]
    fn test_roles_limit_capabilities() {
        assert!(!AgentRole::for_stage(Stage::Validation)
            .capabilities()
            .contains(&Capability::Messaging));
        assert!(AgentRole::for_stage(Stage::Followup)
            .capabilities()
            .contains(&Capability::Messaging));
        assert!(AgentRole::for_stage(Stage::StoryGeneration)
            .capabilities()
            .contains(&Capability::IssueTracker));
    }

    #[test]
    fn test_describe() {
        let agents = AgentRegistry::standard().describe();
        assert_eq!(agents.len(), 5);
        let planning = agents.iter().find(|a| a.role == AgentRole::Planning).unwrap();
        assert_eq!(planning.stages, vec![Stage::Prioritization, Stage::EpicGeneration]);

        let partial = AgentRegistry::empty().with(Arc::new(ExtractionProcessor)).describe();
        assert!(partial.iter().filter(|a| a.role != AgentRole::Requirements).all(|a| a.stages.is_empty()));
    }
}
