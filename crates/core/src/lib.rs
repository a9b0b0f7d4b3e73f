//! # SuperMon Core
//!
//! The engine behind SuperMon: turns stakeholder conversations into
//! validated requirements, a prioritized epic and story plan, a planning
//! meeting and followed-up action items.
//!
//! ## Architecture
//!
//! - `adapters/` - Capability adapters (messaging, calendar, issue tracker, docs, language model)
//! - `stages/` - One processor per pipeline stage
//! - `state/` - SQLite-backed pipeline store, plans and project settings
//! - `workflow/` - Orchestrator state machine, agent registry, follow-up scheduler
//!
//! ## Usage
//!
//! ```rust,ignore
//! use supermon_core::adapters::AdapterRegistry;
//! use supermon_core::config::WorkflowConfig;
//! use supermon_core::state::SupermonDb;
//! use supermon_core::workflow::Orchestrator;
//!
//! let db = SupermonDb::open()?;
//! let config = WorkflowConfig::default();
//! let adapters = AdapterRegistry::new(config.timeouts.adapter_call_timeout());
//! let orchestrator = Orchestrator::new(&db, adapters, config);
//! let report = orchestrator.run_workflow(42, "slack:C42").await?;
//! ```

pub mod adapters;
pub mod config;
pub mod error;
pub mod models;
pub mod stages;
pub mod state;
pub mod workflow;
