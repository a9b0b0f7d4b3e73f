//! SuperMon Server
//!
//! Axum API and command-line interface over the SuperMon workflow engine.
//! Runs triggered over HTTP are driven in the background; CLI commands
//! drive them in the foreground.

mod api;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use supermon_core::adapters::{
    register_mcp_adapters, AdapterRegistry, InMemoryCalendar, InMemoryDocumentation, InMemoryIssueTracker,
    InMemoryMessaging, LanguageModelAdapter,
};
use supermon_core::config::{WorkflowConfig, DEFAULT_CONFIG_PATH};
use supermon_core::models::ModelConfig;
use supermon_core::state::db::DEFAULT_DB_PATH;
use supermon_core::state::{
    Conversation, ConversationMessage, PlanManager, ProjectId, SettingsManager, SupermonDb,
};
use supermon_core::workflow::{FollowupScheduler, Orchestrator, WorkflowEvent};

/// Application state
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub plans: PlanManager,
    pub settings: SettingsManager,
    /// Configuration as saved on disk; the engine keeps the one it started with
    pub config: RwLock<WorkflowConfig>,
    pub config_path: PathBuf,
    pub event_tx: broadcast::Sender<WorkflowEvent>,
}

pub type SharedState = Arc<AppState>;

#[derive(Parser, Clone)]
#[command(author, version, about = "SuperMon - SDLC workflow orchestration")]
struct Args {
    /// SQLite database path
    #[arg(long, global = true, default_value = DEFAULT_DB_PATH)]
    db: PathBuf,
    /// Workflow configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Start the HTTP server and the follow-up scheduler (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Trigger a run for a project and drive it to a resting state
    Trigger {
        project_id: ProjectId,
        /// Conversation on the messaging platform, e.g. `slack:C042`
        conversation_ref: String,
    },
    /// Show the status report of a run
    Status { run_id: String },
    /// Resume a stalled run and drive it
    Resume {
        run_id: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Cancel a run
    Cancel {
        run_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Follow up once on open action items of completed runs
    Sweep,
    /// Run the whole pipeline and print the resulting plan
    Run {
        project_id: ProjectId,
        conversation_ref: String,
        /// In-memory adapters and database; needs --transcript
        #[arg(long)]
        offline: bool,
        /// Conversation JSON, or plain text with one `sender: message` per line
        #[arg(long, requires = "offline")]
        transcript: Option<PathBuf>,
    },
}

/// Orchestrator and scheduler over one database
struct Engine {
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<FollowupScheduler>,
    plans: PlanManager,
    settings: SettingsManager,
    events: mpsc::Receiver<WorkflowEvent>,
}

impl Engine {
    fn new(db: &SupermonDb, adapters: AdapterRegistry, config: &WorkflowConfig) -> Self {
        let (tx, events) = mpsc::channel(256);
        let orchestrator = Orchestrator::new(db, adapters, config.clone()).with_event_channel(tx.clone());
        let scheduler =
            FollowupScheduler::new(db, orchestrator.shared_adapters(), config.clone()).with_event_channel(tx);
        Self {
            orchestrator: Arc::new(orchestrator),
            scheduler: Arc::new(scheduler),
            plans: PlanManager::new(db),
            settings: SettingsManager::new(db),
            events,
        }
    }
}

/// MCP servers from the environment, plus the language model when its API
/// key is set.
fn live_adapters(config: &WorkflowConfig) -> anyhow::Result<AdapterRegistry> {
    let mut adapters = AdapterRegistry::new(config.timeouts.adapter_call_timeout());
    register_mcp_adapters(&mut adapters).context("Failed to register MCP adapters")?;

    let model = ModelConfig::from_env();
    match LanguageModelAdapter::from_env(model.clone(), config.timeouts.adapter_call_timeout()) {
        Some(Ok(adapter)) => {
            tracing::info!(provider = model.provider.display_name(), model = %model.model, "Language model enabled");
            adapters.register(Arc::new(adapter));
        }
        Some(Err(e)) => tracing::warn!(error = %e, "Language model unavailable, using heuristic extraction"),
        None => tracing::info!(
            key = model.provider.api_key_env(),
            "No language model key set, using heuristic extraction"
        ),
    }
    Ok(adapters)
}

fn offline_adapters(config: &WorkflowConfig, conversation: Conversation) -> AdapterRegistry {
    AdapterRegistry::new(config.timeouts.adapter_call_timeout())
        .with(Arc::new(InMemoryMessaging::new().with_conversation(conversation)))
        .with(Arc::new(InMemoryCalendar::new()))
        .with(Arc::new(InMemoryIssueTracker::new()))
        .with(Arc::new(InMemoryDocumentation::new()))
}

/// Read a transcript as a conversation registered under `reference`.
fn load_transcript(path: &Path, reference: &str) -> anyhow::Result<Conversation> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read transcript {}", path.display()))?;

    if let Ok(mut conversation) = serde_json::from_str::<Conversation>(&content) {
        conversation.reference = reference.to_string();
        return Ok(conversation);
    }

    let start = Utc::now();
    let messages: Vec<ConversationMessage> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .enumerate()
        .map(|(i, line)| {
            let (sender, text) = match line.split_once(": ") {
                Some((sender, text)) if !sender.contains(' ') => (sender, text),
                _ => ("unknown", line),
            };
            ConversationMessage {
                id: format!("m{}", i + 1),
                sender: sender.to_string(),
                content: text.to_string(),
                timestamp: start + chrono::Duration::seconds(i as i64),
            }
        })
        .collect();
    let participants: BTreeSet<String> = messages.iter().map(|m| m.sender.clone()).collect();

    Ok(Conversation {
        reference: reference.to_string(),
        channel: None,
        participants: participants.into_iter().collect(),
        messages,
    })
}

/// Drive a run on a background task.
pub fn spawn_drive(orchestrator: &Arc<Orchestrator>, run_id: String) {
    let orchestrator = Arc::clone(orchestrator);
    tokio::spawn(async move {
        match orchestrator.drive(&run_id).await {
            Ok(report) => tracing::info!(
                run_id = %run_id,
                status = %report.status,
                stage = %report.current_stage,
                "Run came to rest"
            ),
            Err(e) => tracing::error!(run_id = %run_id, error = %e, "Driving run failed"),
        }
    });
}

/// Log events for commands without subscribers.
fn drain_events(mut events: mpsc::Receiver<WorkflowEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!(kind = ?event.kind, run_id = ?event.run_id, stage = ?event.stage, "Workflow event");
        }
    });
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// === Server Entry ===

async fn run_server(engine: Engine, config: WorkflowConfig, config_path: PathBuf, host: &str, port: u16) -> anyhow::Result<()> {
    let (event_tx, _) = broadcast::channel::<WorkflowEvent>(256);

    let Engine {
        orchestrator,
        scheduler,
        plans,
        settings,
        mut events,
    } = engine;

    // Forward engine events to SSE subscribers
    let forward_tx = event_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let _ = forward_tx.send(event);
        }
    });

    let recoverable = orchestrator.recoverable_runs()?;
    if !recoverable.is_empty() {
        tracing::info!(count = recoverable.len(), "Resuming runs left in flight");
    }
    for run_id in recoverable {
        spawn_drive(&orchestrator, run_id);
    }

    let sweeper = scheduler.spawn();

    let state: SharedState = Arc::new(AppState {
        orchestrator,
        plans,
        settings,
        config: RwLock::new(config),
        config_path,
        event_tx,
    });

    let app = api::router().with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    println!("🚀 SuperMon Server running at http://{}", addr);
    println!("   Workflows: /api/v1/workflows, /:run_id, /events");
    println!("   Projects:  /api/v1/projects/:id/runs, /plan, /settings");
    println!("   Items:     /api/v1/action-items");
    println!("   System:    /api/v1/agents, /adapters, /config, /openapi.json, /health");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    sweeper.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_path(".supermon/.env");
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "supermon_server=info,supermon_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = WorkflowConfig::load(&args.config)?;
    config.apply_env();

    let command = args.command.clone().unwrap_or(CliCommand::Serve {
        port: 8080,
        host: "127.0.0.1".to_string(),
    });

    if let CliCommand::Run {
        project_id,
        conversation_ref,
        offline: true,
        transcript,
    } = &command
    {
        let Some(path) = transcript else {
            bail!("run --offline needs --transcript <file>");
        };
        let conversation = load_transcript(path, conversation_ref)?;
        let db = SupermonDb::open_in_memory()?;
        let engine = Engine::new(&db, offline_adapters(&config, conversation), &config);
        drain_events(engine.events);

        let report = engine.orchestrator.run_workflow(*project_id, conversation_ref).await?;
        print_json(&report)?;
        if let Some(plan) = engine.plans.plan_for_project(*project_id)? {
            print_json(&plan)?;
        }
        return Ok(());
    }

    let db = SupermonDb::open_at(&args.db)?;
    let engine = Engine::new(&db, live_adapters(&config)?, &config);

    match command {
        CliCommand::Serve { port, host } => {
            println!("╔══════════════════════════════════════╗");
            println!("║          SUPERMON SERVER             ║");
            println!("╚══════════════════════════════════════╝");
            run_server(engine, config, args.config, &host, port).await
        }
        CliCommand::Trigger {
            project_id,
            conversation_ref,
        }
        | CliCommand::Run {
            project_id,
            conversation_ref,
            ..
        } => {
            let show_plan = matches!(args.command, Some(CliCommand::Run { .. }));
            drain_events(engine.events);
            let trigger = engine
                .orchestrator
                .trigger_workflow(project_id, &conversation_ref)
                .await?;
            if trigger.coalesced {
                println!("Joined active run {}", trigger.run_id);
            }
            let report = engine.orchestrator.drive(&trigger.run_id).await?;
            print_json(&report)?;
            if show_plan {
                if let Some(plan) = engine.plans.plan_for_project(project_id)? {
                    print_json(&plan)?;
                }
            }
            Ok(())
        }
        CliCommand::Status { run_id } => print_json(&engine.orchestrator.get_run_status(&run_id)?),
        CliCommand::Resume { run_id, note } => {
            drain_events(engine.events);
            engine.orchestrator.resume(&run_id, note.as_deref()).await?;
            print_json(&engine.orchestrator.drive(&run_id).await?)
        }
        CliCommand::Cancel { run_id, reason } => {
            drain_events(engine.events);
            print_json(&engine.orchestrator.request_cancel(&run_id, reason.as_deref()).await?)
        }
        CliCommand::Sweep => {
            drain_events(engine.events);
            print_json(&engine.scheduler.sweep(Utc::now()).await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("standup.txt");
        std::fs::write(
            &path,
            "alice: Users must be able to reset their password.\n\nbob: ok\njust a note without sender\n",
        )
        .unwrap();

        let conversation = load_transcript(&path, "slack:C42").unwrap();
        assert_eq!(conversation.reference, "slack:C42");
        assert_eq!(conversation.messages.len(), 3);
        assert_eq!(conversation.messages[0].sender, "alice");
        assert_eq!(conversation.messages[0].content, "Users must be able to reset their password.");
        assert_eq!(conversation.messages[2].sender, "unknown");
        assert_eq!(conversation.participants, vec!["alice", "bob", "unknown"]);
    }

    #[test]
    fn test_json_transcript_takes_requested_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.json");
        std::fs::write(
            &path,
            r#"{"reference": "other", "messages": [{"id": "x1", "content": "We need SSO", "timestamp": "2026-03-02T10:00:00Z"}]}"#,
        )
        .unwrap();

        let conversation = load_transcript(&path, "slack:C7").unwrap();
        assert_eq!(conversation.reference, "slack:C7");
        assert_eq!(conversation.messages[0].id, "x1");
    }
}
