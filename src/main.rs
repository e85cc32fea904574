use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use research_pilot::agent::{RoleRegistry, RoleTable, ScriptedGenerator};
use research_pilot::cli::{Cli, Commands, Display};
use research_pilot::config::PilotConfig;
use research_pilot::coordinator::Coordinator;
use research_pilot::delivery::{StateNotice, StreamMessage, Subscriber};
use research_pilot::dispatch::IdempotencyKey;
use research_pilot::error::{Result, WorkflowError};
use research_pilot::phase::Phase;
use research_pilot::session::{SessionId, SessionSnapshot};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("research_pilot=debug")
    } else {
        EnvFilter::new("research_pilot=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = PilotConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Demo { question } => cmd_demo(config, question).await,
        Commands::Roles { path } => cmd_roles(config, path).await,
    }
}

async fn load_roles(config: &PilotConfig) -> Result<RoleTable> {
    match &config.roles_path {
        Some(path) => RoleTable::from_path(path).await,
        None => Ok(RoleTable::builtin()),
    }
}

async fn cmd_demo(config: PilotConfig, question: String) -> Result<()> {
    let display = Display::new();
    let roles = load_roles(&config).await?;
    let coordinator = Coordinator::new(
        &config,
        Arc::new(roles),
        Arc::new(ScriptedGenerator::research_demo()),
    )?;

    display.print_header("Scripted research session");

    let session_id = SessionId::generate();
    let created = coordinator.create_session(session_id.clone())?;
    display.print_info(&format!("Session {}", session_id));

    // One subscriber per channel: chunks print live from a background task
    // while the main flow blocks on state commits.
    let mut state = coordinator.subscribe(&session_id)?;
    let mut stream = coordinator.subscribe(&session_id)?;
    let chunk_printer = tokio::spawn(async move {
        let display = Display::new();
        while let Some(message) = stream.next_stream().await {
            match message {
                StreamMessage::Chunk { text, .. } => display.print_chunk(&text),
                StreamMessage::Done { chunks, .. } => display.finish_chunks(chunks),
            }
        }
    });

    // Initiation: draft the question, have the agent refine it, lock it.
    let s = coordinator.update_question(&session_id, created.version, question.as_str())?;
    display.print_info(&format!("Draft question: {}", question));

    coordinator.submit_agent_task(
        &session_id,
        "question_refinement",
        serde_json::json!({ "draft": question.as_str() }),
        Some(IdempotencyKey::new("demo-refine")),
    )?;
    let s = next_commit(&display, &mut state, s.version).await?;
    display.print_info(&format!("Refined question: {}", s.question.text));

    let s = coordinator.lock_question(&session_id, s.version)?;
    display.print_success("Question locked");

    coordinator.submit_agent_task(
        &session_id,
        "keyword_extraction",
        serde_json::json!({ "question": s.question.text.as_str() }),
        Some(IdempotencyKey::new("demo-keywords")),
    )?;
    let s = next_commit(&display, &mut state, s.version).await?;

    let s = coordinator.request_transition(&session_id, Phase::Exploration, s.version)?;
    display.print_success("Entered Exploration");

    // Exploration: scope the topic, then score feasibility.
    coordinator.submit_agent_task(
        &session_id,
        "scope_summary",
        serde_json::json!({ "question": s.question.text.as_str() }),
        Some(IdempotencyKey::new("demo-scope")),
    )?;
    let s = next_commit(&display, &mut state, s.version).await?;

    coordinator.submit_agent_task(
        &session_id,
        "feasibility_scoring",
        serde_json::json!({ "question": s.question.text.as_str() }),
        Some(IdempotencyKey::new("demo-feasibility")),
    )?;
    let s = next_commit(&display, &mut state, s.version).await?;

    let s = coordinator.request_transition(&session_id, Phase::Formulation, s.version)?;
    display.print_success("Entered Formulation");

    let s = coordinator.add_reflection(
        &session_id,
        s.version,
        "Narrowed to post-restoration water quality monitoring",
    )?;
    let s = coordinator.request_transition(&session_id, Phase::Collection, s.version)?;
    display.print_success("Entered Collection");

    let s = coordinator.add_reflection(
        &session_id,
        s.version,
        "Collected agency monitoring reports and two review articles",
    )?;
    let s = coordinator.request_transition(&session_id, Phase::Presentation, s.version)?;
    display.print_success("Entered Presentation");

    let s = coordinator.request_transition(&session_id, Phase::Closed, s.version)?;
    display.print_success("Session closed");

    // Closing retires the delivery hub: both feeds drain and end.
    while let Some(notice) = state.next_state().await {
        display.print_notice(&notice);
    }
    let _ = chunk_printer.await;

    display.print_session(&s);
    Ok(())
}

/// Drain state notices, printing each, until a commit past `since` lands.
/// The scripted generator always produces one, so a failed or stale task
/// surfaces as an error instead of a hang.
async fn next_commit(
    display: &Display,
    subscriber: &mut Subscriber,
    since: u64,
) -> Result<SessionSnapshot> {
    while let Some(notice) = subscriber.next_state().await {
        display.print_notice(&notice);
        match notice {
            StateNotice::Snapshot { snapshot, .. } if snapshot.version > since => {
                return Ok(*snapshot);
            }
            StateNotice::TaskFailed {
                task_type, error, ..
            } => {
                return Err(WorkflowError::TaskFailed(format!(
                    "{}: {}",
                    task_type, error
                )));
            }
            StateNotice::TaskStale {
                task_type, reason, ..
            } => {
                return Err(WorkflowError::StaleResult(format!(
                    "{}: {}",
                    task_type, reason
                )));
            }
            _ => {}
        }
    }
    Err(WorkflowError::SubscriberGone(
        subscriber.session_id().to_string(),
    ))
}

async fn cmd_roles(config: PilotConfig, path: Option<PathBuf>) -> Result<()> {
    let display = Display::new();

    let (table, source) = match path.or(config.roles_path) {
        Some(path) => {
            let table = RoleTable::from_path(&path).await?;
            (table, path.display().to_string())
        }
        None => (RoleTable::builtin(), "builtin".to_string()),
    };

    if table.is_empty() {
        display.print_warning("Role table declares no task types; nothing can be dispatched");
        return Ok(());
    }

    display.print_header(&format!("Roles ({})", source));
    display.print_roles(&table);
    println!();
    display.print_success(&format!("{} task types declared", table.task_types().len()));

    Ok(())
}
