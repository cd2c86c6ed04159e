//! CLI entry point for `turnwise`.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use colored::Colorize;
use dotenvy::dotenv;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use turnwise::approval::{
    ApprovalBroker, ApprovalDecision, ApprovalGate, ApprovalMode, HumanApproval,
    describe_tool_call,
};
use turnwise::client::ChatClient;
use turnwise::compaction::ModelSummarizer;
use turnwise::config::Config;
use turnwise::core::{
    Engine, EngineConfig, Event, RunOutcome, SessionKey, SessionLease, SessionRegistry,
};
use turnwise::llm_client::{LlmClient, RequestOptions};
use turnwise::logging;
use turnwise::prompts::{BASE_PROMPT, build_system_prompt};
use turnwise::session_store::{DEFAULT_LIST_LIMIT, Session, SessionStore};
use turnwise::tools::{ToolContext, ToolRegistry};
use turnwise::utils::summarize_text;

/// Capacity of the engine event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(
    name = "turnwise",
    author,
    version,
    about = "Terminal coding assistant with resumable, branchable sessions"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Send a one-shot prompt (non-interactive)
    #[arg(short, long)]
    prompt: Option<String>,

    /// Approve every tool call without asking
    #[arg(long)]
    yolo: bool,

    /// Approve workspace edits without asking
    #[arg(long)]
    auto_edit: bool,

    /// Approval mode: default, autoEdit, or yolo
    #[arg(long, value_name = "MODE")]
    approval_mode: Option<String>,

    /// Workspace directory for file operations
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Resume a previous session by ID or prefix
    #[arg(short, long, conflicts_with = "continue_session")]
    resume: Option<String>,

    /// Continue the most recent session
    #[arg(short = 'c', long = "continue")]
    continue_session: bool,

    /// Maximum model turns per prompt
    #[arg(long)]
    max_turns: Option<u32>,

    /// Override the configured model
    #[arg(long)]
    model: Option<String>,

    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// List saved sessions for the workspace
    Sessions {
        /// Maximum number of sessions to display
        #[arg(short, long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Some(command) = cli.command.clone() {
        return match command {
            Commands::Completions { shell } => {
                generate_completions(shell);
                Ok(())
            }
            Commands::Sessions { limit } => {
                let config = load_config_from_cli(&cli)?;
                let workspace = resolve_workspace(cli.workspace.as_deref())?;
                list_sessions(&config, &workspace, limit)
            }
        };
    }

    let config = load_config_from_cli(&cli)?;
    let workspace = resolve_workspace(cli.workspace.as_deref())?;
    let mut session = open_session(&cli, &config, &workspace)?;

    let (tx_event, rx_event) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let broker = Arc::new(ApprovalBroker::new(tx_event.clone()));
    let engine = build_engine(&cli, &config, &workspace, Arc::clone(&broker), tx_event)?;

    let run_finished = Arc::new(Notify::new());
    tokio::spawn(print_events(
        rx_event,
        Arc::clone(&broker),
        Arc::clone(&run_finished),
    ));

    let registry = SessionRegistry::new();
    let mut lease = registry.open(SessionKey::new(&workspace, session.id()))?;

    if let Some(prompt) = cli.prompt.as_deref() {
        let outcome = run_prompt(&engine, &mut session, &mut lease, &run_finished, prompt).await;
        if let Err(failure) = outcome {
            bail!("{failure}");
        }
        return Ok(());
    }

    run_repl(&engine, &mut session, &mut lease, &run_finished).await
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

/// Load the config file and layer CLI flags over it.
fn load_config_from_cli(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.clone())?;
    if let Some(model) = &cli.model {
        config.model = Some(model.clone());
    }
    if let Some(mode) = &cli.approval_mode {
        config.approval_mode = Some(mode.clone());
    }
    if cli.yolo {
        config.approval_mode = Some(ApprovalMode::Yolo.to_string());
    }
    if cli.auto_edit {
        config.auto_edit = Some(true);
    }
    if let Some(max_turns) = cli.max_turns {
        config.max_turns = Some(max_turns);
    }
    config.validate()?;
    Ok(config)
}

fn resolve_workspace(workspace: Option<&Path>) -> Result<PathBuf> {
    let raw = match workspace {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir().context("Failed to read the current directory")?,
    };
    raw.canonicalize()
        .with_context(|| format!("Workspace {} does not exist", raw.display()))
}

fn session_store(config: &Config, workspace: &Path) -> Option<SessionStore> {
    config
        .sessions_root()
        .map(|root| SessionStore::new(&root, workspace))
}

fn open_session(cli: &Cli, config: &Config, workspace: &Path) -> Result<Session> {
    let Some(store) = session_store(config, workspace) else {
        logging::warn("No home directory; this session will not be saved");
        return Ok(Session::ephemeral());
    };
    if let Some(id) = cli.resume.as_deref() {
        return store.resume(id);
    }
    if cli.continue_session {
        if let Some(session) = store.latest()? {
            return Ok(session);
        }
        logging::info("No previous session for this workspace; starting a new one");
    }
    store.create()
}

fn build_engine(
    cli: &Cli,
    config: &Config,
    workspace: &Path,
    broker: Arc<ApprovalBroker>,
    tx_event: mpsc::Sender<Event>,
) -> Result<Engine> {
    let client: Arc<dyn LlmClient> = Arc::new(ChatClient::new(config)?);
    let tools = ToolRegistry::with_defaults(ToolContext::new(workspace));
    let system_prompt = build_system_prompt(BASE_PROMPT, &tools, workspace);
    let human: Arc<dyn HumanApproval> = broker;
    let gate = ApprovalGate::new(config.approval_mode(), config.auto_edit(), human);
    let summarizer = Arc::new(ModelSummarizer::new(Arc::clone(&client)));

    let limits = config.model_limits();
    let engine_config = EngineConfig {
        limits,
        max_turns: config.max_turns(),
        system_prompt,
        request: RequestOptions {
            max_output_tokens: limits.output,
            temperature: None,
        },
        compaction: config.compaction_enabled(),
        audit_log: config.audit_log_path(),
    };
    if cli.verbose {
        logging::info(format!(
            "Model {} (context {}, output {}), tools: {}",
            client.model_id(),
            limits.context,
            limits.output,
            tools.names().join(", ")
        ));
    }

    Ok(Engine::new(client, tools, gate, summarizer, engine_config).with_events(tx_event))
}

/// Run one prompt, cancelling on Ctrl-C, and wait for its output to flush.
async fn run_prompt(
    engine: &Engine,
    session: &mut Session,
    lease: &mut SessionLease,
    run_finished: &Notify,
    prompt: &str,
) -> RunOutcome {
    let cancel = lease.cancel_token().clone();
    let run = engine.run(session, prompt, &cancel);
    tokio::pin!(run);

    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("{}", "Canceling...".dimmed());
                cancel.cancel();
            }
        }
    };
    run_finished.notified().await;

    if cancel.is_cancelled() {
        lease.renew();
    }
    outcome
}

async fn run_repl(
    engine: &Engine,
    session: &mut Session,
    lease: &mut SessionLease,
    run_finished: &Notify,
) -> Result<()> {
    let mut editor = DefaultEditor::new().context("Failed to start the line editor")?;
    for prompt in &session.policy().prompt_history {
        let _ = editor.add_history_entry(prompt.as_str());
    }

    println!(
        "{} session {} ({} messages). {} for commands.",
        "turnwise".bold(),
        session.id().cyan(),
        session.history().len(),
        "/help".cyan()
    );

    loop {
        let line = match editor.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err).context("Failed to read input"),
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        if let Some(command) = input.strip_prefix('/') {
            match handle_slash_command(command, session) {
                SlashOutcome::Continue => continue,
                SlashOutcome::Exit => break,
            }
        }

        if let Err(failure) = run_prompt(engine, session, lease, run_finished, input).await {
            eprintln!("{}", format!("Run ended: {failure}").red());
        }
    }

    println!("Resume with: {} {}", "turnwise --resume".cyan(), session.id());
    Ok(())
}

enum SlashOutcome {
    Continue,
    Exit,
}

fn handle_slash_command(command: &str, session: &mut Session) -> SlashOutcome {
    let mut parts = command.split_whitespace();
    match parts.next().unwrap_or_default() {
        "exit" | "quit" => return SlashOutcome::Exit,
        "session" => println!("Session {}", session.id()),
        "mode" => match parts.next() {
            None => println!("Approval mode: {}", session.policy().approval_mode),
            Some(raw) => match raw.parse::<ApprovalMode>() {
                Ok(mode) => {
                    if let Err(err) = session.update_policy(|policy| policy.approval_mode = mode) {
                        logging::warn(format!("Failed to save approval mode: {err:#}"));
                    }
                    println!("Approval mode: {mode}");
                }
                Err(err) => eprintln!("{}", err.to_string().red()),
            },
        },
        _ => {
            println!("Commands:");
            println!("  /mode [default|autoEdit|yolo]  show or set this session's approval mode");
            println!("  /session                       show the session id");
            println!("  /exit                          leave (the session is saved)");
        }
    }
    SlashOutcome::Continue
}

fn list_sessions(config: &Config, workspace: &Path, limit: usize) -> Result<()> {
    let Some(store) = session_store(config, workspace) else {
        bail!("No sessions directory: set sessions_dir or HOME");
    };
    let sessions = store.list_sessions(limit)?;

    if sessions.is_empty() {
        println!("{}", "No sessions found.".dimmed());
        println!("Start a new session with: {}", "turnwise".cyan());
        return Ok(());
    }

    println!("{}", "Saved Sessions".bold());
    println!("{}", "==============".dimmed());
    for session in &sessions {
        println!(
            "  {}  {}  {:>4} msgs  {}",
            session.id.cyan(),
            session.modified.format("%Y-%m-%d %H:%M"),
            session.message_count,
            session.summary
        );
    }
    println!();
    println!(
        "Resume with: {} {}",
        "turnwise --resume".cyan(),
        "<session-id>".dimmed()
    );
    println!("Continue latest: {}", "turnwise --continue".cyan());
    Ok(())
}

// === Terminal Output ===

async fn print_events(
    mut rx_event: mpsc::Receiver<Event>,
    broker: Arc<ApprovalBroker>,
    run_finished: Arc<Notify>,
) {
    let mut stdout = io::stdout();
    let mut ends_with_newline = true;

    while let Some(event) = rx_event.recv().await {
        match event {
            Event::TextDelta { content } => {
                print!("{content}");
                let _ = stdout.flush();
                ends_with_newline = content.ends_with('\n');
                continue;
            }
            Event::ReasoningDelta { content } => {
                eprint!("{}", content.dimmed());
                continue;
            }
            _ => {}
        }

        if !ends_with_newline {
            println!();
            ends_with_newline = true;
        }
        match event {
            Event::ToolCallStarted { name, input, .. } => {
                eprintln!("{} {name} {}", "tool:".cyan(), summarize_args(&input).dimmed());
            }
            Event::ToolCallComplete {
                name,
                output,
                success,
                ..
            } => {
                let summary = summarize_text(output.trim(), 160);
                if success {
                    eprintln!("{} {name}: {}", "done:".green(), summary.dimmed());
                } else {
                    eprintln!("{} {name}: {summary}", "failed:".red());
                }
            }
            Event::ApprovalRequired {
                id,
                tool_name,
                category,
                input,
            } => {
                let description = describe_tool_call(&tool_name, category, &input);
                let decision = ask_for_decision(description).await;
                if !broker.resolve(&id, decision) {
                    logging::warn(format!("Approval {id} was no longer pending"));
                }
            }
            Event::CompactionStarted { message }
            | Event::CompactionCompleted { message }
            | Event::Status { message } => eprintln!("{}", message.dimmed()),
            Event::CompactionFailed { message } => eprintln!("{}", message.yellow()),
            Event::Error { message, .. } => eprintln!("{} {message}", "error:".red()),
            Event::RunFinished { usage, turns, .. } => {
                eprintln!(
                    "{}",
                    format!(
                        "{turns} turn(s), {} prompt + {} completion tokens",
                        usage.prompt_tokens, usage.completion_tokens
                    )
                    .dimmed()
                );
                run_finished.notify_one();
            }
            _ => {}
        }
    }
}

fn summarize_args(input: &Value) -> String {
    summarize_text(&input.to_string(), 120)
}

async fn ask_for_decision(description: String) -> ApprovalDecision {
    let answer = tokio::task::spawn_blocking(move || {
        eprintln!("{} {description}", "approve?".yellow().bold());
        eprint!("  [y]es once, [e]dits for session, [t]his tool for session, [N]o: ");
        let _ = io::stderr().flush();
        let mut line = String::new();
        io::stdin().read_line(&mut line).map(|_| line)
    })
    .await;

    match answer {
        Ok(Ok(line)) => parse_decision(&line),
        _ => ApprovalDecision::Deny,
    }
}

fn parse_decision(answer: &str) -> ApprovalDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalDecision::ApproveOnce,
        "e" | "edits" => ApprovalDecision::ApproveSessionEdits,
        "t" | "tool" | "always" => ApprovalDecision::ApproveSessionTool,
        _ => ApprovalDecision::Deny,
    }
}
