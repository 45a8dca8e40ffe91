mod config;
mod error;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use runtime::{
    AnthropicBackend, Backend, BackendError, Completion, CompletionRequest, History,
    OpenAiBackend, Outcome, Registry, Session, SessionState,
};
use storage::{Event, EventKind, EventStore, Role};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, Provider};
use error::{Error, Result};

const CONFIG_FILE: &str = "bridge.toml";

#[derive(Parser)]
#[command(name = "bridge")]
#[command(about = "A tool-using reasoning loop over remote tool servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat
    Chat,
    /// Answer one utterance and exit
    Run {
        utterance: String,
        /// Maximum tool rounds
        #[arg(short, long)]
        budget: Option<u32>,
    },
    /// List tools discovered from the configured servers
    Tools,
    /// List recorded sessions
    Sessions {
        /// Show only the last N sessions
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Show event logs for a session
    Logs {
        /// Session ID (prefix match supported)
        #[arg(short, long)]
        session: String,
        /// Filter by event kind (message, tool_call, tool_result, session_start, session_end)
        #[arg(short, long)]
        kind: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::Chat) | None => cmd_chat(&Config::load_or_default(&cli.config)?).await,
        Some(Commands::Run { utterance, budget }) => {
            cmd_run(&Config::load_or_default(&cli.config)?, &utterance, budget).await
        }
        Some(Commands::Tools) => cmd_tools(&Config::load_or_default(&cli.config)?).await,
        Some(Commands::Sessions { limit }) => cmd_sessions(limit),
        Some(Commands::Logs { session, kind }) => cmd_logs(&session, kind.as_deref()),
    }
}

/// Either configured provider.
enum AnyBackend {
    OpenAi(OpenAiBackend),
    Anthropic(AnthropicBackend),
}

impl Backend for AnyBackend {
    async fn complete(
        &self,
        request: CompletionRequest<'_>,
    ) -> std::result::Result<Completion, BackendError> {
        match self {
            Self::OpenAi(backend) => backend.complete(request).await,
            Self::Anthropic(backend) => backend.complete(request).await,
        }
    }
}

impl std::fmt::Display for AnyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi(backend) => std::fmt::Display::fmt(backend, f),
            Self::Anthropic(backend) => std::fmt::Display::fmt(backend, f),
        }
    }
}

fn build_backend(config: &Config) -> Result<AnyBackend> {
    let settings = &config.backend;
    match settings.provider {
        Provider::OpenAi => {
            let mut builder = OpenAiBackend::builder(&settings.model);
            if let Some(url) = &settings.base_url {
                builder = builder.base_url(url);
            }
            if let Some(key) = config.api_key() {
                builder = builder.api_key(key);
            }
            if let Some(temperature) = settings.temperature {
                builder = builder.temperature(temperature);
            }
            if let Some(max_tokens) = settings.max_tokens {
                builder = builder.max_tokens(max_tokens);
            }
            Ok(AnyBackend::OpenAi(builder.build()))
        }
        Provider::Anthropic => {
            let key = config.api_key().ok_or(Error::MissingApiKey {
                provider: "anthropic",
                variable: Provider::Anthropic.key_variable(),
            })?;
            let mut builder = AnthropicBackend::builder(key, &settings.model);
            if let Some(url) = &settings.base_url {
                builder = builder.base_url(url);
            }
            if let Some(max_tokens) = settings.max_tokens {
                builder = builder.max_tokens(max_tokens);
            }
            Ok(AnyBackend::Anthropic(builder.build()))
        }
    }
}

/// Connect every configured server. Unreachable servers are skipped; a tool
/// name advertised twice is fatal.
async fn connect_servers(config: &Config) -> Result<Arc<Registry>> {
    let registry = Arc::new(Registry::new());
    for server in config.server_configs()? {
        match registry.connect(&server).await {
            Ok(tools) => info!(server = %server.name, tools = tools.len(), "connected"),
            Err(e @ runtime::Error::NameCollision { .. }) => return Err(e.into()),
            Err(e) => warn!(server = %server.name, error = %e, "server unavailable"),
        }
    }
    Ok(registry)
}

fn new_session(
    config: &Config,
    backend: AnyBackend,
    registry: Arc<Registry>,
    history: History,
    store: Option<EventStore>,
    budget: Option<u32>,
) -> Result<Session<AnyBackend>> {
    let mut session =
        Session::new(backend, registry, config.session_config(budget))?.with_history(history);
    if let Some(prompt) = &config.system_prompt {
        session = session.with_system(prompt);
    }
    if let Some(store) = store {
        session = session.with_store(store);
    }
    Ok(session)
}

/// Routes Ctrl+C to the running session, if any.
///
/// One watcher serves the whole process. While a session runs, Ctrl+C
/// cancels it; otherwise it exits.
#[derive(Clone, Default)]
struct Interrupt {
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl Interrupt {
    fn install() -> Self {
        let interrupt = Self::default();
        let watcher = interrupt.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !watcher.interrupt() {
                    println!();
                    std::process::exit(130);
                }
            }
        });
        interrupt
    }

    fn slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm(&self, token: CancellationToken) {
        *self.slot() = Some(token);
    }

    fn disarm(&self) {
        *self.slot() = None;
    }

    /// Cancel the running session. False when nothing was running.
    fn interrupt(&self) -> bool {
        match self.slot().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Run to completion; Ctrl+C cancels the session.
async fn run_session(
    session: &mut Session<AnyBackend>,
    input: &str,
    interrupt: &Interrupt,
) -> Result<Outcome> {
    interrupt.arm(session.cancel_token());
    let outcome = session.run(input).await;
    interrupt.disarm();
    Ok(outcome?)
}

async fn cmd_chat(config: &Config) -> Result<()> {
    println!("bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut backend = build_backend(config)?;
    println!("Backend: {backend}");

    let registry = connect_servers(config).await?;
    println!("Tools: {}", registry.descriptors().len());

    let db_path = data_dir()?.join("events.db");
    let mut store = Some(EventStore::open(&db_path)?);
    println!("Sessions stored at: {}", db_path.display());
    println!("Type 'tools' to list tools, 'quit' or Ctrl+D to exit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut history = History::new();
    let interrupt = Interrupt::install();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            // EOF
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }
        if input == "tools" {
            print_tools(&registry);
            continue;
        }

        let mut session = new_session(config, backend, registry.clone(), history, store, None)?;
        let outcome = run_session(&mut session, input, &interrupt).await;
        (backend, history, store) = session.into_parts();

        match outcome {
            Ok(outcome) => println!("\n{}\n", outcome.message.content),
            Err(e) => eprintln!("Error: {e}\n"),
        }
    }

    registry.shutdown().await;
    println!("\nGoodbye.");
    Ok(())
}

async fn cmd_run(config: &Config, utterance: &str, budget: Option<u32>) -> Result<()> {
    let backend = build_backend(config)?;
    let registry = connect_servers(config).await?;

    let data_dir = data_dir()?;
    let store = EventStore::open(data_dir.join("events.db"))?;

    let mut session = new_session(
        config,
        backend,
        registry.clone(),
        History::new(),
        Some(store),
        budget,
    )?;
    let outcome = run_session(&mut session, utterance, &Interrupt::install()).await;
    registry.shutdown().await;
    let outcome = outcome?;

    println!("{}", outcome.message.content);
    match outcome.state {
        SessionState::Failed(reason) => Err(Error::SessionFailed(reason)),
        _ => Ok(()),
    }
}

async fn cmd_tools(config: &Config) -> Result<()> {
    let registry = connect_servers(config).await?;
    print_tools(&registry);
    registry.shutdown().await;
    Ok(())
}

fn print_tools(registry: &Registry) {
    let tools = registry.descriptors();
    if tools.is_empty() {
        println!("No tools available.");
        return;
    }
    for tool in tools {
        println!("{:<24}  {:<32}  {}", tool.name, tool.server, tool.description);
    }
}

fn cmd_sessions(limit: usize) -> Result<()> {
    let store = open_store()?;
    let sessions = store.list_sessions()?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<8}  STATE",
        "SESSION ID", "STARTED", "MSGS"
    );
    println!("{}", "-".repeat(80));

    for summary in sessions.into_iter().take(limit) {
        let started = Local
            .from_utc_datetime(&summary.started_at.naive_utc())
            .format("%Y-%m-%d %H:%M");
        let state = summary.final_state.as_deref().unwrap_or("active");
        println!(
            "{:<36}  {:<20}  {:<8}  {state}",
            summary.id, started, summary.message_count
        );
    }

    Ok(())
}

fn cmd_logs(session_prefix: &str, kind_filter: Option<&str>) -> Result<()> {
    let store = open_store()?;

    // Find session by prefix
    let sessions = store.list_sessions()?;
    let matching: Vec<_> = sessions
        .iter()
        .filter(|s| s.id.to_string().starts_with(session_prefix))
        .collect();

    let session_id = match matching.len() {
        0 => {
            return Err(Error::SessionNotFound {
                prefix: session_prefix.to_string(),
            });
        }
        1 => matching[0].id,
        _ => {
            return Err(Error::AmbiguousSession {
                prefix: session_prefix.to_string(),
                matches: matching.iter().map(|s| s.id.to_string()).collect(),
            });
        }
    };

    let events = store.load_events(session_id, kind_filter)?;

    if events.is_empty() {
        println!("No events found for session {session_id}");
        return Ok(());
    }

    println!("Session: {session_id}\n");

    for event in events {
        print_event(&event);
    }

    Ok(())
}

fn print_event(event: &Event) {
    let time = Local
        .from_utc_datetime(&event.timestamp.naive_utc())
        .format("%H:%M:%S");

    match &event.kind {
        EventKind::SessionStart => {
            println!("[{time}] === Session started ===");
        }
        EventKind::SessionEnd { state } => {
            println!("[{time}] === Session ended: {state} ===");
        }
        EventKind::Message { role, content } => {
            let role_str = match role {
                Role::User => "USER",
                Role::Assistant => "ASSISTANT",
                Role::System => "SYSTEM",
                Role::Tool => "TOOL",
            };
            println!("[{time}] {role_str}: {}", truncate(content, 200));
        }
        EventKind::ToolCall {
            call_id,
            name,
            input,
            confidence,
        } => {
            println!("[{time}] TOOL CALL {call_id}: {name} {input} ({confidence})");
        }
        EventKind::ToolResult {
            call_id,
            name,
            output,
            error,
        } => match error {
            Some(error) => {
                println!("[{time}] TOOL ERROR {call_id}: {name} {}", truncate(error, 200));
            }
            None => {
                println!("[{time}] TOOL RESULT {call_id}: {name} {}", truncate(&output.to_string(), 200));
            }
        },
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

fn open_store() -> Result<EventStore> {
    let data_dir = dirs_data_dir().unwrap_or_else(|| ".bridge".into());
    let db_path = data_dir.join("events.db");

    if !db_path.exists() {
        return Err(Error::DatabaseNotFound { path: db_path });
    }

    Ok(EventStore::open(&db_path)?)
}

/// The data directory, created if missing.
fn data_dir() -> Result<PathBuf> {
    let dir = dirs_data_dir().unwrap_or_else(|| ".bridge".into());
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn dirs_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share/bridge"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .map(|p| p.join("bridge"))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|h| PathBuf::from(h).join("bridge"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}
