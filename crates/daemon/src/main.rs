//! webterm Daemon
//!
//! Session broker serving persistent shells and one-shot queries.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::server::api::HealthResponse;
use daemon::Server;
use protocol::{
    CreateSessionRequest, EventStreamDecoder, QueryEvent, QueryRequest, RenameSessionRequest,
    SessionSummary,
};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

/// webterm Daemon - persistent shell sessions over HTTP and WebSocket.
#[derive(Parser, Debug)]
#[command(name = "webterm-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Base URL of a running daemon (defaults to the configured address)
    #[arg(long, global = true, value_name = "URL")]
    pub url: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the webterm server
    Start {
        /// Address to bind (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides the config file)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Show status of a running daemon
    Status,

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Manage sessions on a running daemon
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Run a one-shot query and stream the answer
    Ask {
        /// Prompt text
        message: String,

        /// Resume token printed by a previous query
        #[arg(long, short)]
        resume: Option<String>,
    },
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all active sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Create a new session
    Create {
        /// Working directory, relative to the workspace root
        #[arg(long)]
        cwd: Option<String>,

        /// Session title
        #[arg(long)]
        title: Option<String>,
    },

    /// Rename a session
    Rename {
        /// Session ID
        session_id: String,

        /// New title
        title: String,
    },

    /// Kill an active session
    Kill {
        /// Session ID to kill
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let _log_guard = init_tracing(&config, cli.verbose)?;
    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Start { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.validate()?;
            run_server(config).await?;
        }
        Commands::Status => {
            let client = ApiClient::new(cli.url.as_deref(), &config)?;
            match client.health().await {
                Ok(health) => {
                    println!("Daemon Status: running");
                    println!("  Address:  {}", client.base);
                    println!("  Sessions: {}", health.sessions);
                }
                Err(e) => {
                    eprintln!("Daemon is not running: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Sessions(cmd) => {
            let client = ApiClient::new(cli.url.as_deref(), &config)?;
            match cmd {
                SessionsCommands::List { json } => {
                    let sessions = client
                        .list_sessions()
                        .await
                        .context("Failed to list sessions")?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions, Utc::now());
                    }
                }
                SessionsCommands::Create { cwd, title } => {
                    let session = client
                        .create_session(&CreateSessionRequest { cwd, title })
                        .await
                        .context("Failed to create session")?;
                    println!("Created session {} ({})", session.id, session.title);
                    println!("  cwd: {}", session.cwd);
                }
                SessionsCommands::Rename { session_id, title } => {
                    let session = client
                        .rename_session(&session_id, title)
                        .await
                        .with_context(|| format!("Failed to rename session {}", session_id))?;
                    println!("Session {} renamed to {}", session.id, session.title);
                }
                SessionsCommands::Kill { session_id } => {
                    client
                        .kill_session(&session_id)
                        .await
                        .with_context(|| format!("Failed to kill session {}", session_id))?;
                    println!("Session {} terminated", session_id);
                }
            }
        }
        Commands::Ask { message, resume } => {
            let client = ApiClient::new(cli.url.as_deref(), &config)?;
            let token = client.ask(message, resume).await?;
            if let Some(token) = token {
                eprintln!("\n[resume: {}]", token);
            }
        }
    }

    Ok(())
}

/// Installs the fmt subscriber. Logs go to `daemon.log_file` when set.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    match &config.daemon.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .context("log_file must name a file")?;
            std::fs::create_dir_all(dir)?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

/// Run the server until SIGTERM or SIGINT.
async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        workspace = %config.session.workspace_root.display(),
        shell = %config.session.shell,
        "webterm daemon starting"
    );

    let shutdown = CancellationToken::new();
    let server = Server::new(config);
    let mut server_task = tokio::spawn(server.run(shutdown.clone()));

    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            tracing::info!("Received shutdown signal");
            shutdown.cancel();
        }
        // The server stopped on its own, e.g. the bind failed.
        joined = &mut server_task => {
            joined??;
            return Ok(());
        }
    }

    match tokio::time::timeout(Duration::from_secs(10), server_task).await {
        Ok(joined) => joined??,
        Err(_) => tracing::warn!("Timed out waiting for server shutdown"),
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// HTTP client for a running daemon.
struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    fn new(url: Option<&str>, config: &Config) -> anyhow::Result<Self> {
        let base = match url {
            Some(url) => Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?,
            None => default_base_url(config)?,
        };
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        Ok(self.base.join(path)?)
    }

    async fn health(&self) -> anyhow::Result<HealthResponse> {
        let response = self.http.get(self.endpoint("api/health")?).send().await?;
        decode(response).await
    }

    async fn list_sessions(&self) -> anyhow::Result<Vec<SessionSummary>> {
        let response = self.http.get(self.endpoint("api/sessions")?).send().await?;
        decode(response).await
    }

    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> anyhow::Result<SessionSummary> {
        let response = self
            .http
            .post(self.endpoint("api/sessions")?)
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    async fn rename_session(&self, id: &str, title: String) -> anyhow::Result<SessionSummary> {
        let response = self
            .http
            .patch(self.endpoint(&format!("api/sessions/{}", id))?)
            .json(&RenameSessionRequest { title })
            .send()
            .await?;
        decode(response).await
    }

    async fn kill_session(&self, id: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .delete(self.endpoint(&format!("api/sessions/{}", id))?)
            .send()
            .await?;
        decode::<serde_json::Value>(response).await.map(|_| ())
    }

    /// Streams a query to stdout. Returns the resume token from `done`.
    async fn ask(&self, message: String, resume: Option<String>) -> anyhow::Result<Option<String>> {
        use std::io::Write;

        let mut response = self
            .http
            .post(self.endpoint("api/chat")?)
            .json(&QueryRequest {
                message,
                session_id: resume,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }

        let mut decoder = EventStreamDecoder::new();
        let mut stdout = std::io::stdout();
        while let Some(chunk) = response.chunk().await? {
            for event in decoder.push(&chunk) {
                match event? {
                    QueryEvent::Text { content } => {
                        stdout.write_all(content.as_bytes())?;
                        stdout.flush()?;
                    }
                    QueryEvent::Error { content } => eprintln!("\nerror: {}", content),
                    QueryEvent::Done { session_id } => {
                        println!();
                        return Ok(session_id);
                    }
                }
            }
        }
        anyhow::bail!("Stream ended without a done event")
    }
}

/// Base URL for the configured listener; wildcard hosts map to loopback.
fn default_base_url(config: &Config) -> anyhow::Result<Url> {
    let host = match config.server.host.as_str() {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" => "[::1]",
        other => other,
    };
    Url::parse(&format!("http://{}:{}/", host, config.server.port))
        .context("Invalid server address in configuration")
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<T> {
    if !response.status().is_success() {
        return Err(error_from(response).await);
    }
    Ok(response.json().await?)
}

async fn error_from(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let message = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body.get("error").and_then(|e| e.as_str()).map(str::to_owned))
        .unwrap_or_else(|| status.to_string());
    anyhow::anyhow!("{} ({})", message, status)
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary], now: DateTime<Utc>) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    const TITLE_WIDTH: usize = 24;
    const CWD_WIDTH: usize = 32;

    let id_width = sessions
        .iter()
        .map(|s| s.id.len())
        .max()
        .unwrap_or(8)
        .max(8);

    // Print header
    println!(
        "{:<id_width$}  {:<TITLE_WIDTH$}  {:<CWD_WIDTH$}  {:>13}",
        "ID", "TITLE", "CWD", "LAST ACTIVITY",
    );
    println!("{}", "-".repeat(id_width + TITLE_WIDTH + CWD_WIDTH + 19));

    // Print rows
    for session in sessions {
        println!(
            "{:<id_width$}  {:<TITLE_WIDTH$}  {:<CWD_WIDTH$}  {:>13}",
            session.id,
            truncate_str(&session.title, TITLE_WIDTH),
            truncate_str(&session.cwd, CWD_WIDTH),
            format_relative_time(session.last_activity, now),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a timestamp relative to `now` (e.g., "5m ago").
fn format_relative_time(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = (now - timestamp).num_seconds().max(0);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum number of characters, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
