//! webterm-attach: attach the local terminal to a webterm session.

use anyhow::{Context, Result};
use clap::Parser;
use client::terminal::{self, RawTerminal, Utf8Carry};
use client::{ClientInput, ReconnectPolicy, ReconnectingClient, RunOutcome};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Attach to a running webterm session. Press Ctrl-] to detach.
#[derive(Parser, Debug)]
#[command(name = "webterm-attach", version, about)]
struct Cli {
    /// Server base URL (e.g. http://127.0.0.1:3000)
    server: Url,

    /// Session ID to attach to
    session_id: String,

    /// Give up after this many consecutive failed reconnects
    #[arg(long, default_value_t = client::reconnect::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Enable verbose logging (to stderr)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let policy = ReconnectPolicy {
        max_attempts: cli.max_attempts,
        ..ReconnectPolicy::default()
    };
    let client = ReconnectingClient::new(&cli.server, &cli.session_id, policy, terminal::viewport())
        .context("Invalid server URL or session ID")?;
    tracing::info!(url = %client.url(), "Attaching");

    let raw = RawTerminal::new().context("Failed to enable raw terminal mode")?;

    let (input_tx, input_rx) = mpsc::channel(64);
    let (display_tx, mut display_rx) = mpsc::channel::<String>(256);

    #[cfg(unix)]
    let resizes = tokio::spawn(forward_resizes(input_tx.downgrade()));
    let keyboard = tokio::spawn(forward_keyboard(input_tx));

    let run = tokio::spawn(client.run(input_rx, display_tx));

    while let Some(chunk) = display_rx.recv().await {
        raw.write(chunk.as_bytes())
            .context("Failed to write to terminal")?;
    }

    keyboard.abort();
    #[cfg(unix)]
    resizes.abort();

    let outcome = run.await.context("Client task panicked")?;
    drop(raw);

    match outcome {
        RunOutcome::Detached => eprintln!("\nDetached from session {}", cli.session_id),
        RunOutcome::Abandoned => std::process::exit(1),
    }
    Ok(())
}

/// Forward stdin to the client until EOF or the detach key.
async fn forward_keyboard(input: mpsc::Sender<ClientInput>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    let mut carry = Utf8Carry::new();

    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read stdin");
                break;
            }
        };

        let (keys, detach) = terminal::split_detach(&buf[..n]);
        let text = carry.push(keys);
        if !text.is_empty() && input.send(ClientInput::Keys(text)).await.is_err() {
            break;
        }
        if detach {
            break;
        }
    }
    // Dropping the sender tells the client to detach.
}

#[cfg(unix)]
async fn forward_resizes(input: mpsc::WeakSender<ClientInput>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch = match signal(SignalKind::window_change()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to watch terminal resizes");
            return;
        }
    };

    while winch.recv().await.is_some() {
        let Some(input) = input.upgrade() else {
            break;
        };
        let (cols, rows) = terminal::viewport();
        if input.send(ClientInput::Resize { cols, rows }).await.is_err() {
            break;
        }
    }
}
