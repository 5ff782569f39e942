//! WebSocket driver for the reconnect controller.

use std::ops::ControlFlow;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::ClientMessage;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::error::{ClientError, Result};
use crate::reconnect::{Action, CloseOutcome, ReconnectController, ReconnectPolicy};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, WsMessage>;

/// Local events fed to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    /// Keystrokes typed by the user.
    Keys(String),
    /// The local viewport changed.
    Resize { cols: u16, rows: u16 },
}

/// Why [`ReconnectingClient::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Retries were exhausted.
    Abandoned,
    /// The local input channel closed (the user detached).
    Detached,
}

/// Keeps a session WebSocket open across transient failures.
pub struct ReconnectingClient {
    url: Url,
    controller: ReconnectController,
}

impl ReconnectingClient {
    /// Creates a client for `session_id` on the server at `server`.
    pub fn new(
        server: &Url,
        session_id: &str,
        policy: ReconnectPolicy,
        viewport: (u16, u16),
    ) -> Result<Self> {
        Ok(Self {
            url: session_ws_url(server, session_id)?,
            controller: ReconnectController::new(policy, viewport.0, viewport.1),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn controller(&self) -> &ReconnectController {
        &self.controller
    }

    /// Runs until retries are exhausted or `input` closes. Display bytes are
    /// sent on `display`.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<ClientInput>,
        display: mpsc::Sender<String>,
    ) -> RunOutcome {
        loop {
            if !self.controller.begin_connect() {
                return RunOutcome::Abandoned;
            }

            tracing::debug!(url = %self.url, "Connecting");
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    if self.pump(ws, &mut input, &display).await.is_break() {
                        return RunOutcome::Detached;
                    }
                }
                Err(e) => {
                    tracing::debug!(url = %self.url, error = %e, "Connection attempt failed");
                }
            }

            match self.controller.on_close() {
                CloseOutcome::Retry(delay) => {
                    tracing::info!("reconnecting in {:?}", delay);
                    if self.wait(delay, &mut input).await.is_break() {
                        return RunOutcome::Detached;
                    }
                }
                CloseOutcome::Abandoned { message } => {
                    tracing::warn!(
                        attempts = self.controller.attempts(),
                        "Giving up on reconnecting"
                    );
                    let _ = display.send(message).await;
                    return RunOutcome::Abandoned;
                }
                CloseOutcome::Ignored => return RunOutcome::Abandoned,
            }
        }
    }

    /// Relays traffic over one open connection. Breaks when input closes.
    async fn pump(
        &mut self,
        ws: WsStream,
        input: &mut mpsc::Receiver<ClientInput>,
        display: &mpsc::Sender<String>,
    ) -> ControlFlow<()> {
        let (mut sink, mut stream) = ws.split();
        tracing::info!(url = %self.url, "Connected");

        for action in self.controller.on_open() {
            match action {
                Action::Send(message) => {
                    if !send(&mut sink, &message).await {
                        return ControlFlow::Continue(());
                    }
                }
            }
        }

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(out) = self.controller.on_message(&text) {
                            let _ = display.send(out).await;
                        }
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        let _ = display.send(String::from_utf8_lossy(&bytes).into_owned()).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "WebSocket error");
                        break;
                    }
                },
                local = input.recv() => {
                    let message = match local {
                        Some(ClientInput::Keys(keys)) => self.controller.outbound_input(keys),
                        Some(ClientInput::Resize { cols, rows }) => {
                            self.controller.set_viewport(cols, rows)
                        }
                        None => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            return ControlFlow::Break(());
                        }
                    };
                    if let Some(message) = message {
                        if !send(&mut sink, &message).await {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!(url = %self.url, "Disconnected");
        ControlFlow::Continue(())
    }

    /// Sleeps out a retry delay. Keystrokes are dropped; geometry is kept.
    async fn wait(
        &mut self,
        delay: Duration,
        input: &mut mpsc::Receiver<ClientInput>,
    ) -> ControlFlow<()> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return ControlFlow::Continue(()),
                local = input.recv() => match local {
                    Some(ClientInput::Keys(_)) => {}
                    Some(ClientInput::Resize { cols, rows }) => {
                        self.controller.set_viewport(cols, rows);
                    }
                    None => return ControlFlow::Break(()),
                },
            }
        }
    }
}

async fn send(sink: &mut WsSink, message: &ClientMessage) -> bool {
    match message.to_json() {
        Ok(json) => sink.send(WsMessage::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode client message");
            true
        }
    }
}

/// Builds `ws[s]://host/ws/<session_id>` from an http(s) or ws(s) base URL.
pub fn session_ws_url(server: &Url, session_id: &str) -> Result<Url> {
    if session_id.is_empty()
        || !session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(ClientError::InvalidSessionId(session_id.to_string()));
    }

    let scheme = match server.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ClientError::InvalidUrl(format!("unsupported scheme '{}'", other))),
    };

    let mut url = server.clone();
    url.set_scheme(scheme)
        .map_err(|_| ClientError::InvalidUrl(server.to_string()))?;
    url.set_query(None);
    url.set_fragment(None);

    let base = if url.path().ends_with('/') {
        url
    } else {
        let path = format!("{}/", url.path());
        let mut with_slash = url;
        with_slash.set_path(&path);
        with_slash
    };
    base.join(&format!("ws/{}", session_id))
        .map_err(|e| ClientError::InvalidUrl(e.to_string()))
}
