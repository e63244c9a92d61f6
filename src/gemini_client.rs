//! Gemini Live API client
//!
//! Opens the bidirectional websocket, performs the setup handshake, then splits
//! the socket: a reader task demultiplexes inbound frames into [`ApiResponse`]
//! events on a channel and a writer task drains outbound [`ClientMessage`]s.

use crate::config::SessionConfig;
use crate::gemini::{
    parse_server_message, ApiResponse, BidiGenerateContentSetup, ClientMessage, Content,
    GeminiError, GenerationConfig, Part, Result, SpeechConfig,
};
use crate::tools;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use std::future::Future;
use std::time::Duration;

pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// How long the server gets to acknowledge setup.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 100;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection parameters shared by every session
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub model: String,
    pub setup_timeout: Duration,
}

impl ClientConfig {
    pub fn from_api_key(api_key: &str, model: &str) -> Self {
        Self {
            url: format!("{}?key={}", LIVE_ENDPOINT, api_key),
            model: model.to_string(),
            setup_timeout: SETUP_TIMEOUT,
        }
    }
}

/// Setup message for one session: audio responses in the chosen voice, the
/// persona as system instruction, and the enabled tools.
pub fn build_setup(model: &str, session: &SessionConfig) -> BidiGenerateContentSetup {
    BidiGenerateContentSetup {
        model: model.to_string(),
        generation_config: Some(GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: Some(SpeechConfig::prebuilt(session.voice.as_str())),
        }),
        system_instruction: Some(Content {
            parts: vec![Part {
                text: Some(session.persona.clone()),
                inline_data: None,
            }],
        }),
        tools: tools::declarations(&session.tools),
    }
}

/// An established live session.
///
/// Outbound messages go through a cloneable sender; inbound events are read
/// with [`LiveLink::recv`]. Closing is idempotent and also happens on drop.
pub struct LiveLink {
    outbound: Option<mpsc::Sender<ClientMessage>>,
    inbound: mpsc::Receiver<Result<ApiResponse>>,
    shutdown: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
}

impl LiveLink {
    /// Assemble a link from raw channels. `shutdown` fires once on close.
    pub fn from_channels(
        outbound: mpsc::Sender<ClientMessage>,
        inbound: mpsc::Receiver<Result<ApiResponse>>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            shutdown: Some(shutdown),
            reader: None,
        }
    }

    /// A sender for outbound messages, or `None` once closed.
    pub fn outbound(&self) -> Option<mpsc::Sender<ClientMessage>> {
        self.outbound.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_none()
    }

    /// Next inbound event. `None` once the link is closed and drained.
    pub async fn recv(&mut self) -> Option<Result<ApiResponse>> {
        self.inbound.recv().await
    }

    /// Close the session. The writer sends a websocket Close on its way out;
    /// nothing further is read.
    pub fn close(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        self.outbound = None;
        let _ = shutdown.send(());
        self.inbound.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        debug!("Live link closed");
    }
}

impl Drop for LiveLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens live sessions
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, session: &SessionConfig) -> impl Future<Output = Result<LiveLink>> + Send;
}

/// Connects to the real Gemini Live endpoint.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    config: ClientConfig,
}

impl GeminiConnector {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

impl Connector for GeminiConnector {
    async fn connect(&self, session: &SessionConfig) -> Result<LiveLink> {
        info!("Connecting to Gemini Live API (model {})", self.config.model);

        let (ws_stream, resp) = connect_async(self.config.url.as_str()).await?;
        debug!("WebSocket handshake status: {}", resp.status());

        let (mut sink, mut stream) = ws_stream.split();

        let setup = ClientMessage::Setup(build_setup(&self.config.model, session));
        let json = serde_json::to_string(&setup)?;
        sink.send(Message::Text(json.into())).await?;
        info!(
            "Setup sent (voice {}, {} tool(s)), waiting for acknowledgment",
            session.voice,
            session.tools.len()
        );

        tokio::time::timeout(self.config.setup_timeout, wait_for_setup_complete(&mut stream))
            .await
            .map_err(|_| {
                error!("Timeout waiting for setup complete message");
                GeminiError::Timeout
            })??;
        info!("Gemini session setup complete");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let reader = tokio::spawn(read_loop(stream, inbound_tx));
        tokio::spawn(write_loop(sink, outbound_rx, shutdown_rx));

        let mut link = LiveLink::from_channels(outbound_tx, inbound_rx, shutdown_tx);
        link.reader = Some(reader);
        Ok(link)
    }
}

fn frame_text(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

async fn wait_for_setup_complete(stream: &mut WsStream) -> Result<()> {
    while let Some(message) = stream.next().await {
        let message = message?;
        if let Message::Close(frame) = &message {
            warn!("Server closed during setup: {:?}", frame);
            return Err(GeminiError::ConnectionClosed);
        }
        let Some(text) = frame_text(&message) else {
            continue;
        };
        match parse_server_message(text) {
            Ok(events) if events.contains(&ApiResponse::SetupComplete) => return Ok(()),
            Ok(_) => debug!("Ignoring message received before setup completed"),
            Err(e) => warn!("Unparseable message during setup: {}", e),
        }
    }
    Err(GeminiError::ConnectionClosed)
}

async fn read_loop(mut stream: WsStream, tx: mpsc::Sender<Result<ApiResponse>>) {
    debug!("Inbound message task started");

    let mut close_reason = None;
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Close(frame)) => {
                info!("WebSocket closed: {:?}", frame);
                close_reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty());
                break;
            }
            Ok(message) => {
                let Some(text) = frame_text(&message) else {
                    continue;
                };
                trace!("Received frame: {}", text);
                match parse_server_message(text) {
                    Ok(events) => {
                        for event in events {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Failed to parse server message: {}", e),
                }
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                let _ = tx.send(Err(GeminiError::WebSocket(e))).await;
                return;
            }
        }
    }

    let _ = tx
        .send(Ok(ApiResponse::Closed {
            reason: close_reason,
        }))
        .await;
    debug!("Inbound message task terminated");
}

async fn write_loop(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<ClientMessage>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            message = rx.recv() => {
                let Some(message) = message else { break };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize {} message: {}", message.kind(), e);
                        continue;
                    }
                };
                trace!("Sending {} message", message.kind());
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    error!("Failed to send {} message: {}", message.kind(), e);
                    break;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    debug!("Outbound message task terminated");
}
