//! Session controller
//!
//! One task owns everything a live session needs: the link, the playback
//! scheduler, the capture pipeline and the outstanding tool batches. Commands
//! and inbound events are handled one at a time on that task, so the
//! scheduler and its in-flight set need no locking. The capture thread only
//! ever reaches the outbound sender, through [`OutboundSlot`].

use crate::capture::{CaptureFault, CapturePipeline, MicrophoneOpener};
use crate::config::{SessionConfig, Voice};
use crate::encoder::encode_frame;
use crate::gemini::{ApiResponse, ClientMessage, GeminiError, Transcript};
use crate::gemini_client::{Connector, LiveLink};
use crate::playback::{AudioOutput, HandleId, PlaybackScheduler};
use crate::tools::{batch_from_calls, ToolCallResult, ToolDispatcher, ToolKind, WeatherClient};
use crate::visualizer::Tap;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::{block_in_place, JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Ready,
    Closed(Option<String>),
    Errored(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => f.write_str("uninitialized"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Ready => f.write_str("ready"),
            SessionState::Closed(None) => f.write_str("closed"),
            SessionState::Closed(Some(reason)) => write!(f, "closed ({})", reason),
            SessionState::Errored(cause) => write!(f, "error: {}", cause),
        }
    }
}

/// Snapshot published whenever anything user-visible changes.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub recording: bool,
    pub message: Option<String>,
    pub transcript: Option<String>,
    pub config: SessionConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartRecording,
    StopRecording,
    SetPersona(String),
    SetVoice(Voice),
    SetTools(BTreeSet<ToolKind>),
    Reset,
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session controller has stopped")]
    Stopped,
}

/// Cheap handle for driving a running controller.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Stopped)
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn current(&self) -> SessionStatus {
        self.status.borrow().clone()
    }
}

/// Where the capture thread finds the current session's outbound sender.
#[derive(Clone, Default)]
pub struct OutboundSlot {
    inner: Arc<Mutex<Option<mpsc::Sender<ClientMessage>>>>,
}

impl OutboundSlot {
    fn set(&self, sender: Option<mpsc::Sender<ClientMessage>>) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = sender;
        }
    }

    fn clear(&self) {
        self.set(None);
    }

    /// Queue a message without waiting. Dropped when no session is open or
    /// the transport is backed up.
    pub fn offer(&self, message: ClientMessage) -> bool {
        let Ok(slot) = self.inner.lock() else {
            return false;
        };
        match slot.as_ref().map(|tx| tx.try_send(message)) {
            Some(Ok(())) => true,
            Some(Err(TrySendError::Full(_))) => {
                trace!("Outbound queue full, dropping audio frame");
                false
            }
            Some(Err(TrySendError::Closed(_))) | None => false,
        }
    }
}

/// Everything besides the I/O backends that a controller is built from.
#[derive(Clone)]
pub struct SessionSettings {
    pub config: SessionConfig,
    pub settle_delay: Duration,
    pub weather: WeatherClient,
    pub input_tap: Tap,
}

/// Outcome of one tool batch: how many results reached the session.
type ToolReply = Result<usize, SendError<ClientMessage>>;

pub struct SessionController<C: Connector, M: MicrophoneOpener, O: AudioOutput> {
    connector: Arc<C>,
    microphone: Arc<M>,
    scheduler: PlaybackScheduler<O>,
    weather: WeatherClient,
    dispatcher: ToolDispatcher,
    config: SessionConfig,
    settle_delay: Duration,

    state: SessionState,
    message: Option<String>,
    transcript: Option<String>,

    link: Option<LiveLink>,
    connecting: Option<JoinHandle<crate::gemini::Result<LiveLink>>>,
    reconnect_at: Option<Instant>,
    pending_tools: JoinSet<ToolReply>,

    capture: CapturePipeline,
    capture_faults: mpsc::UnboundedReceiver<CaptureFault>,
    outbound: OutboundSlot,
    input_tap: Tap,

    status_tx: watch::Sender<SessionStatus>,
}

impl<C, M, O> SessionController<C, M, O>
where
    C: Connector,
    M: MicrophoneOpener,
    O: AudioOutput + 'static,
{
    pub fn new(connector: C, microphone: M, output: O, settings: SessionSettings) -> Self {
        let SessionSettings {
            config,
            settle_delay,
            weather,
            input_tap,
        } = settings;

        let (fault_tx, capture_faults) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(SessionStatus {
            state: SessionState::Uninitialized,
            recording: false,
            message: None,
            transcript: None,
            config: config.clone(),
        });

        Self {
            connector: Arc::new(connector),
            microphone: Arc::new(microphone),
            scheduler: PlaybackScheduler::new(output),
            dispatcher: ToolDispatcher::new(config.tools.clone(), weather.clone()),
            weather,
            config,
            settle_delay,
            state: SessionState::Uninitialized,
            message: None,
            transcript: None,
            link: None,
            connecting: None,
            reconnect_at: None,
            pending_tools: JoinSet::new(),
            capture: CapturePipeline::with_faults(fault_tx),
            capture_faults,
            outbound: OutboundSlot::default(),
            input_tap,
            status_tx,
        }
    }

    /// Run the controller on its own task. `ended` carries completion
    /// notices from the audio output.
    pub fn spawn(self, ended: mpsc::UnboundedReceiver<HandleId>) -> (SessionHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let handle = SessionHandle {
            commands: command_tx,
            status: self.status_tx.subscribe(),
        };
        let task = tokio::spawn(self.run(command_rx, ended));
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut ended: mpsc::UnboundedReceiver<HandleId>,
    ) {
        self.begin_connect();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                joined = join_connect(&mut self.connecting), if self.connecting.is_some() => {
                    self.connecting = None;
                    self.on_connect_finished(joined);
                }
                event = next_event(&mut self.link), if self.link.is_some() => {
                    self.on_event(event);
                }
                Some(id) = ended.recv() => {
                    self.scheduler.on_ended(id);
                }
                Some(joined) = self.pending_tools.join_next(), if !self.pending_tools.is_empty() => {
                    self.on_tool_reply(joined);
                }
                Some(fault) = self.capture_faults.recv() => {
                    self.on_capture_fault(fault);
                }
                _ = settle(self.reconnect_at), if self.reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.begin_connect();
                }
            }
        }

        self.teardown();
        self.state = SessionState::Closed(None);
        self.publish();
        info!("Session controller stopped");
    }

    fn publish(&self) {
        self.status_tx.send_replace(SessionStatus {
            state: self.state.clone(),
            recording: self.capture.is_running(),
            message: self.message.clone(),
            transcript: self.transcript.clone(),
            config: self.config.clone(),
        });
    }

    fn begin_connect(&mut self) {
        self.state = SessionState::Connecting;
        self.message = Some("Connecting...".to_string());
        self.publish();

        let connector = self.connector.clone();
        let config = self.config.clone();
        self.connecting = Some(tokio::spawn(async move { connector.connect(&config).await }));
    }

    fn on_connect_finished(&mut self, joined: Result<crate::gemini::Result<LiveLink>, JoinError>) {
        match joined {
            Ok(Ok(link)) => {
                self.outbound.set(link.outbound());
                self.link = Some(link);
                self.dispatcher = ToolDispatcher::new(self.config.tools.clone(), self.weather.clone());
                self.scheduler.rebase();
                self.state = SessionState::Ready;
                self.message = Some("Connected. Ready to start.".to_string());
                info!("Session ready");
            }
            Ok(Err(e)) => {
                error!("Failed to connect: {}", e);
                self.state = SessionState::Errored(e.to_string());
                self.message = Some(format!("Failed to connect: {}", e));
            }
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                error!("Connect task failed: {}", e);
                self.state = SessionState::Errored(e.to_string());
                self.message = Some(format!("Failed to connect: {}", e));
            }
        }
        self.publish();
    }

    fn handle_command(&mut self, command: Command) {
        debug!("Handling command {:?}", command);
        match command {
            Command::StartRecording => self.start_recording(),
            Command::StopRecording => {
                self.capture.stop();
                self.message = Some("Stopped recording".to_string());
                self.publish();
            }
            Command::SetPersona(persona) => match SessionConfig::normalize_persona(&persona) {
                Ok(persona) => {
                    let next = SessionConfig {
                        persona,
                        ..self.config.clone()
                    };
                    self.apply_config(next);
                }
                Err(e) => {
                    self.message = Some(e.to_string());
                    self.publish();
                }
            },
            Command::SetVoice(voice) => {
                let next = SessionConfig {
                    voice,
                    ..self.config.clone()
                };
                self.apply_config(next);
            }
            Command::SetTools(tools) => {
                let next = SessionConfig {
                    tools,
                    ..self.config.clone()
                };
                self.apply_config(next);
            }
            Command::Reset => self.restart(),
            Command::Shutdown => {}
        }
    }

    fn start_recording(&mut self) {
        if self.state != SessionState::Ready {
            self.message = Some(format!("Cannot record while {}", self.state));
            self.publish();
            return;
        }

        let tap = self.input_tap.clone();
        let slot = self.outbound.clone();
        let microphone = self.microphone.clone();
        let capture = &mut self.capture;
        let started = off_worker(|| {
            capture.start(microphone, move |frame| {
                tap.push(frame);
                match encode_frame(frame) {
                    Ok(chunk) => {
                        slot.offer(ClientMessage::audio(&chunk));
                    }
                    Err(e) => warn!("Skipping capture frame: {}", e),
                }
            })
        });

        self.message = Some(match started {
            Ok(()) => "Recording...".to_string(),
            Err(e) => {
                error!("Could not start recording: {}", e);
                e.to_string()
            }
        });
        self.publish();
    }

    fn apply_config(&mut self, next: SessionConfig) {
        if next == self.config {
            debug!("Session config unchanged");
            return;
        }
        self.config = next;
        self.restart();
    }

    /// Close whatever is open and reconnect once things have settled.
    /// Repeated calls within the delay push the reconnect back; they never
    /// open more than one new session.
    fn restart(&mut self) {
        self.teardown();
        self.transcript = None;
        self.state = SessionState::Connecting;
        self.message = Some("Restarting session...".to_string());
        self.reconnect_at = Some(Instant::now() + self.settle_delay);
        self.publish();
    }

    /// Release the microphone, close the link and abandon outstanding work.
    fn teardown(&mut self) {
        self.capture.stop();
        self.outbound.clear();
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        self.pending_tools.abort_all();
        self.pending_tools = JoinSet::new();
        self.scheduler.interrupt();
        self.input_tap.clear();
    }

    fn on_event(&mut self, event: Option<crate::gemini::Result<ApiResponse>>) {
        let response = match event {
            Some(Ok(response)) => response,
            Some(Err(e)) => {
                self.fail(e);
                return;
            }
            None => {
                self.close(None);
                return;
            }
        };

        match response {
            ApiResponse::AudioDelta { data, .. } => {
                if let Err(e) = self.scheduler.schedule_pcm(&data) {
                    warn!("Skipping malformed audio segment: {}", e);
                }
            }
            ApiResponse::TextResponse(text) => {
                info!("Model text: {}", text);
                self.set_transcript(format!("AI: {}", text));
            }
            ApiResponse::InputTranscription(transcript) => {
                self.on_transcript("You", transcript);
            }
            ApiResponse::OutputTranscription(transcript) => {
                self.on_transcript("AI", transcript);
            }
            ApiResponse::ToolCall(calls) => {
                let batch = batch_from_calls(calls);
                info!("Model requested {} function call(s)", batch.len());
                let Some(tx) = self.link.as_ref().and_then(LiveLink::outbound) else {
                    warn!("Session gone, ignoring {} function call(s)", batch.len());
                    return;
                };
                // Replies go out from the batch task on the asking session's sender.
                let dispatcher = self.dispatcher.clone();
                self.pending_tools.spawn(async move {
                    let results = dispatcher.dispatch(batch).await;
                    let count = results.len();
                    let responses = results
                        .into_iter()
                        .map(ToolCallResult::into_function_response)
                        .collect();
                    tx.send(ClientMessage::tool_response(responses))
                        .await
                        .map(|()| count)
                });
            }
            ApiResponse::ToolCallCancellation(ids) => {
                info!("Model cancelled function call(s): {:?}", ids);
            }
            ApiResponse::Interrupted => {
                let stopped = self.scheduler.interrupt();
                debug!("Interrupted, flushed {} buffer(s)", stopped);
            }
            ApiResponse::TurnComplete => debug!("Turn complete"),
            ApiResponse::GenerationComplete => debug!("Generation complete"),
            ApiResponse::GoAway { time_left } => {
                warn!("Server is going away (time left: {:?})", time_left);
            }
            ApiResponse::SetupComplete => debug!("Duplicate setup acknowledgment"),
            ApiResponse::Closed { reason } => self.close(reason),
        }
    }

    fn on_tool_reply(&mut self, joined: Result<ToolReply, JoinError>) {
        match joined {
            Ok(Ok(count)) => debug!("Sent {} tool result(s)", count),
            Ok(Err(_)) => warn!("Failed to send tool response: session closed"),
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!("Tool batch panicked: {}", e),
        }
    }

    fn on_capture_fault(&mut self, fault: CaptureFault) {
        if fault.generation != self.capture.generation() {
            debug!("Ignoring fault from an earlier capture");
            return;
        }
        // Reap the dead worker so the next start opens the device afresh.
        self.capture.stop();
        self.message = Some(format!("Recording stopped: {}", fault.error));
        self.publish();
    }

    fn on_transcript(&mut self, speaker: &str, transcript: Transcript) {
        if transcript.is_final {
            info!("{}: {}", speaker, transcript.text);
        } else {
            debug!("{} (partial): {}", speaker, transcript.text);
        }
        self.set_transcript(format!("{}: {}", speaker, transcript.text));
    }

    fn set_transcript(&mut self, line: String) {
        self.transcript = Some(line);
        self.publish();
    }

    fn close(&mut self, reason: Option<String>) {
        info!("Session closed: {}", reason.as_deref().unwrap_or("no reason given"));
        self.teardown();
        self.message = Some(match &reason {
            Some(reason) => format!("Session closed: {}", reason),
            None => "Session closed".to_string(),
        });
        self.state = SessionState::Closed(reason);
        self.publish();
    }

    fn fail(&mut self, error: GeminiError) {
        error!("Session error: {}", error);
        self.teardown();
        self.message = Some(format!("Session error: {}", error));
        self.state = SessionState::Errored(error.to_string());
        self.publish();
    }
}

/// Run a call that blocks on the audio server. On a multi-threaded runtime
/// the worker hands its other tasks off first; a device open is bounded by
/// the PulseAudio connect timeout.
fn off_worker<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => block_in_place(f),
        _ => f(),
    }
}

async fn join_connect(
    task: &mut Option<JoinHandle<crate::gemini::Result<LiveLink>>>,
) -> Result<crate::gemini::Result<LiveLink>, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn next_event(link: &mut Option<LiveLink>) -> Option<crate::gemini::Result<ApiResponse>> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn settle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureError, FrameSource};
    use crate::gemini::FunctionCall;
    use crate::playback::PcmBuffer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    struct FakeSession {
        config: SessionConfig,
        server: mpsc::Sender<crate::gemini::Result<ApiResponse>>,
        client: mpsc::Receiver<ClientMessage>,
        closed: oneshot::Receiver<()>,
    }

    struct FakeConnector {
        sessions: mpsc::UnboundedSender<FakeSession>,
        connects: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Connector for FakeConnector {
        async fn connect(&self, session: &SessionConfig) -> crate::gemini::Result<LiveLink> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GeminiError::Timeout);
            }
            let (client_tx, client_rx) = mpsc::channel(64);
            let (server_tx, server_rx) = mpsc::channel(64);
            let (closed_tx, closed_rx) = oneshot::channel();
            let _ = self.sessions.send(FakeSession {
                config: session.clone(),
                server: server_tx,
                client: client_rx,
                closed: closed_rx,
            });
            Ok(LiveLink::from_channels(client_tx, server_rx, closed_tx))
        }
    }

    struct QuietSource {
        frames_left: Option<usize>,
    }

    impl FrameSource for QuietSource {
        fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), CaptureError> {
            std::thread::sleep(std::time::Duration::from_millis(1));
            match &mut self.frames_left {
                Some(0) => return Err(CaptureError::DeviceUnavailable("unplugged".to_string())),
                Some(n) => *n -= 1,
                None => {}
            }
            frame.fill(0.0);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeMic {
        deny: bool,
        fail_after: Option<usize>,
    }

    impl MicrophoneOpener for FakeMic {
        type Source = QuietSource;

        fn open(&self) -> Result<QuietSource, CaptureError> {
            if self.deny {
                Err(CaptureError::PermissionDenied("access refused".to_string()))
            } else {
                Ok(QuietSource {
                    frames_left: self.fail_after,
                })
            }
        }
    }

    #[derive(Default)]
    struct OutputLog {
        started: Vec<(HandleId, f64)>,
        stopped: Vec<HandleId>,
    }

    #[derive(Clone, Default)]
    struct FakeOutput {
        log: Arc<Mutex<OutputLog>>,
    }

    impl AudioOutput for FakeOutput {
        fn current_time(&self) -> f64 {
            0.0
        }

        fn start(&mut self, _buffer: PcmBuffer, at: f64) -> HandleId {
            let mut log = self.log.lock().unwrap();
            let id = log.started.len() as HandleId + 1;
            log.started.push((id, at));
            id
        }

        fn stop(&mut self, id: HandleId) {
            self.log.lock().unwrap().stopped.push(id);
        }
    }

    struct Harness {
        handle: SessionHandle,
        sessions: mpsc::UnboundedReceiver<FakeSession>,
        connects: Arc<AtomicUsize>,
        output: FakeOutput,
        _ended: mpsc::UnboundedSender<HandleId>,
    }

    fn harness(deny_mic: bool, fail_connect: bool) -> Harness {
        let mic = FakeMic {
            deny: deny_mic,
            ..FakeMic::default()
        };
        harness_with(mic, fail_connect, WeatherClient::default())
    }

    fn harness_with(mic: FakeMic, fail_connect: bool, weather: WeatherClient) -> Harness {
        let (sessions_tx, sessions) = mpsc::unbounded_channel();
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = FakeConnector {
            sessions: sessions_tx,
            connects: connects.clone(),
            fail: fail_connect,
        };
        let output = FakeOutput::default();
        let settings = SessionSettings {
            config: SessionConfig::default(),
            settle_delay: Duration::from_millis(500),
            weather,
            input_tap: Tap::new(),
        };
        let controller = SessionController::new(connector, mic, output.clone(), settings);
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let (handle, _task) = controller.spawn(ended_rx);
        Harness {
            handle,
            sessions,
            connects,
            output,
            _ended: ended_tx,
        }
    }

    async fn wait_ready(handle: &SessionHandle) {
        let mut status = handle.status();
        status
            .wait_for(|s| s.state == SessionState::Ready)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_change_closes_once_and_reconnects_once() {
        let mut h = harness(false, false);
        let first = h.sessions.recv().await.unwrap();
        wait_ready(&h.handle).await;

        h.handle
            .send(Command::SetPersona("You are a pirate.".to_string()))
            .await
            .unwrap();
        h.handle.send(Command::SetVoice(Voice::Puck)).await.unwrap();

        assert!(first.closed.await.is_ok());

        let second = h.sessions.recv().await.unwrap();
        assert_eq!(second.config.persona, "You are a pirate.");
        assert_eq!(second.config.voice, Voice::Puck);
        wait_ready(&h.handle).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.sessions.try_recv().is_err());
        assert_eq!(h.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_config_does_not_reconnect() {
        let mut h = harness(false, false);
        let _first = h.sessions.recv().await.unwrap();
        wait_ready(&h.handle).await;

        h.handle.send(Command::SetVoice(Voice::Orus)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_batch_answered_in_one_message() {
        let mut h = harness(false, false);
        let mut session = h.sessions.recv().await.unwrap();
        wait_ready(&h.handle).await;

        let calls = vec![
            FunctionCall {
                id: Some("a".to_string()),
                name: "console_log_name".to_string(),
                args: serde_json::json!({"name": "Ada"}).as_object().cloned().unwrap(),
            },
            FunctionCall {
                id: Some("b".to_string()),
                name: "launch_rocket".to_string(),
                args: Default::default(),
            },
        ];
        session.server.send(Ok(ApiResponse::ToolCall(calls))).await.unwrap();

        match session.client.recv().await.unwrap() {
            ClientMessage::ToolResponse(response) => {
                let ids: Vec<_> = response
                    .function_responses
                    .iter()
                    .map(|r| r.id.as_str())
                    .collect();
                assert_eq!(ids, vec!["a", "b"]);
                assert_eq!(response.function_responses[0].response["result"]["status"], "success");
                assert_eq!(
                    response.function_responses[1].response["error"],
                    "Unknown function: launch_rocket"
                );
            }
            other => panic!("unexpected message {:?}", other.kind()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_is_gapless_and_interrupt_flushes() {
        let mut h = harness(false, false);
        let session = h.sessions.recv().await.unwrap();
        wait_ready(&h.handle).await;

        for _ in 0..3 {
            session
                .server
                .send(Ok(ApiResponse::AudioDelta {
                    data: vec![0u8; 4800],
                    mime_type: None,
                }))
                .await
                .unwrap();
        }
        // Odd-length payloads are skipped, not fatal.
        session
            .server
            .send(Ok(ApiResponse::AudioDelta {
                data: vec![0u8; 3],
                mime_type: None,
            }))
            .await
            .unwrap();
        session.server.send(Ok(ApiResponse::Interrupted)).await.unwrap();

        for _ in 0..100 {
            if h.output.log.lock().unwrap().stopped.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let log = h.output.log.lock().unwrap();
        let starts: Vec<f64> = log.started.iter().map(|(_, at)| *at).collect();
        assert_eq!(starts.len(), 3);
        for (k, at) in starts.iter().enumerate() {
            assert!((at - 0.1 * k as f64).abs() < 1e-9);
        }
        let mut stopped = log.stopped.clone();
        stopped.sort();
        assert_eq!(stopped, vec![1, 2, 3]);
        assert_eq!(h.handle.current().state, SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_microphone_is_reported() {
        let mut h = harness(true, false);
        let _session = h.sessions.recv().await.unwrap();
        wait_ready(&h.handle).await;

        h.handle.send(Command::StartRecording).await.unwrap();
        let mut status = h.handle.status();
        let status = status
            .wait_for(|s| s.message.as_deref().is_some_and(|m| m.contains("denied")))
            .await
            .unwrap()
            .clone();
        assert!(!status.recording);
        assert_eq!(status.state, SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_streams_audio_frames() {
        let mut h = harness(false, false);
        let mut session = h.sessions.recv().await.unwrap();
        wait_ready(&h.handle).await;

        h.handle.send(Command::StartRecording).await.unwrap();
        match session.client.recv().await.unwrap() {
            ClientMessage::RealtimeInput(input) => {
                assert_eq!(input.audio.mime_type, "audio/pcm;rate=16000");
            }
            other => panic!("unexpected message {:?}", other.kind()),
        }
        h.handle.send(Command::StopRecording).await.unwrap();
        let mut status = h.handle.status();
        status.wait_for(|s| !s.recording).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recording_starts_on_multi_thread_runtime() {
        let mut h = harness(false, false);
        let mut session = h.sessions.recv().await.unwrap();
        wait_ready(&h.handle).await;

        h.handle.send(Command::StartRecording).await.unwrap();
        assert!(matches!(
            session.client.recv().await.unwrap(),
            ClientMessage::RealtimeInput(_)
        ));
        h.handle.send(Command::StopRecording).await.unwrap();
        let mut status = h.handle.status();
        status.wait_for(|s| !s.recording).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_microphone_failure_mid_stream_is_reported() {
        let mic = FakeMic {
            fail_after: Some(5),
            ..FakeMic::default()
        };
        let mut h = harness_with(mic, false, WeatherClient::default());
        let _session = h.sessions.recv().await.unwrap();
        wait_ready(&h.handle).await;

        h.handle.send(Command::StartRecording).await.unwrap();
        let mut status = h.handle.status();
        let status = status
            .wait_for(|s| s.message.as_deref().is_some_and(|m| m.starts_with("Recording stopped")))
            .await
            .unwrap()
            .clone();
        assert!(!status.recording);
        assert!(status.message.unwrap().contains("unplugged"));
        assert_eq!(status.state, SessionState::Ready);
    }

    /// Accepts HTTP connections and never answers. Each accept is signalled.
    async fn silent_server() -> (String, mpsc::UnboundedReceiver<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                let _ = accepted_tx.send(());
                held.push(socket);
            }
        });
        (format!("http://{}", addr), accepted)
    }

    #[tokio::test]
    async fn test_outstanding_tool_call_is_abandoned_on_restart() {
        let (base, mut accepted) = silent_server().await;
        let weather = WeatherClient::with_endpoints(
            &format!("{}/v1/search", base),
            &format!("{}/v1/forecast", base),
        );
        let mut h = harness_with(FakeMic::default(), false, weather);
        let mut first = h.sessions.recv().await.unwrap();
        wait_ready(&h.handle).await;

        let call = FunctionCall {
            id: Some("w".to_string()),
            name: "get_weather".to_string(),
            args: serde_json::json!({"location": "Paris"}).as_object().cloned().unwrap(),
        };
        first.server.send(Ok(ApiResponse::ToolCall(vec![call]))).await.unwrap();
        accepted.recv().await.unwrap();

        // Playback keeps going while the lookup hangs.
        first
            .server
            .send(Ok(ApiResponse::AudioDelta {
                data: vec![0u8; 4800],
                mime_type: None,
            }))
            .await
            .unwrap();
        for _ in 0..100 {
            if !h.output.log.lock().unwrap().started.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.output.log.lock().unwrap().started.len(), 1);

        h.handle.send(Command::SetVoice(Voice::Puck)).await.unwrap();
        let mut second = h.sessions.recv().await.unwrap();
        wait_ready(&h.handle).await;

        while let Ok(message) = first.client.try_recv() {
            assert!(!matches!(message, ClientMessage::ToolResponse(_)));
        }
        let next = tokio::time::timeout(Duration::from_millis(300), second.client.recv()).await;
        assert!(!matches!(next, Ok(Some(ClientMessage::ToolResponse(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_requires_ready_session() {
        let h = harness(false, true);
        let mut status = h.handle.status();
        status
            .wait_for(|s| matches!(s.state, SessionState::Errored(_)))
            .await
            .unwrap();

        h.handle.send(Command::StartRecording).await.unwrap();
        let status = status
            .wait_for(|s| s.message.as_deref().is_some_and(|m| m.starts_with("Cannot record")))
            .await
            .unwrap()
            .clone();
        assert!(!status.recording);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_waits_for_reset() {
        let h = harness(false, true);
        let mut status = h.handle.status();
        status
            .wait_for(|s| matches!(s.state, SessionState::Errored(_)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);

        h.handle.send(Command::Reset).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reason_is_terminal() {
        let mut h = harness(false, false);
        let session = h.sessions.recv().await.unwrap();
        wait_ready(&h.handle).await;

        session
            .server
            .send(Ok(ApiResponse::Closed {
                reason: Some("quota exceeded".to_string()),
            }))
            .await
            .unwrap();

        let mut status = h.handle.status();
        let status = status
            .wait_for(|s| matches!(s.state, SessionState::Closed(_)))
            .await
            .unwrap()
            .clone();
        assert_eq!(status.state, SessionState::Closed(Some("quota exceeded".to_string())));
        assert_eq!(status.message.as_deref(), Some("Session closed: quota exceeded"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);
    }
}
