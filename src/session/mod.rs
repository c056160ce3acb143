//! Relay WebSocket session
//!
//! One [`ConnectionSession`] per client WebSocket connection. The session
//! routes client events: text-to-speech requests are serviced locally, audio
//! chunks are queued toward the upstream model stream, and everything else
//! is relayed verbatim. Upstream responses flow back through a dedicated
//! forwarding task in production order.
//!
//! The upstream stream is bound lazily on the first event that needs it and
//! lives for the rest of the session; a session never reconnects.

pub mod upstream;
pub mod ws_upstream;

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{
    AudioInput, ContentStart, Envelope, EVENT_AUDIO_INPUT, EVENT_CONTENT_START,
    EVENT_POLLY_REQUEST, EVENT_PROMPT_START, PollyRequest, PromptStart,
};
use crate::logger::ConversationLogger;
use crate::state::AppState;

use self::upstream::{AudioChunk, ModelStream, SessionCollaborator, StreamError};

/// Channel buffer size for outbound client messages.
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Capacity of the per-session audio queue. Queued chunks decouple client
/// ingestion from upstream send pacing; order is preserved.
const AUDIO_QUEUE_CAPACITY: usize = 1024;

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Messages routed to the client-facing sender task.
enum OutboundRoute {
    Event(Value),
    Close,
}

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    /// No upstream stream yet; TTS-only traffic stays here
    Idle,
    /// Upstream stream being established
    StreamInitializing,
    /// Upstream stream live, relay in both directions
    Active,
    /// Teardown in progress
    Closing,
    Closed,
}

/// Per-message processing errors.
#[derive(Debug, Error)]
enum SessionError {
    /// Upstream stream failure; the message is dropped, the session survives
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The client-facing channel is gone; the session must end
    #[error("Client connection gone")]
    ClientGone,
}

/// Relay WebSocket handler
///
/// Upgrades the HTTP connection to WebSocket. Each accepted connection gets
/// its own [`ConnectionSession`].
pub async fn relay_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    info!("Relay WebSocket connection upgrade requested");

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_relay_socket(socket, state))
}

/// Drive one relay WebSocket connection to completion.
async fn handle_relay_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundRoute>(CHANNEL_BUFFER_SIZE);

    // Sender task for outgoing messages
    let sender_task = tokio::spawn(async move {
        while let Some(route) = outbound_rx.recv().await {
            let result = match route {
                OutboundRoute::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => sender.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!("Failed to serialize outgoing event: {e}");
                        continue;
                    }
                },
                OutboundRoute::Close => {
                    info!("Closing relay WebSocket connection");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };

            if let Err(e) = result {
                error!("Failed to send WebSocket message: {e}");
                break;
            }
        }
    });

    let mut session = ConnectionSession::new(state, outbound_tx);
    info!(session_id = %session.id, "Relay session established");
    session.logger.record_session_start();

    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if !session.process_text(&text).await {
                    break;
                }
            }
            Ok(Message::Binary(data)) => {
                debug!(session_id = %session.id, "Ignoring binary frame ({} bytes)", data.len());
            }
            Ok(Message::Close(_)) => {
                info!(session_id = %session.id, "Relay WebSocket closed by client");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(session_id = %session.id, "Relay WebSocket error: {e}");
                break;
            }
        }
    }

    session.close().await;
    let _ = sender_task.await;
    info!(session_id = %session.id, "Relay session terminated");
}

/// State and tasks for one relay session.
struct ConnectionSession {
    id: String,
    phase: SessionPhase,
    state: Arc<AppState>,
    outbound: mpsc::Sender<OutboundRoute>,
    logger: Arc<ConversationLogger>,
    upstream: Option<Arc<dyn ModelStream>>,
    forward_task: Option<JoinHandle<()>>,
    audio_task: Option<JoinHandle<()>>,
    audio_tx: Option<mpsc::Sender<AudioChunk>>,
    cancel: CancellationToken,
    /// Prompt name from the most recent `promptStart`
    prompt_name: Option<String>,
    /// Content name of the active audio input stream
    audio_content_name: Option<String>,
    collaborators: Vec<Arc<dyn SessionCollaborator>>,
}

impl ConnectionSession {
    fn new(state: Arc<AppState>, outbound: mpsc::Sender<OutboundRoute>) -> Self {
        let id = Uuid::new_v4().to_string();
        let logger = Arc::new(ConversationLogger::new(state.log_sink.clone(), id.clone()));

        Self {
            id,
            phase: SessionPhase::Idle,
            state,
            outbound,
            logger,
            upstream: None,
            forward_task: None,
            audio_task: None,
            audio_tx: None,
            cancel: CancellationToken::new(),
            prompt_name: None,
            audio_content_name: None,
            collaborators: Vec::new(),
        }
    }

    /// Process one text frame. Returns `false` when the session must end.
    async fn process_text(&mut self, text: &str) -> bool {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session_id = %self.id, "Dropping malformed message: {e}");
                return true;
            }
        };

        match self.route_event(envelope).await {
            Ok(()) => true,
            Err(SessionError::Stream(e)) => {
                warn!(session_id = %self.id, "Upstream error, message dropped: {e}");
                true
            }
            Err(SessionError::ClientGone) => {
                warn!(session_id = %self.id, "Client channel closed");
                false
            }
        }
    }

    async fn route_event(&mut self, envelope: Envelope) -> Result<(), SessionError> {
        // TTS requests are serviced locally: no upstream stream, no session
        // bookkeeping, no conversation logging.
        if envelope.event_type() == EVENT_POLLY_REQUEST {
            return self.handle_polly_request(&envelope).await;
        }

        self.logger.record_event(envelope.as_value());
        self.ensure_upstream().await?;

        match envelope.event_type() {
            EVENT_PROMPT_START => {
                if let Ok(prompt) = envelope.decode::<PromptStart>() {
                    debug!(session_id = %self.id, prompt_name = %prompt.prompt_name, "Prompt started");
                    self.prompt_name = Some(prompt.prompt_name);
                }
                self.forward(envelope.as_value()).await
            }
            EVENT_CONTENT_START => {
                if let Ok(start) = envelope.decode::<ContentStart>()
                    && start.content_type == "AUDIO"
                    && let Some(name) = start.content_name
                {
                    debug!(session_id = %self.id, content_name = %name, "Audio content started");
                    self.audio_content_name = Some(name);
                }
                self.forward(envelope.as_value()).await
            }
            EVENT_AUDIO_INPUT => self.enqueue_audio(&envelope).await,
            _ => self.forward(envelope.as_value()).await,
        }
    }

    /// Service a `pollyRequest` locally via the speech synthesis adapter.
    async fn handle_polly_request(&self, envelope: &Envelope) -> Result<(), SessionError> {
        let request: PollyRequest = envelope.decode().unwrap_or_default();
        let response = self
            .state
            .synth
            .synthesize(&request.text, &request.voice)
            .await;

        self.outbound
            .send(OutboundRoute::Event(response))
            .await
            .map_err(|_| SessionError::ClientGone)
    }

    /// Queue one audio chunk onto the per-session FIFO. Chunks are never
    /// sent inline; the pump task preserves arrival order.
    async fn enqueue_audio(&mut self, envelope: &Envelope) -> Result<(), SessionError> {
        let audio: AudioInput = match envelope.decode() {
            Ok(audio) => audio,
            Err(e) => {
                warn!(session_id = %self.id, "Dropping malformed audioInput: {e}");
                return Ok(());
            }
        };

        let chunk = AudioChunk {
            prompt_name: audio.prompt_name,
            content_name: audio.content_name,
            content: audio.content,
        };

        let audio_tx = self.audio_tx.as_ref().ok_or(StreamError::Closed)?;
        audio_tx
            .send(chunk)
            .await
            .map_err(|_| StreamError::Closed)?;
        Ok(())
    }

    async fn forward(&self, event: &Value) -> Result<(), SessionError> {
        let stream = self.upstream.as_ref().ok_or(StreamError::Closed)?;
        stream.send_event(event).await?;
        Ok(())
    }

    /// Bind the upstream stream on first use. Idempotent; at most one
    /// stream exists per session for its entire lifetime.
    async fn ensure_upstream(&mut self) -> Result<(), SessionError> {
        if self.upstream.is_some() {
            return Ok(());
        }

        self.phase = SessionPhase::StreamInitializing;
        info!(
            session_id = %self.id,
            model_id = self.state.stream_factory.model_id(),
            "Binding upstream model stream"
        );

        let stream = match self.state.stream_factory.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                self.phase = SessionPhase::Idle;
                return Err(e.into());
            }
        };

        let (audio_tx, audio_rx) = mpsc::channel::<AudioChunk>(AUDIO_QUEUE_CAPACITY);
        self.audio_task = Some(tokio::spawn(pump_audio(
            audio_rx,
            stream.clone(),
            self.cancel.child_token(),
        )));
        self.forward_task = Some(tokio::spawn(forward_responses(
            stream.clone(),
            self.outbound.clone(),
            self.logger.clone(),
            self.cancel.child_token(),
        )));

        self.audio_tx = Some(audio_tx);
        self.upstream = Some(stream);
        self.phase = SessionPhase::Active;
        Ok(())
    }

    /// Tear the session down. Four isolated steps in order; a failure in
    /// one step never prevents the following steps from running.
    async fn close(&mut self) {
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return;
        }
        self.phase = SessionPhase::Closing;
        debug!(session_id = %self.id, "Closing relay session");

        // Step 1: close the upstream stream.
        if let Some(stream) = self.upstream.take()
            && let Err(e) = stream.close().await
        {
            warn!(session_id = %self.id, "Failed to close upstream stream: {e}");
        }

        // Step 2: cancel and await the relay tasks.
        self.cancel.cancel();
        self.audio_tx.take();
        if let Some(task) = self.audio_task.take()
            && let Err(e) = task.await
        {
            warn!(session_id = %self.id, "Audio pump task failed: {e}");
        }
        if let Some(task) = self.forward_task.take()
            && let Err(e) = task.await
        {
            warn!(session_id = %self.id, "Forwarding task failed: {e}");
        }

        // Step 3: close the client connection.
        if self.outbound.send(OutboundRoute::Close).await.is_err() {
            debug!(session_id = %self.id, "Client connection already gone");
        }

        // Step 4: release session collaborators.
        for collaborator in self.collaborators.drain(..) {
            debug!(session_id = %self.id, collaborator = collaborator.name(), "Releasing collaborator");
            collaborator.release().await;
        }

        self.logger.record_session_end();
        self.phase = SessionPhase::Closed;
    }

    #[cfg(test)]
    fn prompt_name(&self) -> Option<&str> {
        self.prompt_name.as_deref()
    }

    #[cfg(test)]
    fn audio_content_name(&self) -> Option<&str> {
        self.audio_content_name.as_deref()
    }
}

/// Forward upstream responses to the client in production order. A `None`
/// from the stream is a normal end, not an error.
async fn forward_responses(
    stream: Arc<dyn ModelStream>,
    outbound: mpsc::Sender<OutboundRoute>,
    logger: Arc<ConversationLogger>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Forwarding task cancelled");
                break;
            }
            response = stream.next_response() => {
                match response {
                    Some(event) => {
                        logger.record_event(&event);
                        if outbound.send(OutboundRoute::Event(event)).await.is_err() {
                            debug!("Client gone, stopping forwarding task");
                            break;
                        }
                    }
                    None => {
                        debug!("Upstream stream ended");
                        break;
                    }
                }
            }
        }
    }
}

/// Drain the session audio queue into the upstream stream, preserving FIFO
/// order.
async fn pump_audio(
    mut audio_rx: mpsc::Receiver<AudioChunk>,
    stream: Arc<dyn ModelStream>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = audio_rx.recv() => {
                match chunk {
                    Some(chunk) => {
                        if let Err(e) = stream.send_audio(chunk).await {
                            warn!("Failed to send audio chunk upstream: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use super::upstream::{ModelStreamFactory, StreamResult};

    struct MockModelStream {
        events: parking_lot::Mutex<Vec<Value>>,
        audio: parking_lot::Mutex<Vec<AudioChunk>>,
        closed: AtomicBool,
        responses: tokio::sync::Mutex<mpsc::Receiver<Value>>,
    }

    impl MockModelStream {
        fn pair() -> (Arc<Self>, mpsc::Sender<Value>) {
            let (tx, rx) = mpsc::channel(64);
            let stream = Arc::new(Self {
                events: parking_lot::Mutex::new(Vec::new()),
                audio: parking_lot::Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                responses: tokio::sync::Mutex::new(rx),
            });
            (stream, tx)
        }
    }

    #[async_trait]
    impl ModelStream for MockModelStream {
        async fn send_event(&self, event: &Value) -> StreamResult<()> {
            self.events.lock().push(event.clone());
            Ok(())
        }

        async fn send_audio(&self, chunk: AudioChunk) -> StreamResult<()> {
            self.audio.lock().push(chunk);
            Ok(())
        }

        async fn next_response(&self) -> Option<Value> {
            self.responses.lock().await.recv().await
        }

        async fn close(&self) -> StreamResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockFactory {
        stream: Arc<MockModelStream>,
        connects: AtomicUsize,
    }

    impl MockFactory {
        fn new(stream: Arc<MockModelStream>) -> Arc<Self> {
            Arc::new(Self {
                stream,
                connects: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelStreamFactory for MockFactory {
        fn model_id(&self) -> &str {
            "mock-model"
        }

        async fn connect(&self) -> StreamResult<Arc<dyn ModelStream>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.stream.clone())
        }
    }

    struct ReleaseProbe {
        released: AtomicBool,
    }

    #[async_trait]
    impl SessionCollaborator for ReleaseProbe {
        fn name(&self) -> &str {
            "release-probe"
        }

        async fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// Polly client pointed at a closed local port: synthesize calls fail
    /// fast without touching credentials or the network.
    fn offline_polly_client() -> aws_sdk_polly::Client {
        let config = aws_sdk_polly::Config::builder()
            .behavior_version(aws_sdk_polly::config::BehaviorVersion::latest())
            .region(aws_sdk_polly::config::Region::new("us-east-1"))
            .credentials_provider(aws_credential_types::Credentials::new(
                "akid", "secret", None, None, "test",
            ))
            .endpoint_url("http://127.0.0.1:1")
            .build();
        aws_sdk_polly::Client::from_conf(config)
    }

    fn test_state(factory: Arc<dyn ModelStreamFactory>) -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let log_path = dir.path().join("conversation.log");
        let config = crate::config::ServerConfig {
            conversation_log_path: log_path.clone(),
            ..Default::default()
        };
        let state = AppState::with_parts(
            config,
            crate::synth::SpeechSynthesisAdapter::with_client("us-east-1", offline_polly_client()),
            Arc::new(crate::logger::LogSink::new(log_path)),
            factory,
        );
        (state, dir)
    }

    fn test_session(
        state: Arc<AppState>,
    ) -> (ConnectionSession, mpsc::Receiver<OutboundRoute>) {
        let (tx, rx) = mpsc::channel(64);
        (ConnectionSession::new(state, tx), rx)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("Condition not reached in time");
    }

    fn audio_input_event(content: &str) -> String {
        json!({
            "event": {
                "audioInput": {
                    "promptName": "p1",
                    "contentName": "a1",
                    "content": content
                }
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_audio_chunks_reach_upstream_in_order() {
        let (mock, _response_tx) = MockModelStream::pair();
        let (state, _dir) = test_state(MockFactory::new(mock.clone()));
        let (mut session, _rx) = test_session(state);

        for content in ["chunk-1", "chunk-2", "chunk-3"] {
            assert!(session.process_text(&audio_input_event(content)).await);
        }

        wait_for(|| mock.audio.lock().len() == 3).await;
        let audio = mock.audio.lock();
        let contents: Vec<&str> = audio.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["chunk-1", "chunk-2", "chunk-3"]);

        // Audio travels through the queue only, never as a forwarded event.
        assert!(mock.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_event_forwarded_verbatim() {
        let (mock, _response_tx) = MockModelStream::pair();
        let (state, _dir) = test_state(MockFactory::new(mock.clone()));
        let (mut session, _rx) = test_session(state);

        let raw = r#"{"event":{"sessionStart":{"inferenceConfiguration":{"maxTokens":1024}}}}"#;
        assert!(session.process_text(raw).await);

        wait_for(|| !mock.events.lock().is_empty()).await;
        let expected: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(mock.events.lock()[0], expected);
    }

    #[tokio::test]
    async fn test_prompt_and_audio_content_bookkeeping() {
        let (mock, _response_tx) = MockModelStream::pair();
        let (state, _dir) = test_state(MockFactory::new(mock.clone()));
        let (mut session, _rx) = test_session(state);

        let prompt = json!({"event": {"promptStart": {"promptName": "p1"}}}).to_string();
        assert!(session.process_text(&prompt).await);
        assert_eq!(session.prompt_name(), Some("p1"));

        let text_start = json!({
            "event": {"contentStart": {"type": "TEXT", "contentName": "t1"}}
        })
        .to_string();
        assert!(session.process_text(&text_start).await);
        assert_eq!(session.audio_content_name(), None);

        let audio_start = json!({
            "event": {"contentStart": {"type": "AUDIO", "contentName": "a1"}}
        })
        .to_string();
        assert!(session.process_text(&audio_start).await);
        assert_eq!(session.audio_content_name(), Some("a1"));

        // Both contentStart events were relayed upstream alongside promptStart.
        wait_for(|| mock.events.lock().len() == 3).await;
    }

    #[tokio::test]
    async fn test_upstream_bound_once() {
        let (mock, _response_tx) = MockModelStream::pair();
        let factory = MockFactory::new(mock.clone());
        let (state, _dir) = test_state(factory.clone());
        let (mut session, _rx) = test_session(state);

        for _ in 0..3 {
            assert!(session.process_text(&audio_input_event("x")).await);
        }
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
        assert_eq!(session.phase, SessionPhase::Active);
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_session_alive() {
        let (mock, _response_tx) = MockModelStream::pair();
        let factory = MockFactory::new(mock.clone());
        let (state, _dir) = test_state(factory.clone());
        let (mut session, _rx) = test_session(state);

        assert!(session.process_text("not json").await);
        assert!(session.process_text(r#"{"event":{}}"#).await);

        // Malformed traffic never triggers the upstream bind.
        assert_eq!(factory.connects.load(Ordering::SeqCst), 0);
        assert_eq!(session.phase, SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_upstream_response_forwarded_and_logged() {
        let (mock, response_tx) = MockModelStream::pair();
        let (state, _dir) = test_state(MockFactory::new(mock.clone()));
        let log_path = state.config.conversation_log_path.clone();
        let (mut session, mut rx) = test_session(state);

        // Any relayed event binds the upstream stream and starts forwarding.
        assert!(session.process_text(&audio_input_event("x")).await);

        response_tx
            .send(json!({
                "event": {
                    "textOutput": {
                        "contentId": "c1",
                        "content": "Hello from the model",
                        "role": "ASSISTANT"
                    }
                }
            }))
            .await
            .expect("Should queue response");
        response_tx
            .send(json!({
                "event": {"contentEnd": {"type": "TEXT", "contentName": "c1"}}
            }))
            .await
            .expect("Should queue response");

        let routed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Should forward in time")
            .expect("Channel open");
        match routed {
            OutboundRoute::Event(event) => {
                assert_eq!(
                    event["event"]["textOutput"]["content"],
                    "Hello from the model"
                );
            }
            OutboundRoute::Close => panic!("Unexpected close"),
        }

        // The forwarding task routed the textOutput through the logger.
        wait_for(|| {
            std::fs::read_to_string(&log_path)
                .map(|s| s.contains("Hello from the model"))
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn test_polly_request_bypasses_upstream_and_logging() {
        let (mock, _response_tx) = MockModelStream::pair();
        let factory = MockFactory::new(mock.clone());
        let (state, _dir) = test_state(factory.clone());
        let log_path = state.config.conversation_log_path.clone();
        let (mut session, mut rx) = test_session(state);

        let request = json!({
            "event": {"pollyRequest": {"text": "Ahoy", "voice": "matthew"}}
        })
        .to_string();
        assert!(session.process_text(&request).await);

        // The offline client cannot reach Polly, so the adapter answers
        // with its error envelope instead of raising.
        let routed = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("Should respond in time")
            .expect("Channel open");
        match routed {
            OutboundRoute::Event(event) => {
                assert!(event["event"]["pollyError"].is_object());
                assert_eq!(event["event"]["pollyError"]["text"], "Ahoy");
            }
            OutboundRoute::Close => panic!("Unexpected close"),
        }

        // TTS traffic has no session side effects.
        assert_eq!(factory.connects.load(Ordering::SeqCst), 0);
        assert_eq!(session.phase, SessionPhase::Idle);
        assert!(
            std::fs::read_to_string(&log_path)
                .map(|s| !s.contains("Ahoy"))
                .unwrap_or(true)
        );
    }

    #[tokio::test]
    async fn test_close_runs_all_steps() {
        let (mock, _response_tx) = MockModelStream::pair();
        let (state, _dir) = test_state(MockFactory::new(mock.clone()));
        let log_path = state.config.conversation_log_path.clone();
        let (mut session, mut rx) = test_session(state);

        let probe = Arc::new(ReleaseProbe {
            released: AtomicBool::new(false),
        });
        session.collaborators.push(probe.clone());
        session.logger.record_session_start();

        assert!(session.process_text(&audio_input_event("x")).await);
        session.close().await;

        assert!(mock.closed.load(Ordering::SeqCst));
        assert!(probe.released.load(Ordering::SeqCst));
        assert_eq!(session.phase, SessionPhase::Closed);

        // Drain the outbound channel; the last route must be the close.
        let mut saw_close = false;
        while let Ok(route) = rx.try_recv() {
            saw_close = matches!(route, OutboundRoute::Close);
        }
        assert!(saw_close);

        let log = std::fs::read_to_string(&log_path).expect("Log should exist");
        assert!(log.contains("[SESSION_END]"));

        // close() is idempotent.
        session.close().await;
        assert_eq!(session.phase, SessionPhase::Closed);
    }
}
