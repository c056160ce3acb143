//! WebSocket transport for the upstream model stream.
//!
//! Generic JSON-over-WebSocket connector: client events are relayed
//! verbatim as text frames and every text frame received back is surfaced
//! through the response queue. Model-specific protocol handshakes belong to
//! the upstream service endpoint, not to this transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::upstream::{
    AudioChunk, ModelStream, ModelStreamFactory, StreamError, StreamResult,
};

/// Channel capacity for frames queued toward the upstream socket.
const WS_CHANNEL_CAPACITY: usize = 256;

/// Channel capacity for responses queued toward the forwarding task.
const RESPONSE_CHANNEL_CAPACITY: usize = 1024;

enum UpstreamFrame {
    Event(Value),
    Close,
}

/// Connects one WebSocket model stream per session.
pub struct WsModelStreamFactory {
    url: Option<String>,
    model_id: String,
    connect_timeout: Duration,
}

impl WsModelStreamFactory {
    pub fn new(url: Option<String>, model_id: String, connect_timeout: Duration) -> Self {
        Self {
            url,
            model_id,
            connect_timeout,
        }
    }
}

#[async_trait]
impl ModelStreamFactory for WsModelStreamFactory {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn connect(&self) -> StreamResult<Arc<dyn ModelStream>> {
        let url = self.url.as_deref().ok_or_else(|| {
            StreamError::ConnectionFailed("no upstream URL configured".to_string())
        })?;

        info!(url = url, model_id = %self.model_id, "Connecting upstream model stream");

        let connect = tokio_tungstenite::connect_async(url);
        let (socket, _response) = timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| StreamError::ConnectTimeout(self.connect_timeout))?
            .map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;

        Ok(Arc::new(WsModelStream::spawn(socket)))
    }
}

/// One live upstream WebSocket stream.
pub struct WsModelStream {
    outbound: mpsc::Sender<UpstreamFrame>,
    responses: Mutex<mpsc::Receiver<Value>>,
    closed: AtomicBool,
}

impl WsModelStream {
    fn spawn(
        socket: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Self {
        let (mut ws_sink, mut ws_stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<UpstreamFrame>(WS_CHANNEL_CAPACITY);
        let (response_tx, response_rx) = mpsc::channel::<Value>(RESPONSE_CHANNEL_CAPACITY);

        // Writer: drains the outbound queue onto the socket.
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let result = match frame {
                    UpstreamFrame::Event(event) => match serde_json::to_string(&event) {
                        Ok(json) => ws_sink.send(Message::Text(json.into())).await,
                        Err(e) => {
                            warn!("Failed to serialize upstream event: {e}");
                            continue;
                        }
                    },
                    UpstreamFrame::Close => {
                        debug!("Closing upstream WebSocket");
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!("Upstream WebSocket send failed: {e}");
                    break;
                }
            }
        });

        // Reader: surfaces every decodable text frame as a response.
        // Dropping response_tx ends the forwarding task's queue.
        tokio::spawn(async move {
            while let Some(frame) = ws_stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(event) => {
                            if response_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping undecodable upstream frame: {e}"),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("Upstream WebSocket closed by peer");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Upstream WebSocket read failed: {e}");
                        break;
                    }
                }
            }
        });

        Self {
            outbound: outbound_tx,
            responses: Mutex::new(response_rx),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ModelStream for WsModelStream {
    async fn send_event(&self, event: &Value) -> StreamResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        self.outbound
            .send(UpstreamFrame::Event(event.clone()))
            .await
            .map_err(|_| StreamError::Closed)
    }

    async fn send_audio(&self, chunk: AudioChunk) -> StreamResult<()> {
        let event = json!({
            "event": {
                "audioInput": {
                    "promptName": chunk.prompt_name,
                    "contentName": chunk.content_name,
                    "content": chunk.content
                }
            }
        });
        self.send_event(&event).await
    }

    async fn next_response(&self) -> Option<Value> {
        self.responses.lock().await.recv().await
    }

    async fn close(&self) -> StreamResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Best effort: the writer task may already be gone.
        let _ = self.outbound.send(UpstreamFrame::Close).await;
        Ok(())
    }
}
