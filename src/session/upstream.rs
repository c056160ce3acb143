//! Seam between the relay and the upstream speech-to-speech model stream.
//!
//! The upstream wire protocol is an external collaborator: the session only
//! relays events through this trait and drains its response queue. One
//! stream is created per session by a [`ModelStreamFactory`] and lives for
//! the rest of that session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur on the upstream stream boundary.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Establishing the stream failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Establishing the stream exceeded the configured bound
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The stream has ended and can no longer accept events
    #[error("Stream closed")]
    Closed,

    /// Sending one event failed
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Result type for upstream stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// One audio chunk queued for delivery to the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub prompt_name: String,
    pub content_name: String,
    /// Base64-encoded PCM16 audio
    pub content: String,
}

/// Handle to one active bidirectional model stream.
#[async_trait]
pub trait ModelStream: Send + Sync {
    /// Forward one client event verbatim.
    async fn send_event(&self, event: &Value) -> StreamResult<()>;

    /// Deliver one queued audio chunk.
    async fn send_audio(&self, chunk: AudioChunk) -> StreamResult<()>;

    /// Next response produced by the model, in production order. Returns
    /// `None` once the stream has ended.
    async fn next_response(&self) -> Option<Value>;

    /// Ask the stream to shut down. Idempotent.
    async fn close(&self) -> StreamResult<()>;
}

/// Creates one initialized model stream per session.
#[async_trait]
pub trait ModelStreamFactory: Send + Sync {
    /// Model identifier requested from the upstream service.
    fn model_id(&self) -> &str;

    async fn connect(&self) -> StreamResult<Arc<dyn ModelStream>>;
}

/// A session-scoped external collaborator (e.g. an agent or tool client)
/// whose resources must be released when the session closes.
#[async_trait]
pub trait SessionCollaborator: Send + Sync {
    fn name(&self) -> &str;

    /// Release held resources. Called exactly once during session close;
    /// must absorb its own failures.
    async fn release(&self);
}
