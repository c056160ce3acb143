//! Wire envelope model for relay events.
//!
//! Both directions use the same shape: a JSON object
//! `{"event": {"<eventType>": {...fields...}}}`, optionally wrapped once as
//! `{"body": "<json-encoded inner object>"}` by intermediate transports.
//! The event type discriminator is the first key of the `event` object.
//!
//! Only the event types the relay itself acts on get typed views here;
//! everything else is carried as raw `serde_json::Value` and forwarded
//! verbatim to the upstream stream.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Event types the relay handles specially. All other types pass through.
pub const EVENT_POLLY_REQUEST: &str = "pollyRequest";
pub const EVENT_PROMPT_START: &str = "promptStart";
pub const EVENT_CONTENT_START: &str = "contentStart";
pub const EVENT_CONTENT_END: &str = "contentEnd";
pub const EVENT_TEXT_OUTPUT: &str = "textOutput";
pub const EVENT_AUDIO_INPUT: &str = "audioInput";

/// Errors raised while decoding a wire message into an [`Envelope`].
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Payload is not valid JSON
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// `body` wrapper present but not a JSON-encoded string
    #[error("\"body\" wrapper is not a JSON string")]
    InvalidBody,

    /// Top-level `event` object missing
    #[error("missing \"event\" object")]
    MissingEvent,

    /// `event` object carries no variant key
    #[error("empty \"event\" object")]
    EmptyEvent,
}

/// One wire message after `body` unwrapping, with its discriminator resolved.
///
/// Keeps the full original value so unrecognized event types can be relayed
/// to the upstream stream without re-encoding loss.
#[derive(Debug, Clone)]
pub struct Envelope {
    value: Value,
    event_type: String,
}

impl Envelope {
    /// Parse a raw text frame. A single `{"body": "<json>"}` wrapping layer
    /// is unwrapped before interpretation.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let mut value: Value = serde_json::from_str(text)?;
        if let Some(body) = value.get("body") {
            let inner = body.as_str().ok_or(EnvelopeError::InvalidBody)?;
            value = serde_json::from_str(inner)?;
        }
        Self::from_value(value)
    }

    /// Wrap an already-decoded JSON value (e.g. an upstream response).
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let event = value
            .get("event")
            .and_then(Value::as_object)
            .ok_or(EnvelopeError::MissingEvent)?;
        let event_type = event.keys().next().cloned().ok_or(EnvelopeError::EmptyEvent)?;
        Ok(Self { value, event_type })
    }

    /// The discriminator string, e.g. `"audioInput"`.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The variant-specific field set for this envelope's event type.
    pub fn fields(&self) -> &Value {
        &self.value["event"][&self.event_type]
    }

    /// Decode the variant fields into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        Ok(serde_json::from_value(self.fields().clone())?)
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

/// `pollyRequest` fields. Missing fields fall back to the demo defaults the
/// browser client relies on.
#[derive(Debug, Clone, Deserialize)]
pub struct PollyRequest {
    #[serde(default = "default_polly_text")]
    pub text: String,
    #[serde(default = "default_polly_voice")]
    pub voice: String,
}

impl Default for PollyRequest {
    fn default() -> Self {
        Self {
            text: default_polly_text(),
            voice: default_polly_voice(),
        }
    }
}

fn default_polly_text() -> String {
    "Hi, I'm a pirate".to_string()
}

fn default_polly_voice() -> String {
    "Matthew".to_string()
}

/// `promptStart` fields relevant to the relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptStart {
    pub prompt_name: String,
}

/// `contentStart` fields relevant to the relay and the conversation logger.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStart {
    /// Content type, e.g. `TEXT` or `AUDIO`
    #[serde(rename = "type", default)]
    pub content_type: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content_name: Option<String>,
    /// Loosely-structured metadata: a JSON-encoded string that may carry a
    /// `generationStage` field
    #[serde(default)]
    pub additional_model_fields: Option<String>,
}

/// `audioInput` fields: one base64-encoded PCM chunk bound to a prompt.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInput {
    pub prompt_name: String,
    pub content_name: String,
    /// Base64-encoded PCM16 audio
    pub content: String,
}

/// `textOutput` fields: one streamed text fragment for a content identifier.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOutput {
    #[serde(default)]
    pub content_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub stop_reason: String,
}

/// `contentEnd` fields. The content identifier arrives as `contentName`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentEnd {
    #[serde(rename = "type", default)]
    pub content_type: String,
    #[serde(default)]
    pub content_name: String,
}
