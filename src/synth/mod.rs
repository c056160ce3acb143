//! Speech-synthesis fallback adapter.
//!
//! Turns text into transport-ready audio via Amazon Polly's SynthesizeSpeech
//! API, independently of any upstream model session. Polly produces PCM16 at
//! 16 kHz; the adapter resamples to 24 kHz to match the primary model's
//! audio format and base64-encodes the result.
//!
//! The public entry point never raises: failures come back as a
//! `pollyError` envelope so a synthesis failure cannot abort the connection
//! that requested it. Callers forward whichever envelope they get.

use std::sync::atomic::{AtomicU64, Ordering};

use aws_config::{BehaviorVersion, Region};
use aws_sdk_polly::Client as PollyClient;
use aws_sdk_polly::types::{OutputFormat, VoiceId};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::audio::{ResampleError, pcm16_from_le_bytes, pcm16_to_le_bytes, resample_pcm16};

/// Sample rate requested from the synthesis service.
pub const SOURCE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of the primary model's audio format.
pub const TARGET_SAMPLE_RATE: u32 = 24_000;

/// Errors inside the synthesis pipeline. Converted to a `pollyError`
/// envelope at the adapter boundary, never surfaced to sessions directly.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("Polly API error: {0}")]
    Provider(String),

    #[error("Failed to read audio stream: {0}")]
    AudioStream(String),

    #[error(transparent)]
    Resample(#[from] ResampleError),
}

/// Stateless-per-call adapter around Amazon Polly.
///
/// The SDK client is initialized lazily from the default credential chain
/// (environment, credentials file, IAM role) on first use.
pub struct SpeechSynthesisAdapter {
    region: String,
    client: RwLock<Option<PollyClient>>,
    request_counter: AtomicU64,
}

impl SpeechSynthesisAdapter {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            client: RwLock::new(None),
            request_counter: AtomicU64::new(0),
        }
    }

    /// Build an adapter around a preconfigured client. Used by tests and by
    /// embedders that manage their own credential setup.
    pub fn with_client(region: impl Into<String>, client: PollyClient) -> Self {
        Self {
            region: region.into(),
            client: RwLock::new(Some(client)),
            request_counter: AtomicU64::new(0),
        }
    }

    async fn client(&self) -> PollyClient {
        if let Some(client) = self.client.read().await.clone() {
            return client;
        }
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .load()
            .await;
        let client = PollyClient::new(&config);
        *self.client.write().await = Some(client.clone());
        client
    }

    /// Synthesize `text` with the given voice and return a response
    /// envelope: `pollyAudioOutput` on success, `pollyError` on any failure.
    pub async fn synthesize(&self, text: &str, voice: &str) -> Value {
        let request_id = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let voice_id = normalize_voice_id(voice);

        info!(
            request_id = request_id,
            text_len = text.len(),
            voice = voice,
            voice_id = %voice_id,
            "Synthesizing speech with Amazon Polly"
        );

        match self.synthesize_speech(text, &voice_id, request_id).await {
            Ok(audio_base64) => audio_output_envelope(&audio_base64, voice, text),
            Err(e) => {
                error!(request_id = request_id, error = %e, "Speech synthesis failed");
                error_envelope(&e.to_string(), text)
            }
        }
    }

    async fn synthesize_speech(
        &self,
        text: &str,
        voice_id: &str,
        request_id: u64,
    ) -> Result<String, SynthesisError> {
        let client = self.client().await;

        let response = client
            .synthesize_speech()
            .text(text)
            .voice_id(VoiceId::from(voice_id))
            .output_format(OutputFormat::Pcm)
            .sample_rate(SOURCE_SAMPLE_RATE.to_string())
            .send()
            .await
            .map_err(|e| SynthesisError::Provider(e.to_string()))?;

        let audio = response
            .audio_stream
            .collect()
            .await
            .map_err(|e| SynthesisError::AudioStream(e.to_string()))?
            .into_bytes();

        debug!(
            request_id = request_id,
            audio_bytes = audio.len(),
            "Polly returned source-rate audio"
        );

        encode_resampled_pcm(&audio)
    }
}

/// Resample source-rate PCM16 bytes to the target rate and base64-encode.
fn encode_resampled_pcm(audio: &[u8]) -> Result<String, SynthesisError> {
    let samples = pcm16_from_le_bytes(audio);
    let resampled = resample_pcm16(&samples, SOURCE_SAMPLE_RATE, TARGET_SAMPLE_RATE)?;
    Ok(BASE64.encode(pcm16_to_le_bytes(&resampled)))
}

/// Title-case a voice name the way the synthesis service expects
/// (`matthew` -> `Matthew`, `JOANNA` -> `Joanna`).
pub fn normalize_voice_id(voice: &str) -> String {
    let mut normalized = String::with_capacity(voice.len());
    let mut at_word_start = true;
    for ch in voice.chars() {
        if ch.is_alphanumeric() {
            if at_word_start {
                normalized.extend(ch.to_uppercase());
            } else {
                normalized.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            normalized.push(ch);
            at_word_start = true;
        }
    }
    normalized
}

/// Success envelope carrying base64 PCM16 at the target rate.
pub fn audio_output_envelope(audio_base64: &str, voice: &str, text: &str) -> Value {
    json!({
        "event": {
            "pollyAudioOutput": {
                "content": audio_base64,
                "voice": voice,
                "text": text
            }
        }
    })
}

/// Failure envelope carrying the error message and the original text.
pub fn error_envelope(message: &str, text: &str) -> Value {
    json!({
        "event": {
            "pollyError": {
                "message": message,
                "text": text
            }
        }
    })
}
