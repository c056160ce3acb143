//! Shared application state

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::logger::LogSink;
use crate::session::upstream::ModelStreamFactory;
use crate::session::ws_upstream::WsModelStreamFactory;
use crate::synth::SpeechSynthesisAdapter;

/// State shared across all handlers and sessions.
pub struct AppState {
    pub config: ServerConfig,
    /// Text-to-speech adapter, shared so the lazy Polly client is
    /// initialized once per process.
    pub synth: SpeechSynthesisAdapter,
    /// Append target shared by every session logging to the same file.
    pub log_sink: Arc<LogSink>,
    /// Creates one upstream model stream per session.
    pub stream_factory: Arc<dyn ModelStreamFactory>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let synth = SpeechSynthesisAdapter::new(config.aws_region.clone());
        let log_sink = Arc::new(LogSink::new(config.conversation_log_path.clone()));
        let stream_factory = Arc::new(WsModelStreamFactory::new(
            config.upstream_url.clone(),
            config.model_id.clone(),
            config.upstream_connect_timeout(),
        ));

        Arc::new(Self {
            config,
            synth,
            log_sink,
            stream_factory,
        })
    }

    /// Assemble state from preconstructed parts. Used by tests to inject
    /// mock stream factories and temp log files.
    pub fn with_parts(
        config: ServerConfig,
        synth: SpeechSynthesisAdapter,
        log_sink: Arc<LogSink>,
        stream_factory: Arc<dyn ModelStreamFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            synth,
            log_sink,
            stream_factory,
        })
    }
}
