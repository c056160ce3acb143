//! Conversation event logger.
//!
//! Observes the textual events flowing through a relay session (in both
//! directions), writes a human-readable audit trail with role and
//! generation-stage annotation, and reconstructs the most recent session's
//! chat history from that trail.
//!
//! Two pieces with different lifetimes:
//!
//! - [`LogSink`]: the shared append target. One instance per log path,
//!   shared by every session; all writes and reads serialize on its lock
//!   and every write is flushed immediately. This is an audit trail, not a
//!   high-rate log.
//! - [`ConversationLogger`]: per-session state. Tracks streamed text
//!   fragments by content identifier and the sticky generation stage, both
//!   scoped to one session so interleaved sessions cannot cross-talk.
//!
//! Alongside each human-readable line the sink appends a structured JSON
//! record to `<path>.jsonl` with the same lock and flush discipline. The
//! sidecar is an audit artifact; history reconstruction parses the
//! human-readable log.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::{
    ContentEnd, ContentStart, EVENT_CONTENT_END, EVENT_CONTENT_START, EVENT_TEXT_OUTPUT, TextOutput,
};

/// Most recent messages returned by history reconstruction.
pub const HISTORY_LIMIT: usize = 10;

/// A text fragment is logged only when its trimmed length exceeds this,
/// which keeps empty and near-empty speculative fragments out of the trail.
pub const MIN_LOGGED_CONTENT_CHARS: usize = 5;

/// Stop reasons that mark a fragment as final when no explicit generation
/// stage was recorded for its content identifier.
const TERMINAL_STOP_REASONS: [&str; 3] = ["END_TURN", "STOP_SEQUENCE", "MAX_TOKENS"];

const SESSION_START_MARKER: &str = "[SESSION_START]";
const SESSION_END_MARKER: &str = "[SESSION_END]";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors raised by the log sink. Callers absorb these as non-fatal: a
/// failed append or read never terminates a session.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("structured record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LogError {
    /// I/O failures may clear up (disk pressure, transient permissions);
    /// serialization failures will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LogError::Io(_))
    }
}

/// Speaker role attached to a tracked content entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
    Unknown,
}

impl Role {
    pub fn parse(value: &str) -> Self {
        match value {
            "USER" => Role::User,
            "ASSISTANT" => Role::Assistant,
            "SYSTEM" => Role::System,
            "TOOL" => Role::Tool,
            _ => Role::Unknown,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::System => "SYSTEM",
            Role::Tool => "TOOL",
            Role::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// One reconstructed chat message. Only USER, ASSISTANT and SYSTEM lines are
/// retained by reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Structured sidecar record, one JSON object per line.
#[derive(Serialize)]
struct StructuredRecord<'a> {
    ts: &'a str,
    session: &'a str,
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
}

// =============================================================================
// Log Sink
// =============================================================================

/// Mutex-guarded append target shared by all sessions logging to one path.
pub struct LogSink {
    path: PathBuf,
    sidecar_path: PathBuf,
    lock: Mutex<()>,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut sidecar = path.clone().into_os_string();
        sidecar.push(".jsonl");
        Self {
            path,
            sidecar_path: PathBuf::from(sidecar),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one annotated message line.
    pub fn append_message(
        &self,
        session_id: &str,
        role: Role,
        stage: &str,
        content: &str,
    ) -> Result<(), LogError> {
        let ts = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let line = format!("{ts} [{role}] [{stage}]: {content}\n");
        let record = StructuredRecord {
            ts: &ts,
            session: session_id,
            kind: "message",
            role: Some(role.as_tag()),
            stage: Some(stage),
            content: Some(content),
        };
        self.append(&line, &record)
    }

    /// Append a session-start boundary, preceded by a blank line for
    /// readability.
    pub fn append_session_start(&self, session_id: &str) -> Result<(), LogError> {
        let ts = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let line = format!("\n{ts} {SESSION_START_MARKER} New conversation session started\n");
        let record = StructuredRecord {
            ts: &ts,
            session: session_id,
            kind: "session_start",
            role: None,
            stage: None,
            content: None,
        };
        self.append(&line, &record)
    }

    /// Append a session-end boundary.
    pub fn append_session_end(&self, session_id: &str) -> Result<(), LogError> {
        let ts = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let line = format!("{ts} {SESSION_END_MARKER} Conversation session ended\n");
        let record = StructuredRecord {
            ts: &ts,
            session: session_id,
            kind: "session_end",
            role: None,
            stage: None,
            content: None,
        };
        self.append(&line, &record)
    }

    fn append(&self, line: &str, record: &StructuredRecord<'_>) -> Result<(), LogError> {
        let json = serde_json::to_string(record)?;
        let _guard = self.lock.lock();

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        let mut sidecar = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.sidecar_path)?;
        sidecar.write_all(json.as_bytes())?;
        sidecar.write_all(b"\n")?;
        sidecar.flush()?;

        Ok(())
    }

    /// Reconstruct the chat history of the most recent session from the
    /// human-readable log.
    ///
    /// Lines are scanned in reverse: the most recently closed session, or
    /// the open tail if the log does not end with a boundary. Unparseable
    /// lines are skipped. Results come back in chronological order,
    /// deduplicated by exact content (first occurrence wins) and capped at
    /// the most recent [`HISTORY_LIMIT`] messages. Missing files and logs
    /// without a matching session yield an empty history.
    pub fn reconstruct_last_session_history(&self) -> Vec<ChatMessage> {
        let _guard = self.lock.lock();

        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %self.path.display(), "No conversation log to reconstruct: {e}");
                return Vec::new();
            }
        };

        let mut collected: Vec<ChatMessage> = Vec::new();
        let mut boundaries = 0;
        for line in text.lines().rev() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.contains(SESSION_START_MARKER) || line.contains(SESSION_END_MARKER) {
                if !collected.is_empty() {
                    break;
                }
                boundaries += 1;
                if boundaries == 2 {
                    break;
                }
                continue;
            }
            if let Some(message) = parse_history_line(line) {
                collected.push(message);
            }
        }

        collected.reverse();

        let mut seen = HashSet::new();
        collected.retain(|message| seen.insert(message.content.clone()));

        if collected.len() > HISTORY_LIMIT {
            collected.drain(..collected.len() - HISTORY_LIMIT);
        }
        collected
    }
}

/// Parse one log line back into a chat message by locating the role-bracket
/// token and the `": "` delimiter that separates tags from text.
fn parse_history_line(line: &str) -> Option<ChatMessage> {
    let open = line.find('[')?;
    let close = open + line[open..].find(']')?;
    let role = match &line[open + 1..close] {
        "USER" => Role::User,
        "ASSISTANT" => Role::Assistant,
        "SYSTEM" => Role::System,
        _ => return None,
    };
    let rest = &line[close + 1..];
    let sep = rest.find(": ")?;
    let content = rest[sep + 2..].trim();
    if content.is_empty() {
        return None;
    }
    Some(ChatMessage {
        role,
        content: content.to_string(),
    })
}

// =============================================================================
// Conversation Logger
// =============================================================================

struct ContentTrackEntry {
    role: Role,
    /// Stage captured from the session's sticky state when this identifier
    /// was first seen. Never updated afterwards.
    generation_stage: String,
    content: String,
    /// Set on the matching `contentEnd`. Informational only, preserved for
    /// compatibility with downstream log consumers.
    logged: bool,
}

#[derive(Default)]
struct TrackerState {
    entries: HashMap<String, ContentTrackEntry>,
    /// Sticky stage from the most recent TEXT `contentStart`. Copied into
    /// entries at creation time only.
    current_generation_stage: String,
}

/// Per-session conversation logger.
///
/// `record_event` takes `&self`; the tracker sits behind a mutex so the
/// inbound router and the response-forwarding task can share one instance.
pub struct ConversationLogger {
    sink: Arc<LogSink>,
    session_id: String,
    tracker: Mutex<TrackerState>,
}

impl ConversationLogger {
    pub fn new(sink: Arc<LogSink>, session_id: impl Into<String>) -> Self {
        Self {
            sink,
            session_id: session_id.into(),
            tracker: Mutex::new(TrackerState::default()),
        }
    }

    pub fn sink(&self) -> &Arc<LogSink> {
        &self.sink
    }

    /// Observe one event. Only `contentStart`, `textOutput` and `contentEnd`
    /// affect logger state; everything else is ignored.
    pub fn record_event(&self, event: &Value) {
        let Some(object) = event.get("event").and_then(Value::as_object) else {
            return;
        };
        let Some((event_type, fields)) = object.iter().next() else {
            return;
        };

        match event_type.as_str() {
            EVENT_CONTENT_START => self.on_content_start(fields),
            EVENT_TEXT_OUTPUT => self.on_text_output(fields),
            EVENT_CONTENT_END => self.on_content_end(fields),
            _ => {}
        }
    }

    pub fn record_session_start(&self) {
        if let Err(e) = self.sink.append_session_start(&self.session_id) {
            warn!(session_id = %self.session_id, retryable = e.is_retryable(), "Failed to log session start: {e}");
        }
    }

    pub fn record_session_end(&self) {
        if let Err(e) = self.sink.append_session_end(&self.session_id) {
            warn!(session_id = %self.session_id, retryable = e.is_retryable(), "Failed to log session end: {e}");
        }
    }

    fn on_content_start(&self, fields: &Value) {
        let Ok(start) = serde_json::from_value::<ContentStart>(fields.clone()) else {
            debug!("Skipping undecodable contentStart fields");
            return;
        };
        if start.content_type != "TEXT" {
            return;
        }
        let Some(raw) = start.additional_model_fields else {
            return;
        };
        // Loosely-structured metadata: on parse failure keep the previous
        // stage value.
        if let Ok(parsed) = serde_json::from_str::<Value>(&raw) {
            let stage = parsed
                .get("generationStage")
                .and_then(Value::as_str)
                .unwrap_or("");
            self.tracker.lock().current_generation_stage = stage.to_string();
        }
    }

    fn on_text_output(&self, fields: &Value) {
        let Ok(output) = serde_json::from_value::<TextOutput>(fields.clone()) else {
            debug!("Skipping undecodable textOutput fields");
            return;
        };
        let role = Role::parse(&output.role);

        let stage_marker = {
            let mut tracker = self.tracker.lock();
            let sticky_stage = tracker.current_generation_stage.clone();
            let entry = tracker
                .entries
                .entry(output.content_id.clone())
                .or_insert_with(|| ContentTrackEntry {
                    role,
                    generation_stage: sticky_stage,
                    content: String::new(),
                    logged: false,
                });

            // Last write wins for content and role.
            entry.content = output.content.clone();
            entry.role = role;

            if !entry.generation_stage.is_empty() {
                entry.generation_stage.clone()
            } else if TERMINAL_STOP_REASONS.contains(&output.stop_reason.as_str()) {
                "final".to_string()
            } else {
                "speculative".to_string()
            }
        };

        if output.content.trim().chars().count() > MIN_LOGGED_CONTENT_CHARS {
            if let Err(e) =
                self.sink
                    .append_message(&self.session_id, role, &stage_marker, &output.content)
            {
                warn!(
                    session_id = %self.session_id,
                    retryable = e.is_retryable(),
                    "Failed to log conversation text: {e}"
                );
            }
        }
    }

    fn on_content_end(&self, fields: &Value) {
        let Ok(end) = serde_json::from_value::<ContentEnd>(fields.clone()) else {
            debug!("Skipping undecodable contentEnd fields");
            return;
        };
        if end.content_type != "TEXT" {
            return;
        }
        if let Some(entry) = self.tracker.lock().entries.get_mut(&end.content_name)
            && !entry.logged
        {
            entry.logged = true;
            debug!(
                role = %entry.role,
                chars = entry.content.chars().count(),
                "Content stream finalized"
            );
        }
    }

    #[cfg(test)]
    fn entry_stage(&self, content_id: &str) -> Option<String> {
        self.tracker
            .lock()
            .entries
            .get(content_id)
            .map(|entry| entry.generation_stage.clone())
    }

    #[cfg(test)]
    fn entry_logged(&self, content_id: &str) -> Option<bool> {
        self.tracker
            .lock()
            .entries
            .get(content_id)
            .map(|entry| entry.logged)
    }
}
