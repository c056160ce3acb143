//! Integration tests for chat history reconstruction over real log files.
//!
//! These drive the same sink sessions write through, then read the history
//! back the way the `/history` endpoint does.

use std::sync::Arc;

use s2s_gateway::logger::{ChatMessage, ConversationLogger, LogSink, Role};
use serde_json::json;
use tempfile::TempDir;

fn sink_in(dir: &TempDir) -> Arc<LogSink> {
    Arc::new(LogSink::new(dir.path().join("conversation.log")))
}

fn roles(history: &[ChatMessage]) -> Vec<Role> {
    history.iter().map(|m| m.role).collect()
}

fn contents(history: &[ChatMessage]) -> Vec<&str> {
    history.iter().map(|m| m.content.as_str()).collect()
}

#[test]
fn reconstructs_most_recent_closed_session() {
    let dir = TempDir::new().expect("tempdir");
    let sink = sink_in(&dir);

    sink.append_session_start("s1").unwrap();
    sink.append_message("s1", Role::User, "final", "old session line")
        .unwrap();
    sink.append_session_end("s1").unwrap();

    sink.append_session_start("s2").unwrap();
    sink.append_message("s2", Role::User, "final", "Hello")
        .unwrap();
    sink.append_message("s2", Role::Assistant, "final", "Hi there")
        .unwrap();
    sink.append_session_end("s2").unwrap();

    let history = sink.reconstruct_last_session_history();
    assert_eq!(contents(&history), vec!["Hello", "Hi there"]);
    assert_eq!(roles(&history), vec![Role::User, Role::Assistant]);
}

#[test]
fn open_tail_counts_as_current_session() {
    let dir = TempDir::new().expect("tempdir");
    let sink = sink_in(&dir);

    sink.append_session_start("s1").unwrap();
    sink.append_message("s1", Role::User, "final", "closed session line")
        .unwrap();
    sink.append_session_end("s1").unwrap();

    // A session still in progress has no trailing end marker.
    sink.append_session_start("s2").unwrap();
    sink.append_message("s2", Role::User, "final", "still talking")
        .unwrap();

    let history = sink.reconstruct_last_session_history();
    assert_eq!(contents(&history), vec!["still talking"]);
}

#[test]
fn unmarked_tail_after_closed_sessions_is_the_current_session() {
    let dir = TempDir::new().expect("tempdir");
    let sink = sink_in(&dir);

    for session in ["s1", "s2"] {
        sink.append_session_start(session).unwrap();
        sink.append_message(session, Role::User, "final", &format!("{session} line"))
            .unwrap();
        sink.append_session_end(session).unwrap();
    }

    // Lines appended with no boundary marker after the last closed session.
    sink.append_message("s3", Role::User, "final", "tail line one")
        .unwrap();
    sink.append_message("s3", Role::Assistant, "final", "tail line two")
        .unwrap();

    let history = sink.reconstruct_last_session_history();
    assert_eq!(contents(&history), vec!["tail line one", "tail line two"]);
}

#[test]
fn empty_trailing_session_yields_empty_history() {
    let dir = TempDir::new().expect("tempdir");
    let sink = sink_in(&dir);

    sink.append_session_start("s1").unwrap();
    sink.append_message("s1", Role::User, "final", "previous content")
        .unwrap();
    sink.append_session_end("s1").unwrap();

    // The newest session produced no messages before its markers; the scan
    // stops at its second boundary instead of reaching further back.
    sink.append_session_start("s2").unwrap();
    sink.append_session_end("s2").unwrap();

    let history = sink.reconstruct_last_session_history();
    assert!(history.is_empty());
}

#[test]
fn history_capped_at_ten_most_recent() {
    let dir = TempDir::new().expect("tempdir");
    let sink = sink_in(&dir);

    sink.append_session_start("s1").unwrap();
    for i in 0..15 {
        sink.append_message("s1", Role::User, "final", &format!("message number {i}"))
            .unwrap();
    }

    let history = sink.reconstruct_last_session_history();
    assert_eq!(history.len(), 10);
    assert_eq!(history[0].content, "message number 5");
    assert_eq!(history[9].content, "message number 14");
}

#[test]
fn duplicate_content_keeps_first_occurrence() {
    let dir = TempDir::new().expect("tempdir");
    let sink = sink_in(&dir);

    sink.append_session_start("s1").unwrap();
    sink.append_message("s1", Role::User, "final", "repeated text")
        .unwrap();
    sink.append_message("s1", Role::Assistant, "final", "unique reply")
        .unwrap();
    sink.append_message("s1", Role::Assistant, "final", "repeated text")
        .unwrap();

    let history = sink.reconstruct_last_session_history();
    assert_eq!(contents(&history), vec!["repeated text", "unique reply"]);
    // First occurrence wins, so the USER attribution is kept.
    assert_eq!(history[0].role, Role::User);
}

#[test]
fn unparseable_and_non_chat_lines_skipped() {
    let dir = TempDir::new().expect("tempdir");
    let sink = sink_in(&dir);

    sink.append_session_start("s1").unwrap();
    sink.append_message("s1", Role::User, "final", "kept line")
        .unwrap();
    sink.append_message("s1", Role::Tool, "final", "tool output dropped")
        .unwrap();
    sink.append_message("s1", Role::Unknown, "final", "unknown dropped")
        .unwrap();

    // Hand-written garbage between valid lines.
    std::fs::OpenOptions::new()
        .append(true)
        .open(sink.path())
        .and_then(|mut f| {
            use std::io::Write;
            writeln!(f, "corrupted line with no brackets")
        })
        .unwrap();

    sink.append_message("s1", Role::System, "final", "also kept")
        .unwrap();

    let history = sink.reconstruct_last_session_history();
    assert_eq!(contents(&history), vec!["kept line", "also kept"]);
    assert_eq!(roles(&history), vec![Role::User, Role::System]);
}

#[test]
fn missing_file_yields_empty_history() {
    let dir = TempDir::new().expect("tempdir");
    let sink = sink_in(&dir);
    assert!(sink.reconstruct_last_session_history().is_empty());
}

#[test]
fn log_with_no_messages_yields_empty_history() {
    let dir = TempDir::new().expect("tempdir");
    let sink = sink_in(&dir);

    sink.append_session_start("s1").unwrap();
    sink.append_session_end("s1").unwrap();

    assert!(sink.reconstruct_last_session_history().is_empty());
}

#[test]
fn logger_written_session_round_trips() {
    let dir = TempDir::new().expect("tempdir");
    let sink = sink_in(&dir);
    let logger = ConversationLogger::new(sink.clone(), "session-a");

    logger.record_session_start();
    logger.record_event(&json!({
        "event": {
            "textOutput": {
                "contentId": "u1",
                "content": "What's the weather like?",
                "role": "USER",
                "stopReason": "END_TURN"
            }
        }
    }));
    logger.record_event(&json!({
        "event": {
            "textOutput": {
                "contentId": "a1",
                "content": "Sunny with a light breeze.",
                "role": "ASSISTANT",
                "stopReason": "END_TURN"
            }
        }
    }));
    logger.record_session_end();

    let history = sink.reconstruct_last_session_history();
    assert_eq!(
        contents(&history),
        vec!["What's the weather like?", "Sunny with a light breeze."]
    );
    assert_eq!(roles(&history), vec![Role::User, Role::Assistant]);
}

#[test]
fn speculative_fragments_deduplicate_into_final_transcript() {
    let dir = TempDir::new().expect("tempdir");
    let sink = sink_in(&dir);
    let logger = ConversationLogger::new(sink.clone(), "session-b");

    logger.record_session_start();
    // Streamed fragments grow toward the final sentence; repeats of the
    // exact same text collapse during reconstruction.
    for content in [
        "Sunny with",
        "Sunny with a light",
        "Sunny with a light breeze.",
        "Sunny with a light breeze.",
    ] {
        logger.record_event(&json!({
            "event": {
                "textOutput": {
                    "contentId": "a1",
                    "content": content,
                    "role": "ASSISTANT",
                    "stopReason": ""
                }
            }
        }));
    }
    logger.record_session_end();

    let history = sink.reconstruct_last_session_history();
    assert_eq!(
        contents(&history),
        vec![
            "Sunny with",
            "Sunny with a light",
            "Sunny with a light breeze."
        ]
    );
}
