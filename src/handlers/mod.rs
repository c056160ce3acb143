//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check and last-session history endpoints
//! - The relay WebSocket handler lives in `crate::session`

pub mod api;
