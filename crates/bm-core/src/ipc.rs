//! Control protocol between `status`/`close` and a running host process
//!
//! JSON objects, one per line, over TCP on 127.0.0.1. TCP keeps the
//! endpoint identical on every platform.

use serde::{Deserialize, Serialize};

use crate::types::{SessionId, SessionInfo, SessionState};

/// Request sent to the control endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Liveness check
    Ping,

    /// Snapshot of every known session
    ListSessions,

    /// Close one session
    CloseSession { session_id: SessionId },

    /// Close every session
    CloseAll,

    /// Keep the connection open and push a `session_event` per state change
    Watch,
}

/// Response from the control endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Pong,

    Sessions { sessions: Vec<SessionInfo> },

    /// Number of sessions moved towards `Closed`
    Closed { count: usize },

    /// Pushed to watchers
    SessionEvent(ControlEvent),

    Error { message: String },
}

/// Session change pushed to watchers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlEvent {
    pub session_id: SessionId,
    /// `None` when the session was created
    pub from: Option<SessionState>,
    /// `None` when the session was removed from the registry
    pub to: Option<SessionState>,
    pub reason: Option<String>,
}
