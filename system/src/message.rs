use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type ConnectionId = u32;
pub type SessionId = String;
pub type UserId = String;

/// Who a connection belongs to, as reported by the token verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub role: String,
}

/// Public view of a connection, attached to everything we fan out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingEntry {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub display_name: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStatus {
    pub admitted: bool,
    pub is_host: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_for_host: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AdmissionStatus {
    pub fn admitted(is_host: bool) -> Self {
        Self {
            admitted: true,
            is_host,
            waiting_for_host: None,
            message: None,
        }
    }

    pub fn waiting(waiting_for_host: bool, message: impl Into<String>) -> Self {
        Self {
            admitted: false,
            is_host: false,
            waiting_for_host: Some(waiting_for_host),
            message: Some(message.into()),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            admitted: false,
            is_host: false,
            waiting_for_host: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub target_connection_id: ConnectionId,
    pub user_id: UserId,
    pub display_name: String,
    pub requested_at: DateTime<Utc>,
}

/// Normalized outcome of a code run, whether it came from the executor or was
/// synthesized after the executor failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<ConnectionId>,
}

/// Ingress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinSession {
        session_id: SessionId,
        #[serde(default)]
        display_name: String,
        #[serde(default)]
        is_host: bool,
    },
    LeaveSession,
    #[serde(rename_all = "camelCase")]
    AdmitParticipant {
        target_connection_id: ConnectionId,
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    RejectParticipant {
        target_connection_id: ConnectionId,
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    SetAutoAdmit {
        session_id: SessionId,
        enabled: bool,
    },
    ChatMessage {
        text: String,
    },
    ProblemStatementUpdate {
        text: String,
    },
    LanguageChange {
        language: String,
    },
    FileUpdate {
        files: Value,
    },
    FocusChange {
        index: Value,
    },
    /// Carries its own `type` field plus arbitrary details; kept as-is.
    ProctorEvent(Map<String, Value>),
    #[serde(rename_all = "camelCase")]
    Signal {
        to_connection_id: ConnectionId,
        payload: Value,
    },
    #[serde(rename_all = "camelCase")]
    RunCode {
        language: String,
        code: String,
        #[serde(default)]
        input: String,
        #[serde(default)]
        session_id: Option<SessionId>,
        /// Shorter deadline for this run; never extends the server's own limit.
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

/// Egress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: ConnectionId,
        user_id: UserId,
        display_name: String,
    },
    AdmissionStatus(AdmissionStatus),
    AdmissionRequest(AdmissionRequest),
    WaitingRoomList(Vec<WaitingEntry>),
    UserJoined(Participant),
    UserLeft(Participant),
    HostJoined(Participant),
    HostLeft(Participant),
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        from: Participant,
        text: String,
        sent_at: DateTime<Utc>,
    },
    ProblemStatementUpdate {
        from: Participant,
        text: String,
    },
    LanguageChange {
        from: Participant,
        language: String,
    },
    FileUpdate {
        from: Participant,
        files: Value,
    },
    FocusChange {
        from: Participant,
        index: Value,
    },
    ProctorEvent {
        from: Participant,
        detail: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    Signal {
        from_connection_id: ConnectionId,
        payload: Value,
    },
    RunResult(RunResult),
}
