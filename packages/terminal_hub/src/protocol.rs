//! JSON frames exchanged with browser clients.
//!
//! Requests are `{"type": "<event>", "ack"?: n, ...payload}`. Server events use
//! the same `type` tag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::runtime::Geometry;

/// Client → server requests.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    ListApps,
    GetAppCreatedAt {
        app_name: String,
    },
    AppExists {
        app_name: String,
    },
    Deploy,
    CreateTerminal {
        id: String,
    },
    ResizeTerminal {
        dimensions: Geometry,
        /// Session to resize; the active session when absent
        #[serde(default)]
        id: Option<String>,
    },
    TerminalData {
        id: String,
        data: String,
    },
    CloseTerminal {
        id: String,
    },
    StopPreview,
    GetInitialState,
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListApps => "listApps",
            Self::GetAppCreatedAt { .. } => "getAppCreatedAt",
            Self::AppExists { .. } => "appExists",
            Self::Deploy => "deploy",
            Self::CreateTerminal { .. } => "createTerminal",
            Self::ResizeTerminal { .. } => "resizeTerminal",
            Self::TerminalData { .. } => "terminalData",
            Self::CloseTerminal { .. } => "closeTerminal",
            Self::StopPreview => "stopPreview",
            Self::GetInitialState => "getInitialState",
        }
    }
}

/// A request plus the optional id the client wants its reply tagged with.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub ack: Option<u64>,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    TerminalResponse {
        id: String,
        data: String,
    },
    TerminalCreated {
        id: String,
    },
    TerminalClosed {
        id: String,
    },
    PreviewState {
        url: Option<String>,
        run_terminal_id: Option<String>,
    },
    TerminalState {
        ids: Vec<String>,
        /// Recent output per session, for clients joining mid-session
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        screens: BTreeMap<String, String>,
    },
    Ack {
        ack: u64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Reply>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn preview_cleared() -> Self {
        Self::PreviewState {
            url: None,
            run_terminal_id: None,
        }
    }
}

/// Direct replies to request/response style requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Apps {
        success: bool,
        apps: Vec<String>,
    },
    CreatedAt {
        success: bool,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
    },
    Exists {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        exists: Option<bool>,
    },
    Done {
        success: bool,
    },
}
