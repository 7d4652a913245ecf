//! Wire codec for the lobby protocol.
//!
//! Every message is a single flat JSON object whose `type` field selects the
//! shape of the remaining fields.

use crate::{
    challenge::{Challenge, ExecutionResult},
    lobby::{Profile, Settings, UserId},
    round::EndCause,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Json(#[from] serde_json::Error),
    #[error("packet has no type")]
    MissingType,
    #[error("unknown packet type: {0}")]
    UnknownPacketType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    Ready,
    NotReady,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundPacket {
    #[serde(rename = "updateSettings")]
    UpdateSettings {
        #[serde(alias = "Settings")]
        settings: Settings,
    },
    #[serde(rename = "updatePlayerStatus")]
    UpdatePlayerStatus { status: PlayerStatus },
    #[serde(rename = "start")]
    StartRound { start: bool },
    #[serde(rename = "check")]
    CheckCode { code: String, language: String },
    #[serde(rename = "submit")]
    SubmitCode { code: String, language: String },
    #[serde(rename = "lock")]
    LockLobby { lock: bool },
    #[serde(rename = "delete")]
    DeleteLobby { delete: bool },
    #[serde(rename = "ready")]
    SetReady { ready: bool },
    #[serde(rename = "kick")]
    KickUser {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
}

impl InboundPacket {
    pub const KINDS: [&'static str; 9] = [
        "updateSettings",
        "updatePlayerStatus",
        "start",
        "check",
        "submit",
        "lock",
        "delete",
        "ready",
        "kick",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            InboundPacket::UpdateSettings { .. } => "updateSettings",
            InboundPacket::UpdatePlayerStatus { .. } => "updatePlayerStatus",
            InboundPacket::StartRound { .. } => "start",
            InboundPacket::CheckCode { .. } => "check",
            InboundPacket::SubmitCode { .. } => "submit",
            InboundPacket::LockLobby { .. } => "lock",
            InboundPacket::DeleteLobby { .. } => "delete",
            InboundPacket::SetReady { .. } => "ready",
            InboundPacket::KickUser { .. } => "kick",
        }
    }
}

/// Lobby state as shown to players.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StateView {
    #[serde(rename = "preRound")]
    PreRound {
        #[serde(rename = "readyUsers")]
        ready_users: Vec<UserId>,
    },
    #[serde(rename = "inRound")]
    InRound {
        challenge: Challenge,
        #[serde(rename = "startTime")]
        start_time: DateTime<Utc>,
        submitted: Vec<UserId>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundPacket {
    #[serde(rename = "lobby")]
    Lobby {
        id: Uuid,
        settings: Settings,
        owner: Profile,
        users: BTreeMap<UserId, Profile>,
        state: StateView,
        locked: bool,
    },
    #[serde(rename = "gameStarted")]
    GameStarted {
        #[serde(rename = "startTime")]
        start_time: DateTime<Utc>,
        challenge: Challenge,
    },
    #[serde(rename = "checkResult")]
    CheckResult {
        error: Option<String>,
        result: Vec<ExecutionResult>,
    },
    #[serde(rename = "submitResult")]
    SubmitResult {
        error: Option<String>,
        result: Vec<ExecutionResult>,
    },
    #[serde(rename = "usersUpdate")]
    UsersUpdate {
        users: BTreeMap<UserId, Profile>,
        #[serde(rename = "readyUsers", skip_serializing_if = "Option::is_none")]
        ready_users: Option<Vec<UserId>>,
    },
    #[serde(rename = "lobbyDelete")]
    LobbyDelete { deleted: bool },
    #[serde(rename = "gameEnded")]
    GameEnded {
        cause: EndCause,
        results: BTreeMap<UserId, usize>,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl OutboundPacket {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundPacket::Lobby { .. } => "lobby",
            OutboundPacket::GameStarted { .. } => "gameStarted",
            OutboundPacket::CheckResult { .. } => "checkResult",
            OutboundPacket::SubmitResult { .. } => "submitResult",
            OutboundPacket::UsersUpdate { .. } => "usersUpdate",
            OutboundPacket::LobbyDelete { .. } => "lobbyDelete",
            OutboundPacket::GameEnded { .. } => "gameEnded",
            OutboundPacket::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        OutboundPacket::Error {
            message: message.into(),
        }
    }
}

/// Reads the `type` discriminator first, then parses the matching shape.
pub fn decode(bytes: &[u8]) -> Result<InboundPacket, PacketError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(PacketError::MissingType)?;
    if !InboundPacket::KINDS.contains(&kind) {
        return Err(PacketError::UnknownPacketType(kind.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

pub fn encode(packet: &OutboundPacket) -> Result<String, PacketError> {
    Ok(serde_json::to_string(packet)?)
}
