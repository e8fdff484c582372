// =============================================================================
// Hub wire protocol
// =============================================================================
//
// Client → hub:
//   { "method": "SUBSCRIBE" | "UNSUBSCRIBE" | "PING",
//     "params": ["ticker:BTCUSDT", ...], "id": 1,
//     "all": true,                                  (UNSUBSCRIBE)
//     "threshold": { "percentage": 0.05 } }         (SUBSCRIBE)
//
// Hub → client:
//   ack        { "id": 1, "status": "success" | "error", "message": "..." }
//   control    { "type": "pong" | "error" | "welcome", ... }
//   broadcast  { "type": "price_update" | ..., "symbol", "data", "timestamp" }
// =============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::ThresholdOverride;
use crate::error::FeedError;
use crate::types::{now_ms, BroadcastEnvelope};

// =============================================================================
// Client requests
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Subscribe,
    Unsubscribe,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub method: Method,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// UNSUBSCRIBE only: drop every channel of the connection.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub all: bool,
    /// SUBSCRIBE only: per-subscriber significance thresholds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<ThresholdOverride>,
}

impl ClientRequest {
    pub fn subscribe(params: Vec<String>, id: u64) -> Self {
        Self {
            method: Method::Subscribe,
            params,
            id: Some(id),
            all: false,
            threshold: None,
        }
    }

    pub fn unsubscribe(params: Vec<String>, id: u64) -> Self {
        Self {
            method: Method::Unsubscribe,
            params,
            id: Some(id),
            all: false,
            threshold: None,
        }
    }

    pub fn ping(id: u64) -> Self {
        Self {
            method: Method::Ping,
            params: Vec::new(),
            id: Some(id),
            all: false,
            threshold: None,
        }
    }

    pub fn with_threshold(mut self, threshold: ThresholdOverride) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

// =============================================================================
// Hub responses
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

/// Exactly one ack answers every SUBSCRIBE / UNSUBSCRIBE request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub id: Option<u64>,
    pub status: AckStatus,
    pub message: String,
}

impl Ack {
    pub fn success(id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            id,
            status: AckStatus::Success,
            message: message.into(),
        }
    }

    pub fn error(id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            id,
            status: AckStatus::Error,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AckStatus::Success
    }
}

/// Typed control frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        timestamp: i64,
    },
    Error {
        message: String,
        timestamp: i64,
    },
    Welcome {
        #[serde(rename = "connectionId")]
        connection_id: Uuid,
        timestamp: i64,
    },
}

impl ServerFrame {
    pub fn pong(id: Option<u64>) -> Self {
        Self::Pong {
            id,
            timestamp: now_ms(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: now_ms(),
        }
    }

    pub fn welcome(connection_id: Uuid) -> Self {
        Self::Welcome {
            connection_id,
            timestamp: now_ms(),
        }
    }
}

/// What the hub answers to one inbound frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Ack(Ack),
    Frame(ServerFrame),
}

impl Reply {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Inbound classification (client side)
// =============================================================================

/// Any frame a client can receive from the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Ack(Ack),
    Control(ServerFrame),
    Update(BroadcastEnvelope),
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, FeedError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("status").is_some() {
            return Ok(Self::Ack(serde_json::from_value(value)?));
        }
        match value.get("type").and_then(|t| t.as_str()) {
            Some("pong" | "error" | "welcome") => Ok(Self::Control(serde_json::from_value(value)?)),
            Some(_) => Ok(Self::Update(serde_json::from_value(value)?)),
            None => Err(FeedError::MalformedMessage(
                "frame has neither 'status' nor 'type'".into(),
            )),
        }
    }
}
