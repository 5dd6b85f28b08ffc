//! Realtime wire frames: `{"t": "<type>", "p": <payload>}`.

use crate::store::StoredMessage;
use serde::{Deserialize, Serialize};

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "t", content = "p", rename_all = "lowercase")]
pub enum InboundFrame {
    Msg {
        to: String,
        encrypted_content: String,
        #[serde(default)]
        temp_id: String,
    },
    Read {
        message_id: String,
        conversation_id: String,
    },
    Typing {
        to: String,
        conversation_id: String,
    },
}

impl InboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Msg { .. } => "msg",
            Self::Read { .. } => "read",
            Self::Typing { .. } => "typing",
        }
    }
}

/// Frames the server pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "t", content = "p", rename_all = "lowercase")]
pub enum OutboundFrame {
    Msg(MessageView),
    Delivered {
        temp_id: String,
        message: MessageView,
    },
    Typing {
        from: String,
        conversation_id: String,
    },
    Read {
        message_id: String,
        by: String,
    },
    Online {
        user_id: String,
    },
    Offline {
        user_id: String,
    },
}

impl OutboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Msg(_) => "msg",
            Self::Delivered { .. } => "delivered",
            Self::Typing { .. } => "typing",
            Self::Read { .. } => "read",
            Self::Online { .. } => "online",
            Self::Offline { .. } => "offline",
        }
    }
}

/// A persisted message as clients see it. `created_at` is unix millis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub encrypted_content: String,
    pub created_at: i64,
}

impl From<&StoredMessage> for MessageView {
    fn from(msg: &StoredMessage) -> Self {
        Self {
            id: msg.id.clone(),
            conversation_id: msg.conversation_id.clone(),
            sender_id: msg.sender_id.clone(),
            encrypted_content: msg.encrypted_content.clone(),
            created_at: msg.created_at,
        }
    }
}
