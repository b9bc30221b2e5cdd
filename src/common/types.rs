use serde::{Deserialize, Serialize};

/// Who authored a message; decides the rendering side and whether delivery
/// confirmation is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SenderType {
    User,
    Bot,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::User => "USER",
            SenderType::Bot => "BOT",
            SenderType::System => "SYSTEM",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "USER" => Some(SenderType::User),
            "BOT" => Some(SenderType::Bot),
            "SYSTEM" => Some(SenderType::System),
            _ => None,
        }
    }
}

/// Delivery lifecycle of a message. PENDING and SENT only ever apply to
/// locally-authored messages; inbound rows land as DELIVERED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryState {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "PENDING",
            DeliveryState::Sent => "SENT",
            DeliveryState::Delivered => "DELIVERED",
            DeliveryState::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(DeliveryState::Pending),
            "SENT" => Some(DeliveryState::Sent),
            "DELIVERED" => Some(DeliveryState::Delivered),
            "FAILED" => Some(DeliveryState::Failed),
            _ => None,
        }
    }
}

/// Domain model for one chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub sender_type: SenderType,
    /// Unix millis; monotonic within a conversation.
    pub timestamp: i64,
    pub delivery_state: DeliveryState,
    pub is_read: bool,
    /// Id of the message this one replies to, for reply threading.
    pub response_to: Option<String>,
}

/// Wire shape of an inbound frame, camelCase to match the backend payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub sender_type: SenderType,
    /// Missing timestamps are stamped at arrival.
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Id of the message this one replies to, when the backend reports one.
    #[serde(default)]
    pub response_to: Option<String>,
}
