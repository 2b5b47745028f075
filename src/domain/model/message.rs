//! 消息模型：客户端载荷、持久化记录、离线条目与跨节点路由记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::frame::{Frame, FrameStatus, MessageType};
use crate::error::Result;

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Private,
    Group,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "private" => Some(Self::Private),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// 消息内容类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ContentType {
    Text = 1,
    Image = 2,
    Voice = 3,
    Video = 4,
    File = 5,
    Location = 6,
    Custom = 7,
}

impl ContentType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Text),
            2 => Some(Self::Image),
            3 => Some(Self::Voice),
            4 => Some(Self::Video),
            5 => Some(Self::File),
            6 => Some(Self::Location),
            7 => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// 投递状态：SENDING -> PUSHED -> DELIVERED，或 FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    #[default]
    Sending,
    Pushed,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sending => "SENDING",
            Self::Pushed => "PUSHED",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SENDING" => Some(Self::Sending),
            "PUSHED" => Some(Self::Pushed),
            "DELIVERED" => Some(Self::Delivered),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// 状态是否允许迁移到 `next`
    ///
    /// DELIVERED 为终态；FAILED 之后只接受客户端确认（DELIVERED）。
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        match (self, next) {
            (Delivered, _) => false,
            (Failed, Delivered) => true,
            (Failed, _) => false,
            (Sending, Sending) => false,
            (Pushed, Sending | Pushed) => false,
            _ => true,
        }
    }
}

/// 私聊会话 ID：`private_<小ID>_<大ID>`
pub fn private_conversation_id(a: i64, b: i64) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("private_{low}_{high}")
}

/// 群聊会话 ID：`group_<群ID>`
pub fn group_conversation_id(group_id: i64) -> String {
    format!("group_{group_id}")
}

/// AUTH_REQUEST 载荷
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

/// AUTH_RESPONSE 载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub code: i32,
    pub message: String,
}

impl AuthResult {
    pub fn success() -> Self {
        Self {
            code: 0,
            message: "auth success".to_string(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: reason.into(),
        }
    }

    pub fn into_frame(self, message_id: i64) -> Result<Frame> {
        let status = if self.code == 0 {
            FrameStatus::Success
        } else {
            FrameStatus::Fail
        };
        Frame::json(MessageType::AuthResponse, message_id, status, &self)
    }
}

/// CHAT_MESSAGE / GROUP_MESSAGE 入站载荷（群消息的 receiverId 为群 ID）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub receiver_id: i64,
    pub content_type: i32,
    pub content: String,
    #[serde(default)]
    pub client_msg_no: Option<String>,
    #[serde(default)]
    pub extra: Option<String>,
}

/// READ_RECEIPT 载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptPayload {
    pub message_ids: Vec<i64>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// 发往已读回执 topic 的记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub reader_id: i64,
    pub message_ids: Vec<i64>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub read_at: DateTime<Utc>,
}

/// 持久化的聊天消息
///
/// 同时作为 MQ 记录和下行推送载荷。创建后只有 `delivery_status` 与 `read` 会变化。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message_id: i64,
    pub conversation_id: String,
    pub sender_id: i64,
    /// 私聊为接收用户 ID，群聊为群 ID
    pub receiver_id: i64,
    pub conversation_kind: ConversationKind,
    pub content_type: i32,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_msg_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub delivery_status: DeliveryStatus,
    #[serde(default)]
    pub read: bool,
}

impl ChatMessage {
    pub fn private(message_id: i64, sender_id: i64, payload: ChatPayload) -> Self {
        Self::build(
            message_id,
            sender_id,
            ConversationKind::Private,
            private_conversation_id(sender_id, payload.receiver_id),
            payload,
        )
    }

    pub fn group(message_id: i64, sender_id: i64, payload: ChatPayload) -> Self {
        Self::build(
            message_id,
            sender_id,
            ConversationKind::Group,
            group_conversation_id(payload.receiver_id),
            payload,
        )
    }

    fn build(
        message_id: i64,
        sender_id: i64,
        kind: ConversationKind,
        conversation_id: String,
        payload: ChatPayload,
    ) -> Self {
        Self {
            message_id,
            conversation_id,
            sender_id,
            receiver_id: payload.receiver_id,
            conversation_kind: kind,
            content_type: payload.content_type,
            content: payload.content,
            client_msg_no: payload.client_msg_no,
            extra: payload.extra,
            sequence_number: None,
            timestamp: Utc::now(),
            delivery_status: DeliveryStatus::Sending,
            read: false,
        }
    }

    pub fn frame_type(&self) -> MessageType {
        match self.conversation_kind {
            ConversationKind::Private => MessageType::ChatMessage,
            ConversationKind::Group => MessageType::GroupMessage,
        }
    }

    /// 下行推送帧
    pub fn to_push_frame(&self) -> Result<Frame> {
        Frame::json(
            self.frame_type(),
            self.message_id,
            FrameStatus::Success,
            self,
        )
    }
}

/// 跨节点路由记录：只有 `target_node` 对应的节点处理
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRecord {
    pub target_node: String,
    pub recipient_id: i64,
    pub message: ChatMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(receiver_id: i64) -> ChatPayload {
        ChatPayload {
            receiver_id,
            content_type: ContentType::Text.code(),
            content: "hello".to_string(),
            client_msg_no: Some("c-1".to_string()),
            extra: None,
        }
    }

    #[test]
    fn conversation_ids_are_order_independent() {
        assert_eq!(private_conversation_id(9, 3), "private_3_9");
        assert_eq!(private_conversation_id(3, 9), "private_3_9");
        assert_eq!(group_conversation_id(42), "group_42");

        let message = ChatMessage::private(1, 20, payload(10));
        assert_eq!(message.conversation_id, "private_10_20");
        let message = ChatMessage::group(2, 20, payload(7));
        assert_eq!(message.conversation_id, "group_7");
        assert_eq!(message.frame_type(), MessageType::GroupMessage);
    }

    #[test]
    fn payloads_use_camel_case() {
        let parsed: ChatPayload = serde_json::from_str(
            r#"{"receiverId":5,"contentType":1,"content":"hi","clientMsgNo":"x"}"#,
        )
        .unwrap();
        assert_eq!(parsed.receiver_id, 5);
        assert_eq!(parsed.client_msg_no.as_deref(), Some("x"));

        let auth: AuthPayload = serde_json::from_str(r#"{"userId":12}"#).unwrap();
        assert_eq!(auth.user_id, Some(12));
        assert!(auth.token.is_none());

        let message = ChatMessage::private(1, 2, payload(3));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["conversationKind"], "private");
        assert_eq!(json["deliveryStatus"], "SENDING");
        assert!(json.get("sequenceNumber").is_none());
    }

    #[test]
    fn delivery_status_transitions() {
        use DeliveryStatus::*;
        assert!(Sending.can_advance_to(Pushed));
        assert!(Sending.can_advance_to(Failed));
        assert!(Pushed.can_advance_to(Delivered));
        assert!(!Pushed.can_advance_to(Sending));
        assert!(!Delivered.can_advance_to(Failed));
        assert!(Failed.can_advance_to(Delivered));
        assert!(!Failed.can_advance_to(Pushed));
    }

    #[test]
    fn auth_result_maps_to_frame_status() {
        let frame = AuthResult::failure("missing identity").into_frame(7).unwrap();
        assert_eq!(frame.status, FrameStatus::Fail);
        assert_eq!(frame.message_id, 7);
        let frame = AuthResult::success().into_frame(8).unwrap();
        assert_eq!(frame.status, FrameStatus::Success);
    }
}
