//! 线路帧模型
//!
//! 帧格式（大端序）：
//! `[frameLength:u32][messageType:u8][messageId:i64][status:u8][serializerType:u8][contentLength:u32][content]`
//!
//! `frameLength` 为长度字段之后的全部字节数，即 `FRAME_HEADER_LEN + contentLength`。

use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ImError, Result};

/// 长度字段本身的字节数
pub const LENGTH_FIELD_LEN: usize = 4;

/// 长度字段之后的固定头部字节数：type(1) + id(8) + status(1) + serializer(1) + contentLength(4)
pub const FRAME_HEADER_LEN: usize = 15;

/// 消息类型（封闭枚举，编码值不可变更）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    AuthRequest = 1,
    AuthResponse = 2,
    ChatMessage = 3,
    GroupMessage = 4,
    ReadReceipt = 5,
    ChatAck = 6,
    HeartbeatRequest = 7,
    HeartbeatResponse = 8,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::AuthRequest),
            2 => Some(Self::AuthResponse),
            3 => Some(Self::ChatMessage),
            4 => Some(Self::GroupMessage),
            5 => Some(Self::ReadReceipt),
            6 => Some(Self::ChatAck),
            7 => Some(Self::HeartbeatRequest),
            8 => Some(Self::HeartbeatResponse),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthRequest => "AUTH_REQUEST",
            Self::AuthResponse => "AUTH_RESPONSE",
            Self::ChatMessage => "CHAT_MESSAGE",
            Self::GroupMessage => "GROUP_MESSAGE",
            Self::ReadReceipt => "READ_RECEIPT",
            Self::ChatAck => "CHAT_ACK",
            Self::HeartbeatRequest => "HEARTBEAT_REQUEST",
            Self::HeartbeatResponse => "HEARTBEAT_RESPONSE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 帧状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameStatus {
    Success = 0,
    Fail = 1,
    Delivered = 2,
}

impl FrameStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::Fail),
            2 => Some(Self::Delivered),
            _ => None,
        }
    }
}

/// 载荷编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SerializerType {
    #[default]
    Json = 0,
    Binary = 1,
}

impl SerializerType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Json),
            1 => Some(Self::Binary),
            _ => None,
        }
    }
}

/// 线路帧，发送后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub message_id: i64,
    pub status: FrameStatus,
    pub serializer: SerializerType,
    pub content: Bytes,
}

impl Frame {
    pub fn new(
        message_type: MessageType,
        message_id: i64,
        status: FrameStatus,
        content: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_type,
            message_id,
            status,
            serializer: SerializerType::Json,
            content: content.into(),
        }
    }

    /// 以 JSON 编码载荷构造帧
    pub fn json<T: Serialize>(
        message_type: MessageType,
        message_id: i64,
        status: FrameStatus,
        payload: &T,
    ) -> Result<Self> {
        let content = serde_json::to_vec(payload)?;
        Ok(Self::new(message_type, message_id, status, content))
    }

    /// 按 JSON 解析载荷；二进制载荷暂不支持
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        match self.serializer {
            SerializerType::Json => Ok(serde_json::from_slice(&self.content)?),
            SerializerType::Binary => Err(ImError::Serialization(serde::de::Error::custom(
                "binary payloads are not supported",
            ))),
        }
    }

    /// 服务端收到消息后的回执（DELIVERED 表示服务端已接收）
    pub fn chat_ack(message_id: i64) -> Self {
        Self::new(
            MessageType::ChatAck,
            message_id,
            FrameStatus::Delivered,
            Bytes::new(),
        )
    }

    pub fn heartbeat_response(message_id: i64) -> Self {
        Self::new(
            MessageType::HeartbeatResponse,
            message_id,
            FrameStatus::Success,
            Bytes::new(),
        )
    }

    /// 编码后的总字节数（含长度字段）
    pub fn encoded_len(&self) -> usize {
        LENGTH_FIELD_LEN + FRAME_HEADER_LEN + self.content.len()
    }
}
