//! 线路帧编解码
//!
//! 长度前缀帧，解码失败时连接必须关闭（无法确定下一帧的起点）。
//! 未知消息类型不属于格式错误：帧边界仍然可靠，交由分发层记录并丢弃。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::domain::model::{
    FRAME_HEADER_LEN, Frame, FrameStatus, LENGTH_FIELD_LEN, MessageType, SerializerType,
};

/// 默认最大帧长度 10 MiB
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame length {0} is shorter than the fixed header")]
    FrameTooShort(u32),

    #[error("frame length {length} exceeds the limit of {max} bytes")]
    FrameTooLong { length: usize, max: usize },

    #[error("content length {declared} does not match frame length (expected {expected})")]
    ContentLengthMismatch { declared: u32, expected: u32 },

    #[error("unknown status code {0}")]
    UnknownStatus(u8),

    #[error("unknown serializer type {0}")]
    UnknownSerializer(u8),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 解码结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    /// 消息类型不在已知集合内，帧已完整消费
    Unrecognized { code: u8, message_id: i64 },
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Inbound;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let frame_length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if (frame_length as usize) < FRAME_HEADER_LEN {
            return Err(CodecError::FrameTooShort(frame_length));
        }
        if frame_length as usize > self.max_frame_length {
            return Err(CodecError::FrameTooLong {
                length: frame_length as usize,
                max: self.max_frame_length,
            });
        }

        let total = LENGTH_FIELD_LEN + frame_length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_LEN);
        let mut body = src.split_to(frame_length as usize);

        let type_code = body.get_u8();
        let message_id = body.get_i64();
        let status_code = body.get_u8();
        let serializer_code = body.get_u8();
        let content_length = body.get_u32();

        let expected = frame_length - FRAME_HEADER_LEN as u32;
        if content_length != expected {
            return Err(CodecError::ContentLengthMismatch {
                declared: content_length,
                expected,
            });
        }

        let status =
            FrameStatus::from_code(status_code).ok_or(CodecError::UnknownStatus(status_code))?;
        let serializer = SerializerType::from_code(serializer_code)
            .ok_or(CodecError::UnknownSerializer(serializer_code))?;

        let Some(message_type) = MessageType::from_code(type_code) else {
            return Ok(Some(Inbound::Unrecognized {
                code: type_code,
                message_id,
            }));
        };

        let content: Bytes = body.freeze();
        Ok(Some(Inbound::Frame(Frame {
            message_type,
            message_id,
            status,
            serializer,
            content,
        })))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame_length = FRAME_HEADER_LEN + frame.content.len();
        if frame_length > self.max_frame_length || frame_length > u32::MAX as usize {
            return Err(CodecError::FrameTooLong {
                length: frame_length,
                max: self.max_frame_length,
            });
        }

        dst.reserve(LENGTH_FIELD_LEN + frame_length);
        dst.put_u32(frame_length as u32);
        dst.put_u8(frame.message_type.code());
        dst.put_i64(frame.message_id);
        dst.put_u8(frame.status.code());
        dst.put_u8(frame.serializer.code());
        dst.put_u32(frame.content.len() as u32);
        dst.extend_from_slice(&frame.content);
        Ok(())
    }
}
