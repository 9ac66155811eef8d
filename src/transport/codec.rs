//! 长度前缀帧格式
//!
//! 每条消息:
//! - 4字节: 消息体长度 (big-endian u32)
//! - N字节: CBOR编码的 [`Envelope`]

use std::io::{ErrorKind, Read, Write};

use crate::messages::Envelope;

use super::TransportError;

/// 单条消息上限 (4路1080p原图的CropBatch也远小于此)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// 写入一条已编码的消息体
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<(), TransportError> {
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::TooLarge {
            size: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

pub fn write_message<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<(), TransportError> {
    let body = envelope.encode()?;
    write_frame(writer, &body)
}

/// 读取一条消息; 对端在消息边界处关闭连接时返回 `Ok(None)`
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Envelope>, TransportError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::TooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(Envelope::decode(&body)?))
}
