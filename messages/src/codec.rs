//! Length-prefixed frame codec.
//!
//! Each frame is a 4-byte big-endian body length followed by the bincode
//! encoding of one [`Message`].

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Message;

/// Largest accepted frame body.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("message too large: {0} > {MAX_MESSAGE_SIZE}")]
    TooLarge(usize),
}

pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(msg).map_err(|e| CodecError::Encoding(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    bincode::deserialize(bytes).map_err(|e| CodecError::Encoding(e.to_string()))
}

/// Write one framed message. Returns the number of bytes written.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> Result<usize, CodecError>
where
    W: AsyncWrite + Unpin,
{
    let body = encode(msg)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(body.len() + 4)
}

/// Read one framed message. Returns the message and the bytes consumed.
pub async fn read_frame<R>(reader: &mut R) -> Result<(Message, usize), CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let body_len = u32::from_be_bytes(len_buf) as usize;
    if body_len > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge(body_len));
    }
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok((decode(&body)?, body_len + 4))
}
