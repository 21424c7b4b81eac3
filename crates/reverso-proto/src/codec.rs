//! Codec for encoding/decoding control messages
//!
//! Format: [length: u32 big-endian][payload: bincode serialized value]

use crate::messages::ControlMessage;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

const LENGTH_PREFIX: usize = 4;
const INITIAL_READ_CAPACITY: usize = 8 * 1024;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed bincode codec for [`ControlMessage`]
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }
}

fn encode_frame<T: Serialize>(value: &T, dst: &mut BytesMut) -> Result<(), CodecError> {
    let payload = bincode::serialize(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::MessageTooLarge(payload.len()));
    }

    dst.reserve(LENGTH_PREFIX + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.extend_from_slice(&payload);
    Ok(())
}

impl Encoder<ControlMessage> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst)
    }
}

impl Decoder for MessageCodec {
    type Item = ControlMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let payload = src.split_to(length);
        let msg = bincode::deserialize(&payload)?;
        Ok(Some(msg))
    }
}

/// Write a single frame directly to a stream
///
/// Used for one-shot exchanges (pipe hello, stream header) where a framed
/// reader would over-read bytes that belong to the next protocol layer.
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = BytesMut::new();
    encode_frame(value, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame from a stream without consuming any following bytes
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    read_message_limited(reader, MAX_FRAME_SIZE).await
}

/// Like [`read_message`], rejecting frames longer than `max_len`.
///
/// The buffer grows with the bytes actually received, so a peer cannot
/// make the reader allocate a large frame up front.
pub async fn read_message_limited<R, T>(reader: &mut R, max_len: usize) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let length = reader.read_u32().await? as usize;
    if length > max_len {
        return Err(CodecError::MessageTooLarge(length));
    }

    let mut payload = Vec::with_capacity(length.min(INITIAL_READ_CAPACITY));
    (&mut *reader)
        .take(length as u64)
        .read_to_end(&mut payload)
        .await?;
    if payload.len() < length {
        return Err(CodecError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "frame truncated",
        )));
    }
    Ok(bincode::deserialize(&payload)?)
}
