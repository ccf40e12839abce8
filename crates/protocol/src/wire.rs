//! Control-channel message codec.
//!
//! # Message Format
//!
//! Each control message consists of a fixed 13-byte header followed by an
//! opaque payload:
//!
//! - 4 bytes: message type (little-endian u32)
//! - 4 bytes: status code (little-endian u32)
//! - 4 bytes: payload length (little-endian u32)
//! - 1 byte: background flag (0 or 1)
//! - N bytes: payload
//!
//! All integers are little-endian so both ends agree regardless of host
//! architecture. The status field carries [`STATUS_OK`] or [`STATUS_ERR`];
//! replies to a background request echo the background flag so the client
//! can route them off the interactive path.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Header size: 4 (type) + 4 (status) + 4 (length) + 1 (background) = 13 bytes.
pub const HEADER_SIZE: usize = 13;

/// Maximum payload size (16 MB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Status code for a successful operation.
pub const STATUS_OK: u32 = 0;

/// Status code for a failed operation.
pub const STATUS_ERR: u32 = 1;

/// Control-channel message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Human-readable text: status lines, errors, notifications.
    Text = 0,
    /// Directory listing payload of fixed-width entries.
    ListEntries = 1,
    /// A client command line.
    Command = 2,
    /// File data returned by a read command.
    ReadData = 3,
    /// File data carried by a write command.
    WriteData = 4,
    /// Marker for replies belonging to a background operation.
    Background = 5,
    /// Data-channel handshake for a download.
    DownloadReady = 6,
    /// Data-channel handshake for an upload.
    UploadReady = 7,
}

impl MessageType {
    /// Decode a message type from its wire discriminant.
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Text),
            1 => Ok(MessageType::ListEntries),
            2 => Ok(MessageType::Command),
            3 => Ok(MessageType::ReadData),
            4 => Ok(MessageType::WriteData),
            5 => Ok(MessageType::Background),
            6 => Ok(MessageType::DownloadReady),
            7 => Ok(MessageType::UploadReady),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    /// Wire discriminant for this message type.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A complete control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type.
    pub msg_type: MessageType,
    /// Status code ([`STATUS_OK`] or [`STATUS_ERR`]).
    pub status: u32,
    /// Whether this message belongs to a background operation.
    pub background: bool,
    /// The payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a new message with OK status.
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            status: STATUS_OK,
            background: false,
            payload,
        }
    }

    /// Create an OK text message from a string.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageType::Text, text.into().into_bytes())
    }

    /// Create an error text message from a string.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Text,
            status: STATUS_ERR,
            background: false,
            payload: text.into().into_bytes(),
        }
    }

    /// Return a copy of this message with the background flag set.
    pub fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    /// Interpret the payload as UTF-8 text, replacing invalid sequences.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Whether the status code signals success.
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Encoder and decoder for control-channel messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// Create a new message codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a message into bytes.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        if message.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: message.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut output = Vec::with_capacity(HEADER_SIZE + message.payload.len());
        output.extend_from_slice(&message.msg_type.as_u32().to_le_bytes());
        output.extend_from_slice(&message.status.to_le_bytes());
        output.extend_from_slice(&(message.payload.len() as u32).to_le_bytes());
        output.push(message.background as u8);
        output.extend_from_slice(&message.payload);

        Ok(output)
    }

    /// Decode a message from bytes.
    ///
    /// Returns the decoded message and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<(Message, usize)> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::ShortRead {
                need: HEADER_SIZE,
                have: data.len(),
            });
        }

        let msg_type = MessageType::from_u32(u32::from_le_bytes([
            data[0], data[1], data[2], data[3],
        ]))?;
        let status = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let payload_len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        let background = data[12] != 0;

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let total = HEADER_SIZE + payload_len;
        if data.len() < total {
            return Err(ProtocolError::ShortRead {
                need: total,
                have: data.len(),
            });
        }

        let message = Message {
            msg_type,
            status,
            background,
            payload: data[HEADER_SIZE..total].to_vec(),
        };

        Ok((message, total))
    }

    /// Try to decode a message from bytes, returning `None` if there isn't
    /// enough data yet.
    ///
    /// This is the streaming entry point: callers accumulate bytes and call
    /// this until it yields a message. Unknown message types and oversized
    /// frames are still hard errors.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Message, usize)>> {
        if data.len() < HEADER_SIZE {
            return Ok(None);
        }

        let payload_len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if data.len() < HEADER_SIZE + payload_len {
            return Ok(None);
        }

        self.decode(data).map(Some)
    }
}

/// Read one complete message from an async stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let msg_type = MessageType::from_u32(u32::from_le_bytes([
        header[0], header[1], header[2], header[3],
    ]))?;
    let status = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let payload_len =
        u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let background = header[12] != 0;

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;

    Ok(Message {
        msg_type,
        status,
        background,
        payload,
    })
}

/// Write one complete message to an async stream.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = MessageCodec::new().encode(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
