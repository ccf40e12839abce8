//! Broker IPC codec.
//!
//! The daemon talks to the privileged broker over a Unix domain socket using
//! length-prefixed binary frames: a little-endian u32 body length followed by
//! the body. Request bodies carry a fixed header (command, arg count, section
//! lengths, offset), the caller identity, the NUL-separated argument bytes,
//! and an opaque data block. Response bodies carry a status, the echoed
//! command, a human-readable message, and a tagged payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::listing::FileEntry;
use crate::wire::{STATUS_ERR, STATUS_OK};
use crate::{decode_entries, encode_entries};

/// Maximum broker frame body size (32 MB; covers a data block plus headers).
pub const MAX_BROKER_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Operations the broker performs on behalf of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BrokerCommand {
    /// Resolve a username to uid/gid/home.
    Login = 0,
    /// Provision a new system account and home directory.
    CreateUser = 1,
    /// Remove a system account (compensating cleanup).
    RemoveUser = 2,
    /// List a directory.
    ListDir = 3,
    /// Change the caller's working directory.
    ChangeDir = 4,
    /// Create a file or directory.
    Create = 5,
    /// Change permission bits.
    Chmod = 6,
    /// Delete a file or empty directory.
    Delete = 7,
    /// Move an entry into a directory.
    Move = 8,
    /// Read a chunk of a file.
    Read = 9,
    /// Write a chunk to a file.
    Write = 10,
    /// Copy a transferred file from sender to receiver.
    CopyTransfer = 11,
}

impl BrokerCommand {
    /// Decode a command from its wire discriminant.
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(BrokerCommand::Login),
            1 => Ok(BrokerCommand::CreateUser),
            2 => Ok(BrokerCommand::RemoveUser),
            3 => Ok(BrokerCommand::ListDir),
            4 => Ok(BrokerCommand::ChangeDir),
            5 => Ok(BrokerCommand::Create),
            6 => Ok(BrokerCommand::Chmod),
            7 => Ok(BrokerCommand::Delete),
            8 => Ok(BrokerCommand::Move),
            9 => Ok(BrokerCommand::Read),
            10 => Ok(BrokerCommand::Write),
            11 => Ok(BrokerCommand::CopyTransfer),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    /// Wire discriminant for this command.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Identity of the user a broker request acts for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallerIdentity {
    /// Unix user id.
    pub uid: u32,
    /// Unix group id.
    pub gid: u32,
    /// Username.
    pub username: String,
    /// Absolute home directory under the storage root.
    pub home: String,
    /// Working directory relative to home.
    pub workdir: String,
}

/// A request from the daemon to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRequest {
    /// The operation to perform.
    pub command: BrokerCommand,
    /// Who the operation acts for.
    pub caller: CallerIdentity,
    /// Positional arguments.
    pub args: Vec<String>,
    /// Byte offset for read/write operations.
    pub offset: u64,
    /// Opaque data block (write payloads).
    pub data: Vec<u8>,
}

impl BrokerRequest {
    /// Create a request with no arguments or data.
    pub fn new(command: BrokerCommand, caller: CallerIdentity) -> Self {
        Self {
            command,
            caller,
            args: Vec::new(),
            offset: 0,
            data: Vec::new(),
        }
    }

    /// Add positional arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the byte offset.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Attach a data block.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

/// Typed payload of a broker response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BrokerPayload {
    /// No payload.
    #[default]
    None,
    /// Resolved identity after a login.
    Login {
        /// Unix user id.
        uid: u32,
        /// Unix group id.
        gid: u32,
        /// Home directory relative to the storage root.
        home: String,
    },
    /// New working directory after a `ChangeDir`.
    Cwd(String),
    /// Directory entries from a `ListDir`.
    Entries(Vec<FileEntry>),
    /// Raw file bytes from a `Read`.
    Data(Vec<u8>),
}

const PAYLOAD_TAG_NONE: u32 = 0;
const PAYLOAD_TAG_LOGIN: u32 = 1;
const PAYLOAD_TAG_CWD: u32 = 2;
const PAYLOAD_TAG_ENTRIES: u32 = 3;
const PAYLOAD_TAG_DATA: u32 = 4;

/// A response from the broker to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerResponse {
    /// Status code ([`STATUS_OK`] or [`STATUS_ERR`]).
    pub status: u32,
    /// The command this responds to.
    pub command: BrokerCommand,
    /// Human-readable status message.
    pub message: String,
    /// Typed payload.
    pub payload: BrokerPayload,
}

impl BrokerResponse {
    /// Create a success response.
    pub fn ok(command: BrokerCommand, message: impl Into<String>) -> Self {
        Self {
            status: STATUS_OK,
            command,
            message: message.into(),
            payload: BrokerPayload::None,
        }
    }

    /// Create a failure response.
    pub fn err(command: BrokerCommand, message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERR,
            command,
            message: message.into(),
            payload: BrokerPayload::None,
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: BrokerPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Whether the status code signals success.
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

// =============================================================================
// Encoding helpers
// =============================================================================

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
    buf.extend_from_slice(b);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(ProtocolError::ShortRead {
                need: self.pos + n,
                have: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ProtocolError::MalformedPayload(format!("string not UTF-8: {}", e)))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

/// Encode a broker request body (without the outer length prefix).
pub fn encode_request(request: &BrokerRequest) -> Vec<u8> {
    let args_bytes: Vec<u8> = request
        .args
        .iter()
        .map(|a| a.as_bytes())
        .collect::<Vec<_>>()
        .join(&0u8);

    let mut body = Vec::new();
    body.extend_from_slice(&request.command.as_u32().to_le_bytes());
    body.extend_from_slice(&(request.args.len() as u32).to_le_bytes());
    body.extend_from_slice(&(args_bytes.len() as u32).to_le_bytes());
    body.extend_from_slice(&(request.data.len() as u32).to_le_bytes());
    body.extend_from_slice(&request.offset.to_le_bytes());

    body.extend_from_slice(&request.caller.uid.to_le_bytes());
    body.extend_from_slice(&request.caller.gid.to_le_bytes());
    put_string(&mut body, &request.caller.username);
    put_string(&mut body, &request.caller.home);
    put_string(&mut body, &request.caller.workdir);

    body.extend_from_slice(&args_bytes);
    body.extend_from_slice(&request.data);

    body
}

/// Decode a broker request body.
pub fn decode_request(data: &[u8]) -> Result<BrokerRequest> {
    let mut r = Reader::new(data);

    let command = BrokerCommand::from_u32(r.u32()?)?;
    let argc = r.u32()? as usize;
    let args_len = r.u32()? as usize;
    let data_len = r.u32()? as usize;
    let offset = r.u64()?;

    let caller = CallerIdentity {
        uid: r.u32()?,
        gid: r.u32()?,
        username: r.string()?,
        home: r.string()?,
        workdir: r.string()?,
    };

    let args_bytes = r.take(args_len)?;
    // Splitting empty bytes yields one empty part, so the no-args case is
    // keyed on the header's count; an empty string is a valid argument.
    let args: Vec<String> = if argc == 0 && args_len == 0 {
        Vec::new()
    } else {
        args_bytes
            .split(|&b| b == 0)
            .map(|part| {
                String::from_utf8(part.to_vec()).map_err(|e| {
                    ProtocolError::MalformedPayload(format!("argument not UTF-8: {}", e))
                })
            })
            .collect::<Result<_>>()?
    };
    if args.len() != argc {
        return Err(ProtocolError::MalformedPayload(format!(
            "argument count mismatch: header says {}, payload has {}",
            argc,
            args.len()
        )));
    }

    let data = r.take(data_len)?.to_vec();

    Ok(BrokerRequest {
        command,
        caller,
        args,
        offset,
        data,
    })
}

/// Encode a broker response body (without the outer length prefix).
pub fn encode_response(response: &BrokerResponse) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&response.status.to_le_bytes());
    body.extend_from_slice(&response.command.as_u32().to_le_bytes());
    put_string(&mut body, &response.message);

    match &response.payload {
        BrokerPayload::None => {
            body.extend_from_slice(&PAYLOAD_TAG_NONE.to_le_bytes());
        }
        BrokerPayload::Login { uid, gid, home } => {
            body.extend_from_slice(&PAYLOAD_TAG_LOGIN.to_le_bytes());
            body.extend_from_slice(&uid.to_le_bytes());
            body.extend_from_slice(&gid.to_le_bytes());
            put_string(&mut body, home);
        }
        BrokerPayload::Cwd(path) => {
            body.extend_from_slice(&PAYLOAD_TAG_CWD.to_le_bytes());
            put_string(&mut body, path);
        }
        BrokerPayload::Entries(entries) => {
            body.extend_from_slice(&PAYLOAD_TAG_ENTRIES.to_le_bytes());
            put_bytes(&mut body, &encode_entries(entries));
        }
        BrokerPayload::Data(bytes) => {
            body.extend_from_slice(&PAYLOAD_TAG_DATA.to_le_bytes());
            put_bytes(&mut body, bytes);
        }
    }

    body
}

/// Decode a broker response body.
pub fn decode_response(data: &[u8]) -> Result<BrokerResponse> {
    let mut r = Reader::new(data);

    let status = r.u32()?;
    let command = BrokerCommand::from_u32(r.u32()?)?;
    let message = r.string()?;

    let payload = match r.u32()? {
        PAYLOAD_TAG_NONE => BrokerPayload::None,
        PAYLOAD_TAG_LOGIN => BrokerPayload::Login {
            uid: r.u32()?,
            gid: r.u32()?,
            home: r.string()?,
        },
        PAYLOAD_TAG_CWD => BrokerPayload::Cwd(r.string()?),
        PAYLOAD_TAG_ENTRIES => BrokerPayload::Entries(decode_entries(&r.bytes()?)?),
        PAYLOAD_TAG_DATA => BrokerPayload::Data(r.bytes()?),
        other => {
            return Err(ProtocolError::MalformedPayload(format!(
                "unknown response payload tag: {}",
                other
            )))
        }
    };

    Ok(BrokerResponse {
        status,
        command,
        message,
        payload,
    })
}

// =============================================================================
// Async framing
// =============================================================================

async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_BROKER_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_BROKER_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_BROKER_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_BROKER_FRAME_SIZE,
        });
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one broker request from an async stream.
pub async fn read_request<R>(reader: &mut R) -> Result<BrokerRequest>
where
    R: AsyncRead + Unpin,
{
    let body = read_frame(reader).await?;
    decode_request(&body)
}

/// Write one broker request to an async stream.
pub async fn write_request<W>(writer: &mut W, request: &BrokerRequest) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &encode_request(request)).await
}

/// Read one broker response from an async stream.
pub async fn read_response<R>(reader: &mut R) -> Result<BrokerResponse>
where
    R: AsyncRead + Unpin,
{
    let body = read_frame(reader).await?;
    decode_response(&body)
}

/// Write one broker response to an async stream.
pub async fn write_response<W>(writer: &mut W, response: &BrokerResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &encode_response(response)).await
}
