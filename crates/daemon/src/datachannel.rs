//! Out-of-band data channels for downloads and uploads.
//!
//! A transfer command binds an ephemeral TCP listener, hands the port to the
//! client via the `DATA_PORT` handshake on the control channel, and spawns a
//! worker task. The worker accepts exactly one connection, streams chunks
//! between that socket and the broker, and finally reports the outcome as a
//! text message on the control channel through the shared writer lock, so
//! the status line never interleaves with other control traffic.

use std::time::Duration;

use protocol::{
    BrokerCommand, BrokerPayload, BrokerRequest, CallerIdentity, DataChannelHandshake, Message,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::broker_client::BrokerClient;
use crate::connection::{send_control, ControlWriter};
use crate::session::BackgroundGuard;

/// Chunk size for data-channel streaming; matches the broker's read/write
/// unit.
pub const CHUNK_SIZE: usize = 4096;

/// How long the worker waits for the client to connect.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Direction of a data-channel transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server file streamed to the client.
    Download,
    /// Client bytes streamed into a server file.
    Upload,
}

/// Errors inside a data-channel worker.
#[derive(Debug, Error)]
enum ChannelError {
    #[error("no connection within {0:?}")]
    AcceptTimeout(Duration),

    #[error("{0}")]
    Broker(String),

    #[error("data socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// A data channel ready to be announced to the client.
pub struct DataChannel {
    /// Port the listener is bound to.
    pub port: u16,
    /// Handshake message for the control channel.
    pub handshake: Message,
}

/// Open a data channel for the given transfer and spawn its worker.
///
/// The returned [`DataChannel`] carries the handshake reply, announcing
/// `announce` as the path (the client's local name for the file); `file`
/// is the server-side path the broker streams. The worker writes the
/// final status line itself when the transfer ends. `bg_guard` keeps the
/// session's background counter up for the lifetime of the worker.
#[allow(clippy::too_many_arguments)]
pub async fn open(
    direction: Direction,
    bind_addr: &str,
    file: String,
    announce: String,
    caller: CallerIdentity,
    broker: BrokerClient,
    control: ControlWriter,
    background: bool,
    bg_guard: Option<BackgroundGuard>,
) -> std::io::Result<DataChannel> {
    let listener = TcpListener::bind((bind_addr, 0)).await?;
    let port = listener.local_addr()?.port();

    let handshake_type = match direction {
        Direction::Download => protocol::MessageType::DownloadReady,
        Direction::Upload => protocol::MessageType::UploadReady,
    };
    let handshake = Message::new(
        handshake_type,
        DataChannelHandshake::new(port, announce).format().into_bytes(),
    )
    .with_background(background);

    info!(port, file = %file, direction = ?direction, "Data channel open");

    tokio::spawn(async move {
        // Guard lives as long as the worker; dropping it marks the
        // background operation finished.
        let _bg_guard = bg_guard;

        let result = match direction {
            Direction::Download => run_download(listener, &file, &caller, &broker).await,
            Direction::Upload => run_upload(listener, &file, &caller, &broker).await,
        };

        let status = match result {
            Ok(bytes) => {
                let verb = match direction {
                    Direction::Download => "Download",
                    Direction::Upload => "Upload",
                };
                Message::text(format!("{} complete: {} bytes", verb, bytes))
            }
            Err(e) => {
                warn!(file = %file, error = %e, "Data channel failed");
                Message::error(e.to_string())
            }
        };

        if let Err(e) = send_control(&control, &status.with_background(background)).await {
            debug!(error = %e, "Could not deliver transfer status");
        }
    });

    Ok(DataChannel { port, handshake })
}

async fn accept_one(listener: TcpListener) -> Result<TcpStream, ChannelError> {
    match tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept()).await {
        Ok(Ok((stream, addr))) => {
            debug!(peer = %addr, "Data channel connected");
            Ok(stream)
        }
        Ok(Err(e)) => Err(ChannelError::Io(e)),
        Err(_) => Err(ChannelError::AcceptTimeout(ACCEPT_TIMEOUT)),
    }
}

async fn run_download(
    listener: TcpListener,
    file: &str,
    caller: &CallerIdentity,
    broker: &BrokerClient,
) -> Result<u64, ChannelError> {
    let mut stream = accept_one(listener).await?;

    let mut offset = 0u64;
    loop {
        let request = BrokerRequest::new(BrokerCommand::Read, caller.clone())
            .with_args([file])
            .with_offset(offset);
        let response = broker
            .call(request)
            .await
            .map_err(|e| ChannelError::Broker(e.to_string()))?;

        if !response.is_ok() {
            return Err(ChannelError::Broker(response.message));
        }

        match response.payload {
            BrokerPayload::Data(data) => {
                stream.write_all(&data).await?;
                offset += data.len() as u64;
                if data.len() < CHUNK_SIZE {
                    break;
                }
            }
            // Empty file: nothing to stream
            BrokerPayload::None => break,
            other => {
                return Err(ChannelError::Broker(format!(
                    "unexpected read payload: {:?}",
                    other
                )))
            }
        }
    }

    stream.shutdown().await?;
    Ok(offset)
}

async fn run_upload(
    listener: TcpListener,
    file: &str,
    caller: &CallerIdentity,
    broker: &BrokerClient,
) -> Result<u64, ChannelError> {
    let mut stream = accept_one(listener).await?;

    let mut offset = 0u64;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            break;
        }

        let request = BrokerRequest::new(BrokerCommand::Write, caller.clone())
            .with_args([file])
            .with_offset(offset)
            .with_data(buffer[..n].to_vec());
        let response = broker
            .call(request)
            .await
            .map_err(|e| ChannelError::Broker(e.to_string()))?;

        if !response.is_ok() {
            return Err(ChannelError::Broker(response.message));
        }
        offset += n as u64;
    }

    Ok(offset)
}
