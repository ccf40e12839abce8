//! One client connection: socket reads, dispatch, notifications.
//!
//! The connection loop multiplexes two sources: framed commands from the
//! client socket and transfer events from the session's notification
//! channel. Commands are read by a dedicated task so a notification never
//! interrupts a partially read frame; the loop itself only ever awaits
//! channels. All writes to the control socket go through one shared mutex
//! so background transfer workers and notifications cannot interleave
//! bytes with a foreground reply.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::{Message, ProtocolError};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::broker_client::BrokerClient;
use crate::dispatcher::{Action, Dispatcher};
use crate::notify::{self, NotifyReceiver};
use crate::registry::SharedRegistry;

/// Shared, serialized writer for one control socket.
pub type ControlWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Write one framed message to the control socket under its lock.
pub async fn send_control(writer: &ControlWriter, message: &Message) -> protocol::Result<()> {
    let mut writer = writer.lock().await;
    protocol::write_message(&mut *writer, message).await
}

/// A live client connection.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    notify_rx: NotifyReceiver,
}

impl Connection {
    /// Wrap an accepted socket in a connection with a fresh session.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        registry: Arc<SharedRegistry>,
        broker: BrokerClient,
        data_bind_addr: String,
        transfer_wait: Duration,
    ) -> Self {
        let (notify_tx, notify_rx) = notify::channel();
        let dispatcher = Dispatcher::new(registry, broker, notify_tx, data_bind_addr, transfer_wait);
        Self {
            stream,
            peer,
            dispatcher,
            notify_rx,
        }
    }

    /// Serve the connection until the client disconnects or exits.
    ///
    /// Registry state for the session is torn down on every exit path.
    pub async fn run(mut self) -> protocol::Result<()> {
        info!(peer = %self.peer, "Client connected");

        let (mut reader, writer) = self.stream.into_split();
        let control: ControlWriter = Arc::new(Mutex::new(writer));

        // Frame reads happen in their own task so the select loop below
        // never cancels a half-read header.
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<protocol::Result<Message>>(1);
        tokio::spawn(async move {
            loop {
                let result = protocol::read_message(&mut reader).await;
                let closing = result.is_err();
                if cmd_tx.send(result).await.is_err() || closing {
                    return;
                }
            }
        });

        let result = loop {
            tokio::select! {
                incoming = cmd_rx.recv() => {
                    match incoming {
                        Some(Ok(message)) => {
                            match self.dispatcher.dispatch(&message, &control).await {
                                Action::Reply(reply) => {
                                    if let Err(e) = send_control(&control, &reply).await {
                                        break Err(e);
                                    }
                                }
                                Action::Exit(reply) => {
                                    let _ = send_control(&control, &reply).await;
                                    break Ok(());
                                }
                            }
                        }
                        Some(Err(ProtocolError::ConnectionClosed(reason))) => {
                            debug!(peer = %self.peer, reason = %reason, "Client disconnected");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            warn!(peer = %self.peer, error = %e, "Dropping client");
                            break Err(e);
                        }
                        None => break Ok(()),
                    }
                }
                event = self.notify_rx.recv() => {
                    if event.is_none() {
                        continue;
                    }
                    for note in self.dispatcher.collect_notifications() {
                        if send_control(&control, &note).await.is_err() {
                            break;
                        }
                    }
                }
            }
        };

        self.dispatcher.disconnect();
        info!(peer = %self.peer, user = %self.dispatcher.session().username(), "Connection closed");
        result
    }
}
