//! Broker IPC service.
//!
//! Listens on a Unix domain socket, decodes [`BrokerRequest`] frames,
//! dispatches them to the filesystem and account layers, and answers with
//! [`BrokerResponse`] frames. Per-request failures are logged and reported
//! to the caller; they never take the service down.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use protocol::{
    broker, BrokerCommand, BrokerPayload, BrokerRequest, BrokerResponse, CallerIdentity,
};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::accounts::{provision_user, AccountError, AccountStore};
use crate::fsops::{FileOps, FsError, ReadChunk};
use crate::sandbox::SandboxError;

/// Errors raised by the broker service itself (not per-request failures).
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Could not bind the listening socket.
    #[error("failed to bind broker socket {path}: {source}")]
    Bind {
        /// The socket path.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Accept loop failed.
    #[error("accept failed: {0}")]
    Accept(std::io::Error),
}

/// The privileged broker service.
pub struct BrokerService<S: AccountStore> {
    listener: UnixListener,
    ops: Arc<FileOps>,
    accounts: Arc<S>,
}

impl<S: AccountStore> BrokerService<S> {
    /// Bind the service socket, replacing a stale socket file if present.
    pub fn bind(socket_path: &Path, ops: FileOps, accounts: S) -> Result<Self, ServiceError> {
        if socket_path.exists() {
            // Stale socket from a previous run
            let _ = std::fs::remove_file(socket_path);
        }

        let listener = UnixListener::bind(socket_path).map_err(|source| ServiceError::Bind {
            path: socket_path.to_path_buf(),
            source,
        })?;

        info!(socket = %socket_path.display(), "Broker listening");

        Ok(Self {
            listener,
            ops: Arc::new(ops),
            accounts: Arc::new(accounts),
        })
    }

    /// Run the accept loop until the task is cancelled.
    pub async fn run(self) -> Result<(), ServiceError> {
        loop {
            let (stream, _) = self.listener.accept().await.map_err(ServiceError::Accept)?;
            let handler = RequestHandler {
                ops: self.ops.clone(),
                accounts: self.accounts.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = handler.serve_connection(stream).await {
                    debug!(error = %e, "Broker connection ended");
                }
            });
        }
    }
}

struct RequestHandler<S: AccountStore> {
    ops: Arc<FileOps>,
    accounts: Arc<S>,
}

impl<S: AccountStore> RequestHandler<S> {
    async fn serve_connection(&self, mut stream: UnixStream) -> protocol::Result<()> {
        loop {
            let request = match broker::read_request(&mut stream).await {
                Ok(request) => request,
                Err(protocol::ProtocolError::ConnectionClosed(_)) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "Malformed broker request");
                    return Err(e);
                }
            };

            let command = request.command;
            debug!(command = ?command, caller = %request.caller.username, "Broker request");

            let response = self.dispatch(request).await;
            if !response.is_ok() {
                debug!(command = ?command, message = %response.message, "Broker request failed");
            }
            broker::write_response(&mut stream, &response).await?;
        }
    }

    async fn dispatch(&self, request: BrokerRequest) -> BrokerResponse {
        let command = request.command;
        match self.try_dispatch(request).await {
            Ok(response) => response,
            Err(message) => BrokerResponse::err(command, message),
        }
    }

    async fn try_dispatch(&self, request: BrokerRequest) -> Result<BrokerResponse, String> {
        let command = request.command;
        let caller = &request.caller;

        match command {
            BrokerCommand::Login => {
                let username = arg(&request, 0)?;
                let identity = self
                    .accounts
                    .lookup(username)
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("user does not exist: {}", username))?;
                Ok(
                    BrokerResponse::ok(command, "Login successful").with_payload(
                        BrokerPayload::Login {
                            uid: identity.uid,
                            gid: identity.gid,
                            home: username.to_string(),
                        },
                    ),
                )
            }
            BrokerCommand::CreateUser => {
                let username = arg(&request, 0)?;
                provision_user(
                    self.accounts.as_ref(),
                    self.ops.confinement().root(),
                    username,
                )
                .await
                .map_err(account_message)?;
                if let Some(mode) = request.args.get(1) {
                    let owner = CallerIdentity {
                        uid: 0,
                        gid: 0,
                        username: username.to_string(),
                        home: username.to_string(),
                        workdir: "/".to_string(),
                    };
                    self.ops.chmod(&owner, mode, ".").await.map_err(fs_message)?;
                }
                Ok(BrokerResponse::ok(command, "User created successfully"))
            }
            BrokerCommand::RemoveUser => {
                let username = arg(&request, 0)?;
                self.accounts
                    .remove(username)
                    .await
                    .map_err(account_message)?;
                Ok(BrokerResponse::ok(command, "User removed"))
            }
            BrokerCommand::ListDir => {
                let path = arg(&request, 0)?;
                let entries = self
                    .ops
                    .list_dir(caller, path)
                    .await
                    .map_err(fs_message)?;
                Ok(BrokerResponse::ok(command, "")
                    .with_payload(BrokerPayload::Entries(entries)))
            }
            BrokerCommand::ChangeDir => {
                let path = arg(&request, 0)?;
                let workdir = self
                    .ops
                    .change_dir(caller, path)
                    .await
                    .map_err(fs_message)?;
                Ok(BrokerResponse::ok(command, "").with_payload(BrokerPayload::Cwd(workdir)))
            }
            BrokerCommand::Create => {
                let path = arg(&request, 0)?;
                let directory = request.args.iter().skip(1).any(|a| a == "-d");
                let mode = request.args.get(1).filter(|a| a.as_str() != "-d");
                self.ops
                    .create(caller, path, directory)
                    .await
                    .map_err(fs_message)?;
                if let Some(mode) = mode {
                    self.ops.chmod(caller, mode, path).await.map_err(fs_message)?;
                }
                Ok(BrokerResponse::ok(
                    command,
                    if directory {
                        "Directory created"
                    } else {
                        "File created"
                    },
                ))
            }
            BrokerCommand::Chmod => {
                let mode = arg(&request, 0)?;
                let path = arg(&request, 1)?;
                self.ops
                    .chmod(caller, mode, path)
                    .await
                    .map_err(fs_message)?;
                Ok(BrokerResponse::ok(command, "Permissions changed"))
            }
            BrokerCommand::Delete => {
                let path = arg(&request, 0)?;
                self.ops.delete(caller, path).await.map_err(fs_message)?;
                Ok(BrokerResponse::ok(command, "Deleted"))
            }
            BrokerCommand::Move => {
                let src = arg(&request, 0)?;
                let dstdir = arg(&request, 1)?;
                self.ops
                    .rename_into(caller, src, dstdir)
                    .await
                    .map_err(fs_message)?;
                Ok(BrokerResponse::ok(command, "Moved"))
            }
            BrokerCommand::Read => {
                let path = arg(&request, 0)?;
                match self
                    .ops
                    .read_chunk(caller, path, request.offset)
                    .await
                    .map_err(fs_message)?
                {
                    ReadChunk::EmptyFile => Ok(BrokerResponse::ok(command, "File is empty")),
                    ReadChunk::Data(data) => {
                        Ok(BrokerResponse::ok(command, "")
                            .with_payload(BrokerPayload::Data(data)))
                    }
                }
            }
            BrokerCommand::Write => {
                let path = arg(&request, 0)?;
                let written = self
                    .ops
                    .write_chunk(caller, path, request.offset, &request.data)
                    .await
                    .map_err(fs_message)?;
                Ok(BrokerResponse::ok(
                    command,
                    format!("Wrote {} bytes", written),
                ))
            }
            BrokerCommand::CopyTransfer => {
                let filename = arg(&request, 0)?;
                let dstdir = arg(&request, 1)?;
                let receiver_name = arg(&request, 2)?;

                let receiver_identity = self
                    .accounts
                    .lookup(receiver_name)
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("user does not exist: {}", receiver_name))?;
                let receiver = CallerIdentity {
                    uid: receiver_identity.uid,
                    gid: receiver_identity.gid,
                    username: receiver_name.to_string(),
                    home: receiver_name.to_string(),
                    workdir: "/".to_string(),
                };

                let copied = self
                    .ops
                    .copy_transfer(caller, &receiver, filename, dstdir)
                    .await
                    .map_err(fs_message)?;
                Ok(BrokerResponse::ok(
                    command,
                    format!("Transfer completed: {} bytes", copied),
                ))
            }
        }
    }
}

fn arg<'a>(request: &'a BrokerRequest, index: usize) -> Result<&'a str, String> {
    request
        .args
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| format!("missing argument {} for {:?}", index, request.command))
}

fn fs_message(error: FsError) -> String {
    match error {
        FsError::Sandbox(SandboxError::NotFound(_)) => "No such file or directory".to_string(),
        FsError::Sandbox(SandboxError::ParentComponent(_) | SandboxError::Escape(_)) => {
            "Path not allowed".to_string()
        }
        other => other.to_string(),
    }
}

fn account_message(error: AccountError) -> String {
    match error {
        AccountError::AlreadyExists(_) => "User already exists".to_string(),
        AccountError::NotFound(_) => "User does not exist".to_string(),
        other => {
            error!(error = %other, "Account operation failed");
            "Account operation failed".to_string()
        }
    }
}
