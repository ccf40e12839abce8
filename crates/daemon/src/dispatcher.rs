//! Per-connection command dispatcher.
//!
//! Owns the session state machine for one control connection: tokenizes
//! command lines, gates them on authentication, forwards filesystem work to
//! the broker with the session's identity, and drives the registry for the
//! transfer workflow. Foreground commands produce exactly one reply; data
//! channel commands reply with the handshake and leave the final status to
//! the channel worker.

use std::sync::Arc;
use std::time::Duration;

use protocol::{
    listing, BrokerCommand, BrokerPayload, BrokerRequest, BrokerResponse, CallerIdentity, Message,
    MessageType,
};
use tracing::{debug, info};

use crate::broker_client::BrokerClient;
use crate::connection::ControlWriter;
use crate::datachannel::{self, Direction};
use crate::notify::NotifySender;
use crate::registry::SharedRegistry;
use crate::session::ClientSession;

/// Maximum number of whitespace tokens taken from a command line; the rest
/// of the line is ignored.
pub const MAX_ARGS: usize = 5;

/// Interval between registry polls while waiting for a transfer receiver.
const TRANSFER_POLL: Duration = Duration::from_secs(1);

/// What the connection loop should do with a dispatched command.
#[derive(Debug)]
pub enum Action {
    /// Write the reply and keep serving.
    Reply(Message),
    /// Write the reply, then close the connection.
    Exit(Message),
}

/// Command dispatcher for one client connection.
pub struct Dispatcher {
    session: ClientSession,
    registry: Arc<SharedRegistry>,
    broker: BrokerClient,
    notify_tx: NotifySender,
    data_bind_addr: String,
    transfer_wait: Duration,
}

impl Dispatcher {
    /// Create a dispatcher for a fresh, unauthenticated connection.
    pub fn new(
        registry: Arc<SharedRegistry>,
        broker: BrokerClient,
        notify_tx: NotifySender,
        data_bind_addr: String,
        transfer_wait: Duration,
    ) -> Self {
        Self {
            session: ClientSession::new(),
            registry,
            broker,
            notify_tx,
            data_bind_addr,
            transfer_wait,
        }
    }

    /// The session this dispatcher drives.
    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// Dispatch one command message and return the action for the
    /// connection loop. Every reply echoes the request's background flag.
    pub async fn dispatch(&mut self, request: &Message, control: &ControlWriter) -> Action {
        let background = request.background;
        let payload = &request.payload;

        // The command line runs up to the first NUL; anything after the
        // separator is raw data (used by `write`).
        let split = payload.iter().position(|&b| b == 0);
        let (line_bytes, data) = match split {
            Some(at) => (&payload[..at], &payload[at + 1..]),
            None => (&payload[..], &[][..]),
        };
        let line = String::from_utf8_lossy(line_bytes).into_owned();
        let tokens = tokenize(&line);

        let Some(&command) = tokens.first() else {
            return Action::Reply(Message::error("Unknown command").with_background(background));
        };

        debug!(command = %command, user = %self.session.username(), "Dispatching");

        if !self.session.is_logged_in() && !matches!(command, "login" | "create_user" | "exit") {
            return Action::Reply(
                Message::error("You must login first").with_background(background),
            );
        }

        let args = &tokens[1..];
        let result = match command {
            "login" => self.cmd_login(args).await,
            "create_user" => self.cmd_create_user(args).await,
            "ls" => self.cmd_ls(args).await,
            "cd" => self.cmd_cd(args).await,
            "create" => self.cmd_create(args).await,
            "chmod" => self.cmd_chmod(args).await,
            "delete" => self.cmd_delete(args).await,
            "move" => self.cmd_move(args).await,
            "read" => self.cmd_read(args).await,
            "write" => self.cmd_write(args, data).await,
            "download" => {
                self.cmd_transfer(args, Direction::Download, background, control)
                    .await
            }
            "upload" => {
                self.cmd_transfer(args, Direction::Upload, background, control)
                    .await
            }
            "transfer_request" => self.cmd_transfer_request(args).await,
            "accept" => self.cmd_accept(args).await,
            "reject" => self.cmd_reject(args).await,
            "exit" => {
                return if self.session.has_background_ops() {
                    Action::Reply(
                        Message::error("Background transfer still in progress")
                            .with_background(background),
                    )
                } else {
                    Action::Exit(Message::text("Goodbye").with_background(background))
                };
            }
            _ => Err("Unknown command".to_string()),
        };

        let reply = match result {
            Ok(message) => message,
            Err(text) => Message::error(text),
        };
        // A `-b` token may have marked the reply background even when the
        // request frame was not
        let flag = reply.background || background;
        Action::Reply(reply.with_background(flag))
    }

    /// Drain the registry notifications due for this session as text
    /// messages ready to be written to the client.
    pub fn collect_notifications(&self) -> Vec<Message> {
        if !self.session.is_logged_in() {
            return Vec::new();
        }
        self.registry
            .collect_notifications(self.session.username())
            .into_iter()
            .map(|n| Message::text(n.to_text()))
            .collect()
    }

    /// Tear down the session's registry state on disconnect.
    pub fn disconnect(&self) {
        if self.session.is_logged_in() {
            self.registry
                .deactivate(self.session.username(), self.session.registry_session);
        }
    }

    async fn cmd_login(&mut self, args: &[&str]) -> Result<Message, String> {
        if self.session.is_logged_in() {
            return Err("Already logged in".to_string());
        }
        let username = required(args, 0, "usage: login <user>")?;
        if !valid_username(username) {
            return Err("Invalid username".to_string());
        }

        let caller = CallerIdentity {
            username: username.to_string(),
            home: username.to_string(),
            workdir: "/".to_string(),
            ..CallerIdentity::default()
        };
        let response = self
            .call(BrokerRequest::new(BrokerCommand::Login, caller).with_args([username]))
            .await?;

        let BrokerPayload::Login { uid, gid, home } = response.payload else {
            return Err("Login failed".to_string());
        };

        let registry_session = self
            .registry
            .register(username, self.notify_tx.clone())
            .map_err(|e| e.to_string())?;

        let identity = CallerIdentity {
            uid,
            gid,
            username: username.to_string(),
            home,
            workdir: "/".to_string(),
        };
        self.session.login(identity, registry_session);
        info!(username = %username, "Client logged in");

        Ok(Message::text(response.message))
    }

    async fn cmd_create_user(&mut self, args: &[&str]) -> Result<Message, String> {
        let username = required(args, 0, "usage: create_user <user> <mode>")?;
        let mode = required(args, 1, "usage: create_user <user> <mode>")?;
        if !valid_username(username) {
            return Err("Invalid username".to_string());
        }

        let request = BrokerRequest::new(BrokerCommand::CreateUser, CallerIdentity::default())
            .with_args([username, mode]);
        let response = self.call(request).await?;
        Ok(Message::text(response.message))
    }

    async fn cmd_ls(&mut self, args: &[&str]) -> Result<Message, String> {
        // The default listing target is the cwd spelled from the shared
        // root, so other users' top-level directories stay browsable via
        // absolute paths.
        let path = match args.first() {
            Some(&path) => path.to_string(),
            None => format!(
                "/{}{}",
                self.session.username(),
                self.session.identity.workdir
            ),
        };

        let request = self.identified(BrokerCommand::ListDir).with_args([path]);
        let response = self.call(request).await?;

        match response.payload {
            BrokerPayload::Entries(entries) if entries.is_empty() => {
                Ok(Message::text("Directory is empty"))
            }
            BrokerPayload::Entries(entries) => Ok(Message::new(
                MessageType::ListEntries,
                listing::encode_entries(&entries),
            )),
            other => Err(format!("unexpected listing payload: {:?}", other)),
        }
    }

    async fn cmd_cd(&mut self, args: &[&str]) -> Result<Message, String> {
        let path = required(args, 0, "usage: cd <path>")?;
        let request = self.identified(BrokerCommand::ChangeDir).with_args([path]);
        let response = self.call(request).await?;

        let BrokerPayload::Cwd(workdir) = response.payload else {
            return Err("Could not change directory".to_string());
        };
        self.session.identity.workdir = workdir.clone();
        Ok(Message::text(workdir))
    }

    async fn cmd_create(&mut self, args: &[&str]) -> Result<Message, String> {
        required(args, 0, "usage: create <path> <mode> [-d]")?;
        required(args, 1, "usage: create <path> <mode> [-d]")?;
        let request = self
            .identified(BrokerCommand::Create)
            .with_args(args.iter().take(3).copied());
        let response = self.call(request).await?;
        Ok(Message::text(response.message))
    }

    async fn cmd_chmod(&mut self, args: &[&str]) -> Result<Message, String> {
        let path = required(args, 0, "usage: chmod <path> <mode>")?;
        let mode = required(args, 1, "usage: chmod <path> <mode>")?;
        // Broker takes the mode first
        let request = self.identified(BrokerCommand::Chmod).with_args([mode, path]);
        let response = self.call(request).await?;
        Ok(Message::text(response.message))
    }

    async fn cmd_delete(&mut self, args: &[&str]) -> Result<Message, String> {
        let path = required(args, 0, "usage: delete <path>")?;
        let request = self.identified(BrokerCommand::Delete).with_args([path]);
        let response = self.call(request).await?;
        Ok(Message::text(response.message))
    }

    async fn cmd_move(&mut self, args: &[&str]) -> Result<Message, String> {
        let src = required(args, 0, "usage: move <src> <dstdir>")?;
        let dst = required(args, 1, "usage: move <src> <dstdir>")?;
        let request = self.identified(BrokerCommand::Move).with_args([src, dst]);
        let response = self.call(request).await?;
        Ok(Message::text(response.message))
    }

    async fn cmd_read(&mut self, args: &[&str]) -> Result<Message, String> {
        let (offset, rest) = parse_offset(args)?;
        let path = required(&rest, 0, "usage: read [-offset=N] <file>")?;

        let request = self
            .identified(BrokerCommand::Read)
            .with_args([path])
            .with_offset(offset);
        let response = self.call(request).await?;

        match response.payload {
            BrokerPayload::Data(data) => Ok(Message::new(MessageType::ReadData, data)),
            BrokerPayload::None => Ok(Message::text(response.message)),
            other => Err(format!("unexpected read payload: {:?}", other)),
        }
    }

    async fn cmd_write(&mut self, args: &[&str], data: &[u8]) -> Result<Message, String> {
        let (offset, rest) = parse_offset(args)?;
        let path = required(&rest, 0, "usage: write [-offset=N] <file>")?;

        let request = self
            .identified(BrokerCommand::Write)
            .with_args([path])
            .with_offset(offset)
            .with_data(data.to_vec());
        let response = self.call(request).await?;
        Ok(Message::text(response.message))
    }

    async fn cmd_transfer(
        &mut self,
        args: &[&str],
        direction: Direction,
        background: bool,
        control: &ControlWriter,
    ) -> Result<Message, String> {
        let usage = match direction {
            Direction::Download => "usage: download <serverPath> <clientPath> [-b]",
            Direction::Upload => "usage: upload <clientPath> <serverPath> [-b]",
        };
        let first = required(args, 0, usage)?;
        let second = required(args, 1, usage)?;
        let background = background || args.get(2).copied() == Some("-b");

        // The client names its local file first on upload, second on
        // download; the broker always streams the server-side path.
        let (server_path, client_path) = match direction {
            Direction::Download => (first, second),
            Direction::Upload => (second, first),
        };

        let bg_guard = background.then(|| self.session.begin_background_op());
        let channel = datachannel::open(
            direction,
            &self.data_bind_addr,
            server_path.to_string(),
            client_path.to_string(),
            self.session.identity.clone(),
            self.broker.clone(),
            control.clone(),
            background,
            bg_guard,
        )
        .await
        .map_err(|e| format!("Could not open data channel: {}", e))?;

        Ok(channel.handshake)
    }

    async fn cmd_transfer_request(&mut self, args: &[&str]) -> Result<Message, String> {
        let filename = required(args, 0, "usage: transfer_request <file> <user>")?;
        let receiver = required(args, 1, "usage: transfer_request <file> <user>")?;
        if !valid_username(receiver) {
            return Err("Invalid username".to_string());
        }

        // Bounded poll for the receiver to come online; holds this
        // connection but nothing else.
        let mut waited = Duration::ZERO;
        while !self.registry.is_online(receiver) && waited < self.transfer_wait {
            tokio::time::sleep(TRANSFER_POLL).await;
            waited += TRANSFER_POLL;
        }

        let id = self
            .registry
            .create_ticket(self.session.username(), receiver, filename)
            .map_err(|e| e.to_string())?;

        Ok(Message::text(format!(
            "Transfer request #{} sent to {}",
            id, receiver
        )))
    }

    async fn cmd_accept(&mut self, args: &[&str]) -> Result<Message, String> {
        let dstdir = required(args, 0, "usage: accept <dstdir> <id>")?;
        let id = required(args, 1, "usage: accept <dstdir> <id>")?
            .parse::<u64>()
            .map_err(|_| "Invalid request id".to_string())?;

        let ticket = self
            .registry
            .accept_ticket(id, self.session.username())
            .map_err(|e| e.to_string())?;

        // The copy reads from the sender's home, so the broker acts for
        // the sender; the receiver is named as the third argument.
        let sender = CallerIdentity {
            username: ticket.sender.clone(),
            home: ticket.sender.clone(),
            workdir: "/".to_string(),
            ..CallerIdentity::default()
        };
        let request = BrokerRequest::new(BrokerCommand::CopyTransfer, sender).with_args([
            ticket.filename.as_str(),
            dstdir,
            self.session.username(),
        ]);
        let response = self.call(request).await?;
        Ok(Message::text(response.message))
    }

    async fn cmd_reject(&mut self, args: &[&str]) -> Result<Message, String> {
        let id = required(args, 0, "usage: reject <id>")?
            .parse::<u64>()
            .map_err(|_| "Invalid request id".to_string())?;

        self.registry
            .reject_ticket(id, self.session.username())
            .map_err(|e| e.to_string())?;
        Ok(Message::text(format!("Transfer request #{} rejected", id)))
    }

    fn identified(&self, command: BrokerCommand) -> BrokerRequest {
        BrokerRequest::new(command, self.session.identity.clone())
    }

    /// Call the broker and fold transport failures and error replies into
    /// the reply text.
    async fn call(&self, request: BrokerRequest) -> Result<BrokerResponse, String> {
        let response = self.broker.call(request).await.map_err(|e| e.to_string())?;
        if !response.is_ok() {
            return Err(response.message);
        }
        Ok(response)
    }
}

/// Split a command line on whitespace, keeping at most [`MAX_ARGS`] tokens.
fn tokenize(line: &str) -> Vec<&str> {
    line.split_whitespace().take(MAX_ARGS).collect()
}

/// Username rule: non-empty, at most 20 characters, ASCII letters only.
fn valid_username(name: &str) -> bool {
    !name.is_empty() && name.len() <= 20 && name.bytes().all(|b| b.is_ascii_alphabetic())
}

/// Parse a leading `-offset=N` flag, returning the offset and the
/// remaining tokens.
fn parse_offset<'a>(args: &[&'a str]) -> Result<(u64, Vec<&'a str>), String> {
    match args.first().and_then(|a| a.strip_prefix("-offset=")) {
        Some(value) => {
            let offset = value
                .parse::<u64>()
                .map_err(|_| "Invalid offset".to_string())?;
            Ok((offset, args[1..].to_vec()))
        }
        None => Ok((0, args.to_vec())),
    }
}

fn required<'a>(args: &[&'a str], index: usize, usage: &str) -> Result<&'a str, String> {
    args.get(index).copied().ok_or_else(|| usage.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify;
    use broker::{AccountIdentity, BrokerService, Confinement, FileOps, MemoryAccounts};
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_tokenize_caps_tokens() {
        let tokens = tokenize("a b c d e f g");
        assert_eq!(tokens, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_valid_username() {
        assert!(valid_username("alice"));
        assert!(valid_username("Bob"));
        assert!(!valid_username(""));
        assert!(!valid_username("alice1"));
        assert!(!valid_username("al ice"));
        assert!(!valid_username("abcdefghijklmnopqrstu"));
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(
            parse_offset(&["-offset=42", "f"]).unwrap(),
            (42, vec!["f"])
        );
        assert_eq!(parse_offset(&["f"]).unwrap(), (0, vec!["f"]));
        assert!(parse_offset(&["-offset=x", "f"]).is_err());
    }

    struct Harness {
        dispatcher: Dispatcher,
        control: ControlWriter,
        _control_peer: TcpStream,
        _temp: TempDir,
    }

    async fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir(root.join("alice")).unwrap();
        std::fs::write(root.join("alice/hello.txt"), "hi there").unwrap();

        let accounts = MemoryAccounts::new();
        accounts.insert("alice", AccountIdentity { uid: 1000, gid: 1000 });
        accounts.insert("bob", AccountIdentity { uid: 1001, gid: 1001 });
        std::fs::create_dir(root.join("bob")).unwrap();

        let socket: PathBuf = temp.path().join("broker.sock");
        let ops = FileOps::new(Confinement::new(&root).unwrap());
        let service = BrokerService::bind(&socket, ops, accounts).unwrap();
        tokio::spawn(service.run());

        let registry = Arc::new(SharedRegistry::new(20, 20));
        let broker = BrokerClient::new(socket, Duration::from_secs(5));
        let (notify_tx, _notify_rx) = notify::channel();
        let dispatcher = Dispatcher::new(
            registry,
            broker,
            notify_tx,
            "127.0.0.1".to_string(),
            Duration::from_secs(2),
        );

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();

        Harness {
            dispatcher,
            control: Arc::new(tokio::sync::Mutex::new(write)),
            _control_peer: peer,
            _temp: temp,
        }
    }

    async fn run(h: &mut Harness, line: &str) -> Message {
        let request = Message::new(MessageType::Command, line.as_bytes().to_vec());
        match h.dispatcher.dispatch(&request, &h.control).await {
            Action::Reply(m) | Action::Exit(m) => m,
        }
    }

    #[tokio::test]
    async fn test_commands_gated_before_login() {
        let mut h = harness().await;

        let reply = run(&mut h, "ls").await;
        assert!(!reply.is_ok());
        assert_eq!(reply.payload_text(), "You must login first");
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let mut h = harness().await;
        run(&mut h, "login alice").await;

        let reply = run(&mut h, "frobnicate").await;
        assert!(!reply.is_ok());
        assert_eq!(reply.payload_text(), "Unknown command");
    }

    #[tokio::test]
    async fn test_login_success() {
        let mut h = harness().await;

        let reply = run(&mut h, "login alice").await;
        assert!(reply.is_ok());
        assert_eq!(reply.payload_text(), "Login successful");
        assert!(h.dispatcher.session().is_logged_in());
        assert_eq!(h.dispatcher.session().identity.uid, 1000);
    }

    #[tokio::test]
    async fn test_login_invalid_username() {
        let mut h = harness().await;

        let reply = run(&mut h, "login al1ce").await;
        assert!(!reply.is_ok());
        assert_eq!(reply.payload_text(), "Invalid username");
    }

    #[tokio::test]
    async fn test_double_login_rejected() {
        let mut h = harness().await;
        run(&mut h, "login alice").await;

        let reply = run(&mut h, "login alice").await;
        assert!(!reply.is_ok());
        assert_eq!(reply.payload_text(), "Already logged in");
    }

    #[tokio::test]
    async fn test_create_user_requires_mode() {
        let mut h = harness().await;

        let reply = run(&mut h, "create_user dora").await;
        assert!(!reply.is_ok());
        assert_eq!(reply.payload_text(), "usage: create_user <user> <mode>");
    }

    #[tokio::test]
    async fn test_create_user_allowed_while_logged_in() {
        let mut h = harness().await;
        run(&mut h, "login alice").await;

        let reply = run(&mut h, "create_user dora 700").await;
        assert!(reply.is_ok(), "{}", reply.payload_text());
        assert_eq!(reply.payload_text(), "User created successfully");
    }

    #[tokio::test]
    async fn test_ls_defaults_to_cwd() {
        let mut h = harness().await;
        run(&mut h, "login alice").await;

        let reply = run(&mut h, "ls").await;
        assert!(reply.is_ok());
        assert_eq!(reply.msg_type, MessageType::ListEntries);
        let entries = listing::decode_entries(&reply.payload).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "hello.txt");
    }

    #[tokio::test]
    async fn test_ls_empty_directory() {
        let mut h = harness().await;
        run(&mut h, "login alice").await;
        run(&mut h, "create docs 755 -d").await;

        let reply = run(&mut h, "ls docs").await;
        assert!(reply.is_ok());
        assert_eq!(reply.msg_type, MessageType::Text);
        assert_eq!(reply.payload_text(), "Directory is empty");
    }

    #[tokio::test]
    async fn test_cd_updates_workdir() {
        let mut h = harness().await;
        run(&mut h, "login alice").await;
        run(&mut h, "create docs 755 -d").await;

        let reply = run(&mut h, "cd docs").await;
        assert!(reply.is_ok());
        assert_eq!(h.dispatcher.session().identity.workdir, "/docs");
    }

    #[tokio::test]
    async fn test_read_returns_data() {
        let mut h = harness().await;
        run(&mut h, "login alice").await;

        let reply = run(&mut h, "read hello.txt").await;
        assert!(reply.is_ok());
        assert_eq!(reply.msg_type, MessageType::ReadData);
        assert_eq!(reply.payload, b"hi there");
    }

    #[tokio::test]
    async fn test_read_with_offset() {
        let mut h = harness().await;
        run(&mut h, "login alice").await;

        let reply = run(&mut h, "read -offset=3 hello.txt").await;
        assert!(reply.is_ok());
        assert_eq!(reply.payload, b"there");
    }

    #[tokio::test]
    async fn test_write_takes_data_after_nul() {
        let mut h = harness().await;
        run(&mut h, "login alice").await;

        let mut payload = b"write notes.txt".to_vec();
        payload.push(0);
        payload.extend_from_slice(b"remember the milk");
        let request = Message::new(MessageType::Command, payload);
        let reply = match h.dispatcher.dispatch(&request, &h.control).await {
            Action::Reply(m) | Action::Exit(m) => m,
        };
        assert!(reply.is_ok());
        assert_eq!(reply.payload_text(), "Wrote 17 bytes");

        let reply = run(&mut h, "read notes.txt").await;
        assert_eq!(reply.payload, b"remember the milk");
    }

    #[tokio::test]
    async fn test_write_beyond_eof_pads_with_spaces() {
        let mut h = harness().await;
        run(&mut h, "login alice").await;

        let mut payload = b"write -offset=4 gap.txt".to_vec();
        payload.push(0);
        payload.extend_from_slice(b"tail");
        let request = Message::new(MessageType::Command, payload);
        match h.dispatcher.dispatch(&request, &h.control).await {
            Action::Reply(m) | Action::Exit(m) => assert!(m.is_ok()),
        }

        let reply = run(&mut h, "read gap.txt").await;
        assert_eq!(reply.payload, b"    tail");
    }

    #[tokio::test]
    async fn test_exit_refused_during_background_op() {
        let mut h = harness().await;
        run(&mut h, "login alice").await;

        let _guard = h.dispatcher.session.begin_background_op();
        let reply = run(&mut h, "exit").await;
        assert!(!reply.is_ok());
        assert_eq!(reply.payload_text(), "Background transfer still in progress");
    }

    #[tokio::test]
    async fn test_exit_after_background_done() {
        let mut h = harness().await;
        run(&mut h, "login alice").await;

        let guard = h.dispatcher.session.begin_background_op();
        drop(guard);

        let request = Message::new(MessageType::Command, b"exit".to_vec());
        let action = h.dispatcher.dispatch(&request, &h.control).await;
        assert!(matches!(action, Action::Exit(_)));
    }

    #[tokio::test]
    async fn test_background_flag_echoed() {
        let mut h = harness().await;

        let request =
            Message::new(MessageType::Command, b"ls".to_vec()).with_background(true);
        let reply = match h.dispatcher.dispatch(&request, &h.control).await {
            Action::Reply(m) | Action::Exit(m) => m,
        };
        assert!(reply.background);
    }

    #[tokio::test]
    async fn test_reject_missing_ticket() {
        let mut h = harness().await;
        run(&mut h, "login alice").await;

        let reply = run(&mut h, "reject 42").await;
        assert!(!reply.is_ok());
        assert_eq!(reply.payload_text(), "Request ID not found");
    }
}
