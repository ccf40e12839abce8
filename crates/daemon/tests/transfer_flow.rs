//! End-to-end tests: real broker service, real daemon server, wire-level
//! clients.

use std::net::SocketAddr;
use std::time::Duration;

use broker::{BrokerService, Confinement, FileOps, MemoryAccounts};
use daemon::config::Config;
use daemon::server::Server;
use protocol::{listing, DataChannelHandshake, Message, MessageType};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct Stack {
    addr: SocketAddr,
    _temp: TempDir,
}

async fn start_stack() -> Stack {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    std::fs::create_dir(&root).unwrap();

    let socket = temp.path().join("broker.sock");
    let ops = FileOps::new(Confinement::new(&root).unwrap());
    let service = BrokerService::bind(&socket, ops, MemoryAccounts::new()).unwrap();
    tokio::spawn(service.run());

    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1".to_string();
    config.server.port = 0;
    config.broker.socket_path = socket;
    config.storage.root = root;
    config.registry.transfer_wait_secs = 2;

    let server = Server::bind(&config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    Stack { addr, _temp: temp }
}

async fn connect(stack: &Stack) -> TcpStream {
    TcpStream::connect(stack.addr).await.unwrap()
}

async fn send(stream: &mut TcpStream, line: &str) -> Message {
    let request = Message::new(MessageType::Command, line.as_bytes().to_vec());
    protocol::write_message(stream, &request).await.unwrap();
    protocol::read_message(stream).await.unwrap()
}

async fn send_write(stream: &mut TcpStream, line: &str, data: &[u8]) -> Message {
    let mut payload = line.as_bytes().to_vec();
    payload.push(0);
    payload.extend_from_slice(data);
    let request = Message::new(MessageType::Command, payload);
    protocol::write_message(stream, &request).await.unwrap();
    protocol::read_message(stream).await.unwrap()
}

#[tokio::test]
async fn test_user_lifecycle() {
    let stack = start_stack().await;
    let mut client = connect(&stack).await;

    let reply = send(&mut client, "create_user carol 750").await;
    assert!(reply.is_ok(), "{}", reply.payload_text());
    assert_eq!(reply.payload_text(), "User created successfully");

    let reply = send(&mut client, "login carol").await;
    assert_eq!(reply.payload_text(), "Login successful");

    let reply = send_write(&mut client, "write notes.txt", b"hello world").await;
    assert_eq!(reply.payload_text(), "Wrote 11 bytes");

    let reply = send(&mut client, "read notes.txt").await;
    assert_eq!(reply.msg_type, MessageType::ReadData);
    assert_eq!(reply.payload, b"hello world");

    let reply = send(&mut client, "ls").await;
    assert_eq!(reply.msg_type, MessageType::ListEntries);
    let entries = listing::decode_entries(&reply.payload).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "notes.txt");
    assert_eq!(entries[0].size, 11);

    let reply = send(&mut client, "exit").await;
    assert_eq!(reply.payload_text(), "Goodbye");
}

#[tokio::test]
async fn test_concurrent_logins_same_user() {
    let stack = start_stack().await;

    let mut setup = connect(&stack).await;
    send(&mut setup, "create_user dave 700").await;
    send(&mut setup, "create_user eve 700").await;
    drop(setup);

    let mut first = connect(&stack).await;
    let reply = send(&mut first, "login dave").await;
    assert!(reply.is_ok());

    let mut second = connect(&stack).await;
    let reply = send(&mut second, "login dave").await;
    assert!(reply.is_ok(), "{}", reply.payload_text());
    assert_eq!(reply.payload_text(), "Login successful");

    // Disconnecting the first session must not evict the second
    let reply = send(&mut first, "exit").await;
    assert_eq!(reply.payload_text(), "Goodbye");
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut eve = connect(&stack).await;
    send(&mut eve, "login eve").await;
    let reply = send(&mut eve, "transfer_request f.txt dave").await;
    assert!(reply.is_ok(), "{}", reply.payload_text());
    assert_eq!(reply.payload_text(), "Transfer request #1 sent to dave");

    // The remaining session receives the notification
    let note = protocol::read_message(&mut second).await.unwrap();
    assert!(note.payload_text().starts_with("Transfer request #1:"));
}

#[tokio::test]
async fn test_transfer_accept_flow() {
    let stack = start_stack().await;

    let mut setup = connect(&stack).await;
    send(&mut setup, "create_user alice 700").await;
    send(&mut setup, "create_user bob 700").await;
    drop(setup);

    let mut alice = connect(&stack).await;
    send(&mut alice, "login alice").await;
    send_write(&mut alice, "write report.txt", b"quarterly numbers").await;

    let mut bob = connect(&stack).await;
    send(&mut bob, "login bob").await;

    let reply = send(&mut alice, "transfer_request report.txt bob").await;
    assert!(reply.is_ok(), "{}", reply.payload_text());
    assert_eq!(reply.payload_text(), "Transfer request #1 sent to bob");

    let note = protocol::read_message(&mut bob).await.unwrap();
    assert_eq!(
        note.payload_text(),
        "Transfer request #1: alice wants to send you 'report.txt' (accept/reject)"
    );

    let reply = send(&mut bob, "accept . 1").await;
    assert!(reply.is_ok(), "{}", reply.payload_text());
    assert_eq!(reply.payload_text(), "Transfer completed: 17 bytes");

    let reply = send(&mut bob, "read report.txt").await;
    assert_eq!(reply.payload, b"quarterly numbers");

    // The ticket is freed once consumed
    let reply = send(&mut bob, "accept . 1").await;
    assert!(!reply.is_ok());
    assert_eq!(reply.payload_text(), "Request ID not found");
}

#[tokio::test]
async fn test_transfer_reject_flow() {
    let stack = start_stack().await;

    let mut setup = connect(&stack).await;
    send(&mut setup, "create_user alice 700").await;
    send(&mut setup, "create_user bob 700").await;
    drop(setup);

    let mut alice = connect(&stack).await;
    send(&mut alice, "login alice").await;
    let mut bob = connect(&stack).await;
    send(&mut bob, "login bob").await;

    send(&mut alice, "transfer_request secrets.txt bob").await;
    let note = protocol::read_message(&mut bob).await.unwrap();
    assert!(note.payload_text().starts_with("Transfer request #1:"));

    let reply = send(&mut bob, "reject 1").await;
    assert_eq!(reply.payload_text(), "Transfer request #1 rejected");

    let note = protocol::read_message(&mut alice).await.unwrap();
    assert_eq!(
        note.payload_text(),
        "Transfer request #1 was rejected by bob"
    );

    // Rejection delivery freed the ticket
    let reply = send(&mut bob, "reject 1").await;
    assert!(!reply.is_ok());
    assert_eq!(reply.payload_text(), "Request ID not found");
}

#[tokio::test]
async fn test_transfer_request_to_offline_user_times_out() {
    let stack = start_stack().await;

    let mut setup = connect(&stack).await;
    send(&mut setup, "create_user alice 700").await;
    drop(setup);

    let mut alice = connect(&stack).await;
    send(&mut alice, "login alice").await;

    // Nobody named zoe is online; the bounded wait expires
    let reply = send(&mut alice, "transfer_request f.txt zoe").await;
    assert!(!reply.is_ok());
    assert_eq!(reply.payload_text(), "User is not online");
}

#[tokio::test]
async fn test_download_delivers_reported_byte_count() {
    let stack = start_stack().await;

    let mut client = connect(&stack).await;
    send(&mut client, "create_user erin 700").await;
    send(&mut client, "login erin").await;

    // Larger than one chunk so the stream spans several broker reads
    let content: Vec<u8> = (0..9500u32).map(|i| (i % 251) as u8).collect();
    let reply = send_write(&mut client, "write big.bin", &content).await;
    assert_eq!(reply.payload_text(), "Wrote 9500 bytes");

    let reply = send(&mut client, "download big.bin local.bin").await;
    assert!(reply.is_ok(), "{}", reply.payload_text());
    assert_eq!(reply.msg_type, MessageType::DownloadReady);
    let handshake = DataChannelHandshake::parse(&reply.payload_text()).unwrap();
    assert_eq!(handshake.path, "local.bin");

    let mut data = TcpStream::connect(("127.0.0.1", handshake.port))
        .await
        .unwrap();
    let mut received = Vec::new();
    data.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, content);

    let status = protocol::read_message(&mut client).await.unwrap();
    assert!(status.is_ok());
    assert_eq!(status.payload_text(), "Download complete: 9500 bytes");
}

#[tokio::test]
async fn test_background_upload_blocks_exit_until_done() {
    let stack = start_stack().await;

    let mut client = connect(&stack).await;
    send(&mut client, "create_user frank 700").await;
    send(&mut client, "login frank").await;

    let reply = send(&mut client, "upload local.txt incoming.txt -b").await;
    assert_eq!(reply.msg_type, MessageType::UploadReady);
    assert!(reply.background);
    let handshake = DataChannelHandshake::parse(&reply.payload_text()).unwrap();

    // The transfer is still open, so exit is refused
    let reply = send(&mut client, "exit").await;
    assert!(!reply.is_ok());
    assert_eq!(reply.payload_text(), "Background transfer still in progress");

    let mut data = TcpStream::connect(("127.0.0.1", handshake.port))
        .await
        .unwrap();
    data.write_all(b"uploaded bytes").await.unwrap();
    data.shutdown().await.unwrap();
    drop(data);

    let status = protocol::read_message(&mut client).await.unwrap();
    assert!(status.background);
    assert_eq!(status.payload_text(), "Upload complete: 14 bytes");

    let reply = send(&mut client, "read incoming.txt").await;
    assert_eq!(reply.payload, b"uploaded bytes");

    let reply = send(&mut client, "exit").await;
    assert!(reply.is_ok());
    assert_eq!(reply.payload_text(), "Goodbye");
}
