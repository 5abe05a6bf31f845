// tests/chat_test.rs

//! End-to-end tests for registration, routing, and groups over real sockets.

mod common;

use common::{TestClient, TestServer};

#[tokio::test]
async fn test_broadcast_reaches_everyone_but_sender() {
    let server = TestServer::start(&[]).await;
    let mut alice = TestClient::join(server.addr, "alice").await;
    let mut bob = TestClient::join(server.addr, "bob").await;
    let mut carol = TestClient::join(server.addr, "carol").await;
    let mut dave = TestClient::join(server.addr, "dave").await;

    assert_eq!(alice.line().await, "Server: bob has joined");
    assert_eq!(alice.line().await, "Server: carol has joined");
    assert_eq!(alice.line().await, "Server: dave has joined");
    assert_eq!(bob.line().await, "Server: carol has joined");
    assert_eq!(bob.line().await, "Server: dave has joined");
    assert_eq!(carol.line().await, "Server: dave has joined");

    bob.send("BROADCAST hello").await;
    for client in [&mut alice, &mut carol, &mut dave] {
        assert_eq!(client.line().await, "[Broadcast] bob: hello");
    }
    bob.expect_quiet().await;

    server.stop().await;
}

#[tokio::test]
async fn test_unicast_unknown_recipient() {
    let server = TestServer::start(&[]).await;
    let mut alice = TestClient::join(server.addr, "alice").await;
    let mut bob = TestClient::join(server.addr, "bob").await;
    assert_eq!(alice.line().await, "Server: bob has joined");

    bob.send("UNICAST nobody hello").await;
    assert_eq!(bob.line().await, "Server: User 'nobody' not found.");
    alice.expect_quiet().await;

    bob.send("UNICAST alice are you there?").await;
    assert_eq!(alice.line().await, "[PM from bob]: are you there?");

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_commands_keep_connection() {
    let server = TestServer::start(&[]).await;
    let mut alice = TestClient::join(server.addr, "alice").await;

    alice.send("UNICAST bob").await;
    assert_eq!(alice.line().await, "Server: Invalid UNICAST format.");
    alice.send("GROUP_MSG devs").await;
    assert_eq!(alice.line().await, "Server: Invalid GROUP_MSG format.");
    alice.send("DOWNLOAD_UDP file.txt notaport").await;
    assert_eq!(alice.line().await, "Server: Invalid DOWNLOAD_UDP format.");

    alice.barrier().await;
    server.stop().await;
}

#[tokio::test]
async fn test_oversized_line_is_discarded() {
    let server = TestServer::start_with(&[], |config| config.limits.max_line_length = 64).await;
    let mut alice = TestClient::join(server.addr, "alice").await;

    alice.send(&format!("BROADCAST {}", "x".repeat(500))).await;
    assert_eq!(alice.line().await, "Server: Invalid command format.");
    alice.barrier().await;

    server.stop().await;
}

#[tokio::test]
async fn test_duplicate_name_rejected() {
    let server = TestServer::start(&[]).await;
    let mut alice = TestClient::join(server.addr, "alice").await;

    let mut imposter = TestClient::connect(server.addr).await;
    imposter.send("JOIN alice").await;
    assert_eq!(imposter.line().await, "Server: Name 'alice' is already taken.");

    // Still connected and free to pick another name.
    imposter.send("JOIN alicia").await;
    assert_eq!(alice.line().await, "Server: alicia has joined");
    imposter.send("UNICAST alice hi").await;
    assert_eq!(alice.line().await, "[PM from alicia]: hi");

    server.stop().await;
}

#[tokio::test]
async fn test_lines_before_join_are_ignored() {
    let server = TestServer::start(&[]).await;
    let mut alice = TestClient::join(server.addr, "alice").await;

    let mut lurker = TestClient::connect(server.addr).await;
    lurker.send("BROADCAST can anyone hear me").await;
    lurker.send("LIST_FILES").await;
    lurker.send("/exit").await;
    lurker.expect_quiet().await;
    alice.expect_quiet().await;

    // Still connected, and free to register.
    lurker.send("JOIN lurker").await;
    assert_eq!(alice.line().await, "Server: lurker has joined");

    server.stop().await;
}

#[tokio::test]
async fn test_group_messages_and_cleanup() {
    let server = TestServer::start(&[]).await;
    let mut alice = TestClient::join(server.addr, "alice").await;
    let mut bob = TestClient::join(server.addr, "bob").await;
    let mut carol = TestClient::join(server.addr, "carol").await;
    assert_eq!(alice.line().await, "Server: bob has joined");
    assert_eq!(alice.line().await, "Server: carol has joined");
    assert_eq!(bob.line().await, "Server: carol has joined");

    alice.send("JOIN_GROUP devs").await;
    assert_eq!(alice.line().await, "Server: You joined group 'devs'.");
    carol.send("JOIN_GROUP devs").await;
    assert_eq!(carol.line().await, "Server: You joined group 'devs'.");

    alice.send("GROUP_MSG devs standup now").await;
    assert_eq!(carol.line().await, "[Group devs] alice: standup now");
    bob.expect_quiet().await;

    bob.send("GROUP_MSG devs let me in").await;
    assert_eq!(
        bob.line().await,
        "Server: You are not a member of group 'devs'."
    );

    // Both members leave: one explicitly, one by disconnecting.
    carol.send("LEAVE_GROUP devs").await;
    assert_eq!(carol.line().await, "Server: You left group 'devs'.");
    drop(alice);
    assert_eq!(bob.line().await, "Server: alice has left");
    assert_eq!(carol.line().await, "Server: alice has left");

    // The group is gone, so a fresh join recreates it with bob alone.
    bob.send("JOIN_GROUP devs").await;
    assert_eq!(bob.line().await, "Server: You joined group 'devs'.");
    bob.send("GROUP_MSG devs anyone?").await;
    carol.expect_quiet().await;

    server.stop().await;
}

#[tokio::test]
async fn test_exit_announces_and_closes() {
    let server = TestServer::start(&[]).await;
    let mut alice = TestClient::join(server.addr, "alice").await;
    let mut bob = TestClient::join(server.addr, "bob").await;
    assert_eq!(alice.line().await, "Server: bob has joined");

    bob.send("/exit").await;
    bob.expect_closed().await;
    assert_eq!(alice.line().await, "Server: bob has left");

    // The name is free again.
    let _bob = TestClient::join(server.addr, "bob").await;
    assert_eq!(alice.line().await, "Server: bob has joined");

    server.stop().await;
}

#[tokio::test]
async fn test_server_full() {
    let server = TestServer::start_with(&[], |config| config.limits.max_connections = 1).await;
    let _alice = TestClient::join(server.addr, "alice").await;

    let mut late = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let mut received = String::new();
    tokio::time::timeout(
        common::TIMEOUT,
        tokio::io::AsyncReadExt::read_to_string(&mut late, &mut received),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(received, "Server: Server is full.\n");

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = TestServer::start(&[]).await;
    let mut alice = TestClient::join(server.addr, "alice").await;

    server.stop().await;
    alice.expect_closed().await;
}
