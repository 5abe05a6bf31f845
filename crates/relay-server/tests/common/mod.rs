// tests/common/mod.rs

//! Shared helpers for end-to-end tests: a server on an ephemeral port and a
//! line client that understands inline payloads.

#![allow(dead_code)]

use bytes::BytesMut;
use futures_util::StreamExt;
use relay_protocol::{ServerEvent, ServerStreamCodec};
use relay_server::{Config, Server};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(200);

/// A running server with its own shared directory.
pub struct TestServer {
    pub addr: SocketAddr,
    pub dir: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestServer {
    pub async fn start(files: &[(&str, &[u8])]) -> Self {
        Self::start_with(files, |_| {}).await
    }

    pub async fn start_with(files: &[(&str, &[u8])], tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            std::fs::write(dir.path().join(name), contents).unwrap();
        }

        let mut config = Config::default();
        config.host = "127.0.0.1".into();
        config.port = 0;
        config.shared_dir = dir.path().to_path_buf();
        config.transfer.datagram_pacing_us = 0;
        tweak(&mut config);

        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));

        Self {
            addr,
            dir,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(TIMEOUT, handle)
                .await
                .expect("server did not stop")
                .unwrap()
                .unwrap();
        }
    }
}

/// A raw protocol client.
pub struct TestClient {
    reader: FramedRead<OwnedReadHalf, ServerStreamCodec>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    /// Connect and consume the greeting.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            reader: FramedRead::new(read_half, ServerStreamCodec::default()),
            writer,
        };
        assert_eq!(client.line().await, "Welcome to the instant messenger!");
        client
    }

    /// Connect and register, returning once the server has processed the
    /// registration.
    pub async fn join(addr: SocketAddr, name: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(&format!("JOIN {name}")).await;
        client.barrier().await;
        client
    }

    /// Round-trip an unknown command so every earlier line has been handled.
    pub async fn barrier(&mut self) {
        self.send("PING").await;
        assert_eq!(
            self.line().await,
            "Server: Unknown command or protocol error."
        );
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    pub async fn event(&mut self) -> Option<ServerEvent> {
        tokio::time::timeout(TIMEOUT, self.reader.next())
            .await
            .expect("timed out waiting for server")
            .map(|event| event.unwrap())
    }

    pub async fn line(&mut self) -> String {
        match self.event().await {
            Some(ServerEvent::Line(line)) => line,
            other => panic!("Expected a line, got {:?}", other),
        }
    }

    /// Read an inline payload after its header has been consumed.
    pub async fn payload(&mut self) -> Vec<u8> {
        let mut data = BytesMut::new();
        loop {
            match self.event().await {
                Some(ServerEvent::FileChunk(chunk)) => data.extend_from_slice(&chunk),
                Some(ServerEvent::FileEnd) => return data.to_vec(),
                other => panic!("Expected payload, got {:?}", other),
            }
        }
    }

    /// Assert nothing arrives for a short while.
    pub async fn expect_quiet(&mut self) {
        if let Ok(event) = tokio::time::timeout(QUIET, self.reader.next()).await {
            panic!("Expected no traffic, got {:?}", event);
        }
    }

    /// Assert the server closed the connection.
    pub async fn expect_closed(&mut self) {
        assert!(self.event().await.is_none(), "connection still open");
    }
}
