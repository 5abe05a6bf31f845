//! A connected client session: one task reads the keyboard, another reads
//! the server.

use anyhow::{Context, Result};
use futures_util::{SinkExt, Stream, StreamExt};
use relay_protocol::command::keywords;
use relay_protocol::{
    Announcement, Command, LineCodec, ProtocolError, Reply, ServerEvent, ServerStreamCodec,
};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::downloads::Downloads;
use crate::input::{Action, InputState, TransferKind, MENU};

/// An inline download in progress.
struct InlineDownload {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    written: u64,
}

/// Connect, register as `name`, and run until `/exit` or the server leaves.
///
/// # Errors
///
/// Returns an error if the connection cannot be made or the server stops
/// accepting writes.
pub async fn run(name: &str, host: &str, port: u16) -> Result<()> {
    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("Failed to connect to {host}:{port}"))?;
    stream.set_nodelay(true)?;
    let server_ip = stream.peer_addr()?.ip();
    let (read_half, write_half) = stream.into_split();

    let mut writer = FramedWrite::new(write_half, LineCodec::new());
    writer
        .send(Command::Join {
            name: name.to_string(),
        })
        .await
        .context("Failed to register")?;

    let downloads = Downloads::for_user(name).with_server_ip(server_ip);
    println!("Connected to {host}:{port} as {name}.");
    println!("{MENU}");

    let mut server = tokio::spawn(receive_loop(
        FramedRead::new(read_half, ServerStreamCodec::default()),
        downloads.clone(),
        tokio::io::stdout(),
    ));

    let mut input = InputState::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line.context("Failed to read input")? else {
                    // End of input behaves like /exit.
                    let _ = writer.send(Command::Exit).await;
                    break;
                };
                let mut exit = false;
                for action in input.translate(&line) {
                    match action {
                        Action::Print(text) => println!("{text}"),
                        Action::Send(command) => writer.send(command).await?,
                        Action::Download { filename, kind } => {
                            let command = match kind {
                                TransferKind::Tcp => Command::DownloadTcp { filename },
                                TransferKind::Udp => match downloads.prepare_datagram(&filename).await {
                                    Ok(port) => Command::DownloadUdp { filename, port },
                                    Err(e) => {
                                        println!("Cannot start UDP download: {e}");
                                        continue;
                                    }
                                },
                            };
                            writer.send(command).await?;
                        }
                        Action::Exit => {
                            writer.send(Command::Exit).await?;
                            exit = true;
                        }
                    }
                }
                if exit {
                    break;
                }
            }
            _ = &mut server => {
                return Ok(());
            }
        }
    }

    // Let the server close its side, which also finishes pending downloads.
    drop(writer);
    if let Err(e) = server.await {
        warn!(error = %e, "Server reader task failed");
    }
    Ok(())
}

/// Read server events until the connection ends, printing lines to `out` and
/// saving downloads.
///
/// Datagram transfers started here are awaited before returning.
pub async fn receive_loop<S, W>(mut events: S, downloads: Downloads, mut out: W)
where
    S: Stream<Item = Result<ServerEvent, ProtocolError>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut inline: Option<InlineDownload> = None;
    let mut datagrams = JoinSet::new();
    // Names still expected in the body of a FILES_LIST announcement.
    let mut listing = 0usize;

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                print(&mut out, &format!("Connection error: {e}")).await;
                break;
            }
        };

        match event {
            ServerEvent::Line(line) if listing > 0 => {
                listing -= 1;
                print(&mut out, &format!("  {line}")).await;
            }
            ServerEvent::Line(line) => match Announcement::parse(&line) {
                Ok(Some(Announcement::FileStartTcp { filename, size })) => {
                    print(
                        &mut out,
                        &format!("Receiving '{filename}' ({size} bytes) over TCP..."),
                    )
                    .await;
                    inline = Some(match downloads.create(&filename).await {
                        Ok((path, file)) => InlineDownload {
                            path,
                            file: Some(file),
                            written: 0,
                        },
                        Err(e) => {
                            // The payload still has to be consumed.
                            print(&mut out, &format!("Cannot save '{filename}': {e}")).await;
                            InlineDownload {
                                path: PathBuf::from(&filename),
                                file: None,
                                written: 0,
                            }
                        }
                    });
                }
                Ok(Some(Announcement::FileStartUdp {
                    filename,
                    size,
                    port,
                })) => {
                    let Some(receiver) = downloads.take_pending(&filename, port) else {
                        print(
                            &mut out,
                            &format!("Ignoring UDP transfer of '{filename}' to port {port}: not requested."),
                        )
                        .await;
                        continue;
                    };
                    print(
                        &mut out,
                        &format!("Receiving '{filename}' ({size} bytes) over UDP on port {port}..."),
                    )
                    .await;
                    let downloads = downloads.clone();
                    datagrams.spawn(async move {
                        let result = downloads.receive_datagram(receiver, &filename, size).await;
                        (filename, result)
                    });
                }
                Ok(Some(Announcement::FilesList { count })) => {
                    listing = count;
                    print(&mut out, &line).await;
                }
                Ok(None) => {
                    if let Some(filename) = missing_file(&line) {
                        downloads.abandon(filename);
                    } else if line == rejected_datagram_notice() {
                        downloads.abandon_oldest();
                    }
                    downloads.expire_stale();
                    print(&mut out, &line).await;
                }
                Err(e) => {
                    debug!(error = %e, "Unparseable announcement");
                    print(&mut out, &line).await;
                }
            },
            ServerEvent::FileChunk(chunk) => {
                if let Some(download) = inline.as_mut() {
                    if let Some(file) = download.file.as_mut() {
                        if let Err(e) = file.write_all(&chunk).await {
                            print(&mut out, &format!("Write failed: {e}")).await;
                            download.file = None;
                        }
                    }
                    download.written += chunk.len() as u64;
                }
            }
            ServerEvent::FileEnd => {
                if let Some(mut download) = inline.take() {
                    if let Some(mut file) = download.file.take() {
                        match file.flush().await {
                            Ok(()) => {
                                print(
                                    &mut out,
                                    &format!(
                                        "Saved '{}' ({} bytes).",
                                        download.path.display(),
                                        download.written
                                    ),
                                )
                                .await;
                            }
                            Err(e) => print(&mut out, &format!("Write failed: {e}")).await,
                        }
                    }
                }
            }
        }

        // Report datagram transfers as they finish.
        while let Some(done) = datagrams.try_join_next() {
            report_datagram(&mut out, done).await;
        }
    }

    print(&mut out, "Disconnected from server.").await;
    while let Some(done) = datagrams.join_next().await {
        report_datagram(&mut out, done).await;
    }
}

type DatagramResult = (
    String,
    Result<(PathBuf, relay_transport::ReceiveSummary), crate::downloads::DownloadError>,
);

async fn report_datagram<W>(out: &mut W, done: Result<DatagramResult, tokio::task::JoinError>)
where
    W: AsyncWrite + Unpin,
{
    let text = match done {
        Ok((filename, Ok((path, summary)))) if summary.is_complete() => format!(
            "Saved '{}' ({} bytes) from UDP transfer of '{filename}'.",
            path.display(),
            summary.received
        ),
        Ok((filename, Ok((path, summary)))) => format!(
            "UDP transfer of '{filename}' incomplete: received {}/{} bytes into '{}'.",
            summary.received,
            summary.expected,
            path.display()
        ),
        Ok((filename, Err(e))) => format!("UDP transfer of '{filename}' failed: {e}"),
        Err(e) => format!("UDP transfer task failed: {e}"),
    };
    print(out, &text).await;
}

/// The notice a malformed `DOWNLOAD_UDP` request is answered with.
fn rejected_datagram_notice() -> String {
    Reply::InvalidFormat {
        command: keywords::DOWNLOAD_UDP,
    }
    .to_string()
}

/// The file named by a `File '<name>' not found.` notice.
fn missing_file(line: &str) -> Option<&str> {
    line.strip_prefix("Server: File '")?
        .strip_suffix("' not found.")
}

async fn print<W>(out: &mut W, text: &str)
where
    W: AsyncWrite + Unpin,
{
    let mut line = String::with_capacity(text.len() + 1);
    line.push_str(text);
    line.push('\n');
    if out.write_all(line.as_bytes()).await.is_ok() {
        let _ = out.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;
    use relay_transport::{DatagramConfig, DatagramSender};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;

    fn events(items: Vec<ServerEvent>) -> impl Stream<Item = Result<ServerEvent, ProtocolError>> + Unpin {
        stream::iter(items.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_lines_are_printed() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        receive_loop(
            events(vec![
                ServerEvent::Line("Welcome to the instant messenger!".into()),
                ServerEvent::Line("[Broadcast] bob: hi".into()),
            ]),
            Downloads::new(dir.path()),
            &mut out,
        )
        .await;

        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "Welcome to the instant messenger!\n[Broadcast] bob: hi\nDisconnected from server.\n"
        );
    }

    #[tokio::test]
    async fn test_inline_download_saved() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = Downloads::new(dir.path().join("alice_files"));
        let mut out = Vec::new();
        receive_loop(
            events(vec![
                ServerEvent::Line("FILE_START_TCP notes.txt 11".into()),
                ServerEvent::FileChunk(Bytes::from_static(b"hello ")),
                ServerEvent::FileChunk(Bytes::from_static(b"world")),
                ServerEvent::FileEnd,
                ServerEvent::Line("Server: bob has joined".into()),
            ]),
            downloads,
            &mut out,
        )
        .await;

        let saved = std::fs::read(dir.path().join("alice_files").join("notes.txt")).unwrap();
        assert_eq!(saved, b"hello world");
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("(11 bytes)"));
        assert!(text.contains("Server: bob has joined"));
    }

    #[tokio::test]
    async fn test_inline_download_with_unsafe_name_is_drained() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        receive_loop(
            events(vec![
                ServerEvent::Line("FILE_START_TCP ../evil 3".into()),
                ServerEvent::FileChunk(Bytes::from_static(b"bad")),
                ServerEvent::FileEnd,
                ServerEvent::Line("after".into()),
            ]),
            Downloads::new(dir.path().join("out")),
            &mut out,
        )
        .await;

        assert!(!dir.path().join("evil").exists());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Cannot save '../evil'"));
        assert!(text.contains("after\n"));
    }

    #[tokio::test]
    async fn test_datagram_download_saved() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = Downloads::new(dir.path())
            .with_bind_ip(Ipv4Addr::LOCALHOST)
            .with_server_ip(Ipv4Addr::LOCALHOST.into())
            .with_idle_timeout(Duration::from_secs(2));
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 97) as u8).collect();

        let port = downloads.prepare_datagram("photo.jpg").await.unwrap();
        let sender = DatagramSender::open(
            SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            DatagramConfig::default(),
        )
        .await
        .unwrap();
        sender
            .send_from(payload.as_slice(), payload.len() as u64)
            .await
            .unwrap();

        let mut out = Vec::new();
        receive_loop(
            events(vec![ServerEvent::Line(format!(
                "FILE_START_UDP photo.jpg {} {port}",
                payload.len()
            ))]),
            downloads.clone(),
            &mut out,
        )
        .await;

        assert_eq!(std::fs::read(dir.path().join("photo.jpg")).unwrap(), payload);
        assert_eq!(downloads.pending_count(), 0);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Saved"), "{text}");
    }

    #[tokio::test]
    async fn test_unrequested_datagram_announcement_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        receive_loop(
            events(vec![ServerEvent::Line("FILE_START_UDP x.bin 10 15000".into())]),
            Downloads::new(dir.path()),
            &mut out,
        )
        .await;

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("not requested"));
        assert!(!dir.path().join("x.bin").exists());
    }

    #[tokio::test]
    async fn test_not_found_releases_pending_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = Downloads::new(dir.path()).with_bind_ip(Ipv4Addr::LOCALHOST);
        downloads.prepare_datagram("ghost.txt").await.unwrap();

        let mut out = Vec::new();
        receive_loop(
            events(vec![ServerEvent::Line(
                "Server: File 'ghost.txt' not found.".into(),
            )]),
            downloads.clone(),
            &mut out,
        )
        .await;
        assert_eq!(downloads.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_listed_names_are_not_announcements() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        receive_loop(
            events(vec![
                ServerEvent::Line("FILES_LIST 2 files available:".into()),
                ServerEvent::Line("FILE_START_TCP a 5".into()),
                ServerEvent::Line("b.txt".into()),
                ServerEvent::Line("Server: bob has joined".into()),
            ]),
            Downloads::new(dir.path()),
            &mut out,
        )
        .await;

        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "FILES_LIST 2 files available:\n  FILE_START_TCP a 5\n  b.txt\n\
             Server: bob has joined\nDisconnected from server.\n"
        );
        assert!(!dir.path().join("a").exists());
    }

    #[tokio::test]
    async fn test_rejected_datagram_request_releases_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = Downloads::new(dir.path()).with_bind_ip(Ipv4Addr::LOCALHOST);
        downloads.prepare_datagram("photo.jpg").await.unwrap();

        let mut out = Vec::new();
        receive_loop(
            events(vec![ServerEvent::Line(
                "Server: Invalid DOWNLOAD_UDP format.".into(),
            )]),
            downloads.clone(),
            &mut out,
        )
        .await;
        assert_eq!(downloads.pending_count(), 0);
    }

    #[test]
    fn test_missing_file_notice() {
        assert_eq!(
            missing_file("Server: File 'a b.txt' not found."),
            Some("a b.txt")
        );
        assert_eq!(missing_file("Server: bob has left"), None);
    }
}
