//! Benchmark server - accepts inbound speed tests from other peers
//!
//! One TCP accept loop, one task per connection, one benchmark per
//! connection. Latency probes are answered inline so they measure the
//! same path the data takes.

use super::protocol::{read_message, write_message, Message, ProtocolError};
use super::{Direction, CHUNK_SIZE, READ_TIMEOUT};
use crate::shutdown::{self, ShutdownTrigger};
use parking_lot::Mutex;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Benchmark server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server already running")]
    AlreadyRunning,
    #[error("server not running")]
    NotRunning,
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("benchmark already in progress on this connection")]
    Conflict,
    #[error("expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: String,
    },
    #[error("read timed out")]
    Timeout,
}

struct Running {
    local_addr: SocketAddr,
    trigger: ShutdownTrigger,
}

/// Accept loop plus per-connection benchmark state.
pub struct BenchServer {
    bind_addr: String,
    port: u16,
    running: Mutex<Option<Running>>,
}

impl BenchServer {
    pub fn new(bind_addr: impl Into<String>, port: u16) -> Arc<Self> {
        Arc::new(BenchServer {
            bind_addr: bind_addr.into(),
            port,
            running: Mutex::new(None),
        })
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        if self.running.lock().is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind((self.bind_addr.as_str(), self.port))
            .await
            .map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        let (trigger, mut watch) = shutdown::channel();
        *self.running.lock() = Some(Running {
            local_addr,
            trigger,
        });

        info!(addr = %local_addr, "benchmark server listening");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watch.triggered() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(peer = %peer, "benchmark connection accepted");
                                tokio::spawn(async move {
                                    if let Err(err) = handle_connection(stream).await {
                                        debug!(peer = %peer, error = %err, "benchmark connection ended");
                                    }
                                });
                            }
                            Err(err) => {
                                warn!(error = %err, "benchmark accept error");
                            }
                        }
                    }
                }
            }
            debug!("benchmark accept loop stopped");
        });

        Ok(())
    }

    /// The bound address, once started.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Stop accepting. In-flight benchmarks run to completion.
    pub fn stop(&self) -> Result<(), ServerError> {
        let running = self.running.lock().take().ok_or(ServerError::NotRunning)?;
        running.trigger.trigger();
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream) -> Result<(), ServerError> {
    let (mut reader, mut writer) = stream.into_split();

    let start_msg = tokio::time::timeout(READ_TIMEOUT, read_message(&mut reader))
        .await
        .map_err(|_| ServerError::Timeout)??;

    let (size, direction) = match start_msg {
        Message::Start { size, direction } => (size, direction),
        other => {
            let err = Message::Error {
                message: format!("expected Start, got {}", other.message_type()),
            };
            write_message(&mut writer, &err).await?;
            return Err(ServerError::UnexpectedMessage {
                expected: "Start",
                got: other.message_type().to_string(),
            });
        }
    };

    if size <= 0 {
        let ack = Message::Ack {
            accepted: false,
            error: format!("size must be positive, got {}", size),
        };
        write_message(&mut writer, &ack).await?;
        return Ok(());
    }

    write_message(
        &mut writer,
        &Message::Ack {
            accepted: true,
            error: String::new(),
        },
    )
    .await?;

    // Direction is the initiator's: their upload is our receive.
    match direction {
        Direction::Upload => serve_upload(&mut reader, &mut writer, size).await,
        Direction::Download => serve_download(reader, writer, size).await,
    }
}

/// Receive the initiator's data, answering interleaved pings, until their
/// Complete arrives. A read timeout after the full size has arrived also
/// ends the transfer, covering initiators that never send Complete.
async fn serve_upload<R, W>(reader: &mut R, writer: &mut W, size: i64) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let start = Instant::now();
    let mut received: i64 = 0;
    let mut benchmark_done = false;

    while !benchmark_done {
        let msg = match tokio::time::timeout(READ_TIMEOUT, read_message(reader)).await {
            Ok(result) => result?,
            Err(_) if received >= size => break,
            Err(_) => return Err(ServerError::Timeout),
        };

        match msg {
            Message::Data { data, .. } => {
                received += data.len() as i64;
            }
            Message::Ping { seq, timestamp_ns } => {
                let pong = Message::Pong {
                    seq,
                    ping_timestamp_ns: timestamp_ns,
                };
                write_message(writer, &pong).await?;
            }
            Message::Complete { .. } => {
                benchmark_done = true;
            }
            Message::Start { .. } => {
                let ack = Message::Ack {
                    accepted: false,
                    error: "benchmark already in progress".to_string(),
                };
                write_message(writer, &ack).await?;
                return Err(ServerError::Conflict);
            }
            other => {
                warn!(message_type = %other.message_type(), "unexpected message during upload");
            }
        }
    }

    let complete = Message::Complete {
        bytes: received,
        duration_ns: start.elapsed().as_nanos() as i64,
    };
    write_message(writer, &complete).await?;

    debug!(bytes = received, "upload benchmark served");
    Ok(())
}

/// Stream random chunks to the initiator until `size` is sent, answering
/// pings between chunks, then send Complete.
async fn serve_download(
    reader: tokio::net::tcp::OwnedReadHalf,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    size: i64,
) -> Result<(), ServerError> {
    let start = Instant::now();

    // A side task forwards inbound messages so pings can be answered
    // between chunk writes without blocking the stream.
    let (inbound_tx, mut inbound) = mpsc::channel::<Message>(16);
    let read_task = tokio::spawn(async move {
        let mut reader = reader;
        loop {
            match read_message(&mut reader).await {
                Ok(msg) => {
                    if inbound_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut chunk = vec![0u8; CHUNK_SIZE];
    rand::thread_rng().fill_bytes(&mut chunk);

    let mut sent: i64 = 0;
    let mut seq: u32 = 0;
    let result = 'transfer: loop {
        while let Ok(msg) = inbound.try_recv() {
            if let Message::Ping { seq, timestamp_ns } = msg {
                let pong = Message::Pong {
                    seq,
                    ping_timestamp_ns: timestamp_ns,
                };
                if let Err(err) = write_message(&mut writer, &pong).await {
                    break 'transfer Err(ServerError::Protocol(err));
                }
            }
        }

        if sent >= size {
            break 'transfer Ok(());
        }

        let remaining = (size - sent).min(CHUNK_SIZE as i64) as usize;
        let data = Message::Data {
            seq,
            data: chunk[..remaining].to_vec(),
        };
        if let Err(err) = write_message(&mut writer, &data).await {
            break 'transfer Err(ServerError::Protocol(err));
        }

        sent += remaining as i64;
        seq += 1;
    };
    if let Err(err) = result {
        read_task.abort();
        return Err(err);
    }

    let complete = Message::Complete {
        bytes: sent,
        duration_ns: start.elapsed().as_nanos() as i64,
    };
    write_message(&mut writer, &complete).await?;

    read_task.abort();
    debug!(bytes = sent, "download benchmark served");
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::protocol::{read_message, write_message};

    async fn connect(server: &Arc<BenchServer>) -> TcpStream {
        TcpStream::connect(server.addr().unwrap()).await.unwrap()
    }

    fn test_server() -> Arc<BenchServer> {
        BenchServer::new("127.0.0.1", 0)
    }

    #[tokio::test]
    async fn test_start_stop() {
        let server = test_server();
        server.start().await.unwrap();

        let addr = server.addr().unwrap();
        let conn = TcpStream::connect(addr).await;
        assert!(conn.is_ok());

        server.stop().unwrap();
        assert!(server.stop().is_err());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let server = test_server();
        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(ServerError::AlreadyRunning)
        ));
        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_upload_flow() {
        let server = test_server();
        server.start().await.unwrap();

        let mut conn = connect(&server).await;

        write_message(
            &mut conn,
            &Message::Start {
                size: 1024,
                direction: Direction::Upload,
            },
        )
        .await
        .unwrap();

        let ack = read_message(&mut conn).await.unwrap();
        assert!(matches!(ack, Message::Ack { accepted: true, .. }));

        write_message(
            &mut conn,
            &Message::Data {
                seq: 0,
                data: vec![0u8; 1024],
            },
        )
        .await
        .unwrap();

        write_message(
            &mut conn,
            &Message::Complete {
                bytes: 1024,
                duration_ns: 1,
            },
        )
        .await
        .unwrap();

        let complete = read_message(&mut conn).await.unwrap();
        match complete {
            Message::Complete { bytes, .. } => assert_eq!(bytes, 1024),
            other => panic!("expected Complete, got {:?}", other),
        }

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_download_flow() {
        let server = test_server();
        server.start().await.unwrap();

        let mut conn = connect(&server).await;
        let size = CHUNK_SIZE as i64;

        write_message(
            &mut conn,
            &Message::Start {
                size,
                direction: Direction::Download,
            },
        )
        .await
        .unwrap();

        let ack = read_message(&mut conn).await.unwrap();
        assert!(matches!(ack, Message::Ack { accepted: true, .. }));

        let mut received: i64 = 0;
        loop {
            match read_message(&mut conn).await.unwrap() {
                Message::Data { data, .. } => received += data.len() as i64,
                Message::Complete { bytes, .. } => {
                    assert_eq!(bytes, size);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(received, size);

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_ping_answered_during_upload() {
        let server = test_server();
        server.start().await.unwrap();

        let mut conn = connect(&server).await;

        write_message(
            &mut conn,
            &Message::Start {
                size: 10,
                direction: Direction::Upload,
            },
        )
        .await
        .unwrap();
        let _ack = read_message(&mut conn).await.unwrap();

        write_message(
            &mut conn,
            &Message::Ping {
                seq: 5,
                timestamp_ns: 777,
            },
        )
        .await
        .unwrap();

        let pong = read_message(&mut conn).await.unwrap();
        match pong {
            Message::Pong {
                seq,
                ping_timestamp_ns,
            } => {
                assert_eq!(seq, 5);
                assert_eq!(ping_timestamp_ns, 777);
            }
            other => panic!("expected Pong, got {:?}", other),
        }

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_rejects_nonpositive_size() {
        let server = test_server();
        server.start().await.unwrap();

        let mut conn = connect(&server).await;
        write_message(
            &mut conn,
            &Message::Start {
                size: 0,
                direction: Direction::Upload,
            },
        )
        .await
        .unwrap();

        let ack = read_message(&mut conn).await.unwrap();
        match ack {
            Message::Ack { accepted, error } => {
                assert!(!accepted);
                assert!(error.contains("size"));
            }
            other => panic!("expected Ack, got {:?}", other),
        }

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_second_start_is_conflict() {
        let server = test_server();
        server.start().await.unwrap();

        let mut conn = connect(&server).await;
        write_message(
            &mut conn,
            &Message::Start {
                size: 1024,
                direction: Direction::Upload,
            },
        )
        .await
        .unwrap();
        let _ack = read_message(&mut conn).await.unwrap();

        // A second Start mid-benchmark must be refused.
        write_message(
            &mut conn,
            &Message::Start {
                size: 1024,
                direction: Direction::Upload,
            },
        )
        .await
        .unwrap();

        let ack = read_message(&mut conn).await.unwrap();
        match ack {
            Message::Ack { accepted, error } => {
                assert!(!accepted);
                assert!(error.contains("in progress"));
            }
            other => panic!("expected Ack, got {:?}", other),
        }

        server.stop().unwrap();
    }
}
