// Shared helpers for the end-to-end protocol tests: a bound server over a
// temporary logs directory and a raw frame-level test client.
#![allow(dead_code)]
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::BytesMut;
use millrace_server::{DocManager, MemoryDocManager, QueryManager, Server, ServerConfig};
use millrace_wire::{Document, FrameParser, decode_frame, encode_frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};

pub struct TestServer {
    pub addr: SocketAddr,
    pub docs: Arc<MemoryDocManager>,
    _logs_dir: tempfile::TempDir,
}

pub async fn start_server() -> Result<TestServer> {
    start_server_with(|_| {}, QueryManager::new()).await
}

pub async fn start_server_with(
    tweak: impl FnOnce(&mut ServerConfig),
    queries: QueryManager,
) -> Result<TestServer> {
    let logs_dir = tempfile::tempdir().context("tempdir")?;
    let mut config = ServerConfig::from_env()?;
    config.bind = "127.0.0.1:0".parse()?;
    config.logs_dir = logs_dir.path().to_path_buf();
    config.fsync_on_append = false;
    tweak(&mut config);
    let docs = Arc::new(MemoryDocManager::new());
    let server = Server::bind(config, Arc::clone(&docs) as Arc<dyn DocManager>, queries).await?;
    let addr = server.local_addr()?;
    tokio::spawn(server.serve());
    Ok(TestServer {
        addr,
        docs,
        _logs_dir: logs_dir,
    })
}

pub struct TestClient {
    stream: TcpStream,
    parser: FrameParser,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Result<TestClient> {
        let stream = TcpStream::connect(addr).await.context("connect")?;
        Ok(TestClient {
            stream,
            parser: FrameParser::new(16 * 1024 * 1024),
        })
    }

    /// Connect at the protocol level: CONNECT then RESPONSE ok.
    pub async fn handshake(addr: SocketAddr) -> Result<TestClient> {
        let mut client = TestClient::connect(addr).await?;
        client.send("CONNECT", Document::new()).await?;
        let (kind, body) = client.recv().await?;
        if kind != "RESPONSE" || body.get_bool("ok") != Some(true) {
            bail!("handshake failed: {kind} {body:?}");
        }
        Ok(client)
    }

    pub async fn send(&mut self, kind: &str, body: Document) -> Result<()> {
        let frame = encode_frame(kind, &body);
        self.stream.write_all(&frame).await.context("write frame")?;
        Ok(())
    }

    /// Send raw bytes, bypassing the frame codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await.context("write raw")?;
        Ok(())
    }

    /// Receive one frame within a second.
    pub async fn recv(&mut self) -> Result<(String, Document)> {
        timeout(Duration::from_secs(1), self.recv_inner())
            .await
            .context("timed out waiting for a frame")?
    }

    /// True if the server stays silent for the window.
    pub async fn silent_for(&mut self, window: Duration) -> bool {
        timeout(window, self.recv_inner()).await.is_err()
    }

    /// True once the server closes the connection without sending a frame.
    pub async fn expect_closed(&mut self) -> Result<bool> {
        let outcome = timeout(Duration::from_secs(1), self.recv_inner()).await;
        match outcome {
            Ok(Ok(frame)) => bail!("expected close, got frame {frame:?}"),
            Ok(Err(_)) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    async fn recv_inner(&mut self) -> Result<(String, Document)> {
        let mut buf = BytesMut::with_capacity(16 * 1024);
        loop {
            if let Some(payload) = self.parser.next_frame()? {
                return decode_frame(payload).context("decode frame");
            }
            buf.clear();
            let read = self.stream.read_buf(&mut buf).await.context("read")?;
            if read == 0 {
                bail!("connection closed");
            }
            self.parser.extend(&buf);
        }
    }
}
