#![allow(dead_code)]

use anyhow::{Context, Result};
use bytes::BytesMut;
use gateway::config::GatewayConfig;
use gateway::tcp::{self, Handlers};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use viaduct_backend::MockBackend;
use viaduct_wire::Frame;

pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

pub struct TestGateway {
    pub backend: Arc<MockBackend>,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Start a gateway on an ephemeral port serving both directions from a
/// fresh in-memory backend.
pub async fn start_gateway() -> Result<TestGateway> {
    let backend = Arc::new(MockBackend::new());
    let handlers = Handlers::from_backend(Arc::clone(&backend));
    start_gateway_with(backend, handlers).await
}

pub async fn start_gateway_with(
    backend: Arc<MockBackend>,
    handlers: Handlers,
) -> Result<TestGateway> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind listener")?;
    let addr = listener.local_addr().context("local addr")?;
    let config = GatewayConfig {
        listen_bind: addr,
        metrics_bind: "127.0.0.1:0".parse().context("metrics bind")?,
        max_frame_bytes: MAX_FRAME_BYTES,
    };
    let shutdown = CancellationToken::new();
    let serve_shutdown = shutdown.child_token();
    tokio::spawn(async move {
        let _ = tcp::serve(listener, handlers, config, serve_shutdown).await;
    });
    Ok(TestGateway {
        backend,
        addr,
        shutdown,
    })
}

pub async fn connect(gateway: &TestGateway) -> Result<TcpStream> {
    TcpStream::connect(gateway.addr).await.context("connect")
}

pub async fn read_frame(stream: &mut TcpStream, scratch: &mut BytesMut) -> Result<Option<Frame>> {
    tcp::read_frame_limited(stream, MAX_FRAME_BYTES, scratch)
        .await
        .context("read frame")
}

pub async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<()> {
    tcp::write_frame(stream, frame).await.context("write frame")
}
