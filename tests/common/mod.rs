// Each integration test file is a separate binary; helpers not used in every
// binary would otherwise trigger dead_code warnings from clippy.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::codec::{Framed, LinesCodec};

use webrocket::vhost::Vhost;
use webrocket::{BrokerConfig, Context};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Broker fixture
// ============================================================================

/// A full broker — both endpoints — bound to ephemeral loopback ports.
pub struct TestBroker {
    pub context: Context,
    pub ws_addr: SocketAddr,
    pub backend_addr: SocketAddr,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::start_with(BrokerConfig::default()).await
    }

    pub async fn start_with(config: BrokerConfig) -> Self {
        let context = Context::new(config);
        let frontend = context.websocket_endpoint("127.0.0.1", 0);
        let backend = context.backend_endpoint("127.0.0.1", 0);

        {
            let frontend = frontend.clone();
            tokio::spawn(async move {
                let _ = frontend.listen_and_serve().await;
            });
        }
        {
            let backend = backend.clone();
            tokio::spawn(async move {
                let _ = backend.listen_and_serve().await;
            });
        }

        let ws_addr = frontend.local_addr().await.expect("frontend failed to bind");
        let backend_addr = backend.local_addr().await.expect("backend failed to bind");

        Self {
            context,
            ws_addr,
            backend_addr,
        }
    }

    /// Create a vhost and return it with a copy of its worker secret.
    pub async fn add_vhost(&self, path: &str) -> (Arc<Vhost>, String) {
        let vhost = self.context.add_vhost(path).await.expect("add_vhost failed");
        let secret = vhost.secret().to_owned();
        (vhost, secret)
    }
}

// ============================================================================
// Frontend (WebSocket) test client
// ============================================================================

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect to a vhost path and consume the `__connected__` greeting.
pub async fn ws_connect(broker: &TestBroker, vhost: &str) -> WsClient {
    let mut ws = ws_connect_raw(broker, vhost).await;
    assert_eq!(ws_recv(&mut ws).await, json!({"__connected__": {}}));
    ws
}

/// Connect without asserting the greeting (for VHOST_NOT_FOUND paths).
pub async fn ws_connect_raw(broker: &TestBroker, vhost: &str) -> WsClient {
    let url = format!("ws://{}{}", broker.ws_addr, vhost);
    tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket connect failed")
        .0
}

pub async fn ws_send(ws: &mut WsClient, frame: Value) {
    ws.send(Message::Text(frame.to_string()))
        .await
        .expect("websocket send failed");
}

/// Next text frame as JSON; skips control frames, fails the test on timeout
/// or close.
pub async fn ws_recv(ws: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed while expecting a frame")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("invalid JSON frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Drain until the server closes the connection; fails on timeout.
pub async fn ws_expect_close(ws: &mut WsClient) {
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close")
        {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
            Some(Ok(_)) => continue,
        }
    }
}

/// Authenticate with a single-use token, asserting success.
pub async fn ws_auth(ws: &mut WsClient, token: &str) {
    ws_send(ws, json!({"auth": {"token": token}})).await;
    assert_eq!(ws_recv(ws).await, json!({"__authenticated__": {}}));
}

/// Subscribe to a channel, asserting success.
pub async fn ws_subscribe(ws: &mut WsClient, channel: &str) {
    ws_send(ws, json!({"subscribe": {"channel": channel}})).await;
    assert_eq!(
        ws_recv(ws).await,
        json!({"__subscribed__": {"channel": channel}})
    );
}

// ============================================================================
// Backend (worker) test client
// ============================================================================

/// Newline-delimited JSON client for the worker protocol.
pub struct WorkerClient {
    framed: Framed<TcpStream, LinesCodec>,
}

impl WorkerClient {
    pub async fn connect(broker: &TestBroker) -> Self {
        let stream = TcpStream::connect(broker.backend_addr)
            .await
            .expect("backend connect failed");
        Self {
            framed: Framed::new(stream, LinesCodec::new()),
        }
    }

    /// Connect and IDENTIFY, asserting the `OK` reply.
    pub async fn identify(broker: &TestBroker, vhost: &str, secret: &str) -> Self {
        let mut worker = Self::connect(broker).await;
        worker
            .send(json!({"IDENTIFY": {"vhost": vhost, "secret": secret}}))
            .await;
        assert_eq!(worker.recv().await, json!({"OK": {}}));
        worker
    }

    pub async fn send(&mut self, frame: Value) {
        self.framed
            .send(frame.to_string())
            .await
            .expect("worker send failed");
    }

    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a worker frame")
            .expect("worker connection closed while expecting a frame")
            .expect("worker read error");
        serde_json::from_str(&line).expect("invalid worker JSON frame")
    }

    /// Drain until the broker closes the connection; fails on timeout.
    pub async fn expect_close(&mut self) {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
                .await
                .expect("timed out waiting for worker close")
            {
                None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Publish into a channel, asserting the `OK` acknowledgement.
    pub async fn publish(&mut self, channel: &str, event: &str, data: Value) {
        self.send(json!({"PUBLISH": {"channel": channel, "event": event, "data": data}}))
            .await;
        assert_eq!(self.recv().await, json!({"OK": {}}));
    }
}
