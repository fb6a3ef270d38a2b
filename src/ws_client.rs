//! Upstream client for the WebSocket variable protocol.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{BridgeError, Result};
use crate::source::{NodeHandle, NodePath, UpstreamSource, Variant};
use crate::wire::{Request, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reads variables from a remote [`crate::server::WsVariableServer`]-compatible
/// endpoint, one request at a time.
pub struct WsSource {
    url: String,
    stream: Option<WsStream>,
    next_id: u64,
}

impl WsSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: None,
            next_id: 1,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Sends one request and waits for its reply, skipping change pushes.
    async fn call(&mut self, build: impl FnOnce(u64) -> Request) -> Result<ServerMessage> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| BridgeError::Connection("not connected".to_string()))?;
        let id = self.next_id;
        self.next_id += 1;

        let request = serde_json::to_string(&build(id))?;
        stream.send(Message::Text(request)).await?;

        loop {
            let text = match stream.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => {
                    self.stream = None;
                    return Err(BridgeError::Connection("upstream closed the connection".to_string()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            };
            let reply: ServerMessage = match serde_json::from_str(&text) {
                Ok(reply) => reply,
                // a bad push must not fail an unrelated call
                Err(e) if is_change_push(&text) => {
                    tracing::debug!(error = %e, "skipping undecodable change push");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match reply.reply_to() {
                Some(reply_id) if reply_id == id => return Ok(reply),
                Some(other) => {
                    tracing::debug!(expected = id, got = other, "dropping stale reply");
                }
                None => tracing::trace!(?reply, "ignoring change push"),
            }
        }
    }
}

fn is_change_push(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .is_ok_and(|frame| frame.get("type").and_then(|t| t.as_str()) == Some("changed"))
}

#[async_trait]
impl UpstreamSource for WsSource {
    async fn connect(&mut self) -> Result<()> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| BridgeError::Connection(format!("{}: {e}", self.url)))?;
        self.stream = Some(stream);
        tracing::info!(url = %self.url, "connected to upstream");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        match self.stream.take() {
            Some(mut stream) => stream
                .close(None)
                .await
                .map_err(|e| BridgeError::Connection(format!("close: {e}"))),
            None => Ok(()),
        }
    }

    async fn resolve(&mut self, path: &NodePath) -> Result<NodeHandle> {
        let segments = path.segments().to_vec();
        match self.call(|id| Request::Browse { id, path: segments }).await? {
            ServerMessage::Node { node, .. } => Ok(NodeHandle(node)),
            ServerMessage::Error { message, .. } => {
                Err(BridgeError::Resolve(format!("{path}: {message}")))
            }
            other => Err(BridgeError::Protocol(format!("unexpected reply to browse: {other:?}"))),
        }
    }

    async fn read_value(&mut self, node: NodeHandle) -> Result<Variant> {
        match self.call(|id| Request::Read { id, node: node.0 }).await? {
            ServerMessage::Value { value, .. } => Ok(value),
            ServerMessage::Error { message, .. } => {
                Err(BridgeError::Read(format!("node {}: {message}", node.0)))
            }
            other => Err(BridgeError::Protocol(format!("unexpected reply to read: {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{VariableServer, WsVariableServer};

    async fn started_server() -> (WsVariableServer, NodeHandle, String) {
        let mut server = WsVariableServer::new();
        server.set_endpoint("ws://127.0.0.1:0").unwrap();
        let ns = server.register_namespace("urn:test").unwrap();
        assert_eq!(ns, 1);
        let obj = server.add_object(ns, "Simulation").unwrap();
        let var = server
            .add_variable(obj, ns, "Counter", Variant::Int(0))
            .unwrap();
        server.start().await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        (server, var, url)
    }

    #[tokio::test]
    async fn test_not_connected() {
        let mut source = WsSource::new("ws://127.0.0.1:1");
        let err = source.read_value(NodeHandle(1)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
        // disconnecting a closed source is a no-op
        source.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut source = WsSource::new(format!("ws://{addr}"));
        assert!(matches!(
            source.connect().await,
            Err(BridgeError::Connection(_))
        ));
        assert!(!source.is_connected());
    }

    #[tokio::test]
    async fn test_resolve_and_read_over_socket() {
        let (mut server, var, url) = started_server().await;
        server.write_value(var, Variant::Int(42)).await.unwrap();

        let mut source = WsSource::new(url);
        source.connect().await.unwrap();

        let path: NodePath = "0:Objects/1:Simulation/1:Counter".parse().unwrap();
        let node = source.resolve(&path).await.unwrap();
        assert_eq!(node, var);
        assert_eq!(source.read_value(node).await.unwrap(), Variant::Int(42));

        // pushes queued by further writes must not be mistaken for replies
        server.write_value(var, Variant::Int(43)).await.unwrap();
        server.write_value(var, Variant::Int(44)).await.unwrap();
        assert_eq!(source.read_value(node).await.unwrap(), Variant::Int(44));

        let missing: NodePath = "0:Objects/1:Simulation/1:Random".parse().unwrap();
        assert!(matches!(
            source.resolve(&missing).await,
            Err(BridgeError::Resolve(_))
        ));

        source.disconnect().await.unwrap();
        server.stop().await.unwrap();
    }

    /// Accepts one client and answers its first request with `frames`.
    async fn scripted_server(frames: &'static [&'static str]) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _request = ws.next().await;
            for frame in frames {
                ws.send(Message::Text(frame.to_string())).await.unwrap();
            }
            let _ = ws.next().await;
        });
        url
    }

    #[tokio::test]
    async fn test_undecodable_change_push_is_skipped() {
        let url = scripted_server(&[
            r#"{"type":"changed","node":7,"value":null}"#,
            r#"{"type":"value","id":1,"value":5}"#,
        ])
        .await;
        let mut source = WsSource::new(url);
        source.connect().await.unwrap();

        assert_eq!(source.read_value(NodeHandle(7)).await.unwrap(), Variant::Int(5));
    }

    #[tokio::test]
    async fn test_undecodable_reply_fails_call() {
        let url = scripted_server(&[r#"{"type":"value","id":1,"value":null}"#]).await;
        let mut source = WsSource::new(url);
        source.connect().await.unwrap();

        assert!(matches!(
            source.read_value(NodeHandle(7)).await,
            Err(BridgeError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_non_finite_write_rejected_and_reads_keep_working() {
        let (mut server, var, url) = started_server().await;
        server.write_value(var, Variant::Int(3)).await.unwrap();
        assert!(matches!(
            server.write_value(var, Variant::Double(f64::NAN)).await,
            Err(BridgeError::Write(_))
        ));

        let mut source = WsSource::new(url);
        source.connect().await.unwrap();
        assert_eq!(source.read_value(var).await.unwrap(), Variant::Int(3));

        source.disconnect().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_after_server_stop_fails() {
        let (mut server, var, url) = started_server().await;
        let mut source = WsSource::new(url);
        source.connect().await.unwrap();
        server.stop().await.unwrap();

        assert!(source.read_value(var).await.is_err());
    }
}
