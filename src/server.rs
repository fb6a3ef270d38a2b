//! Locally hosted variable server capability and its WebSocket implementation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::error::{BridgeError, Result};
use crate::source::{NodeHandle, NodeId, QualifiedName, Variant, OBJECTS_FOLDER};
use crate::wire::{Request, ServerMessage};

/// Namespace index 0 is reserved for the standard namespace.
pub const STANDARD_NAMESPACE: &str = "http://opcfoundation.org/UA/";

const FIRST_USER_NODE: NodeId = 1000;
const CHANGE_BUFFER: usize = 64;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Server side of the downstream republish sink.
#[async_trait]
pub trait VariableServer: Send + 'static {
    fn set_endpoint(&mut self, url: &str) -> Result<()>;

    fn register_namespace(&mut self, uri: &str) -> Result<u16>;

    /// Adds an object under the `Objects` folder.
    fn add_object(&mut self, ns: u16, name: &str) -> Result<NodeHandle>;

    fn add_variable(
        &mut self,
        object: NodeHandle,
        ns: u16,
        name: &str,
        initial: Variant,
    ) -> Result<NodeHandle>;

    /// Allows connected clients to write the variable.
    fn set_writable(&mut self, variable: NodeHandle) -> Result<()>;

    async fn start(&mut self) -> Result<()>;

    async fn write_value(&mut self, variable: NodeHandle, value: Variant) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;
}

/// Splits a `ws://host:port/...` endpoint into its bind host and port.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let url = Url::parse(endpoint)
        .map_err(|e| BridgeError::Config(format!("invalid endpoint '{endpoint}': {e}")))?;
    if url.scheme() != "ws" {
        return Err(BridgeError::Config(format!(
            "endpoint '{endpoint}' must use the ws:// scheme"
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| BridgeError::Config(format!("endpoint '{endpoint}' has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| BridgeError::Config(format!("endpoint '{endpoint}' has no port")))?;
    Ok((host.trim_matches(['[', ']']).to_string(), port))
}

#[derive(Debug, Clone)]
enum NodeKind {
    Object,
    Variable { value: Variant, writable: bool },
}

#[derive(Debug, Clone)]
struct Node {
    browse_name: QualifiedName,
    parent: Option<NodeId>,
    kind: NodeKind,
}

#[derive(Debug)]
struct AddressSpace {
    namespaces: Vec<String>,
    nodes: HashMap<NodeId, Node>,
    next_id: NodeId,
}

impl AddressSpace {
    fn new() -> Self {
        let objects = Node {
            browse_name: QualifiedName::new(0, "Objects"),
            parent: None,
            kind: NodeKind::Object,
        };
        Self {
            namespaces: vec![STANDARD_NAMESPACE.to_string()],
            nodes: HashMap::from([(OBJECTS_FOLDER, objects)]),
            next_id: FIRST_USER_NODE,
        }
    }

    fn register_namespace(&mut self, uri: &str) -> Result<u16> {
        if let Some(idx) = self.namespaces.iter().position(|n| n == uri) {
            return Ok(idx as u16);
        }
        let idx = u16::try_from(self.namespaces.len())
            .map_err(|_| BridgeError::Server("namespace table full".to_string()))?;
        self.namespaces.push(uri.to_string());
        Ok(idx)
    }

    fn add_node(&mut self, parent: NodeId, ns: u16, name: &str, kind: NodeKind) -> Result<NodeId> {
        if usize::from(ns) >= self.namespaces.len() {
            return Err(BridgeError::Server(format!("namespace {ns} is not registered")));
        }
        match self.nodes.get(&parent) {
            Some(Node {
                kind: NodeKind::Object,
                ..
            }) => {}
            _ => return Err(BridgeError::Server(format!("node {parent} is not an object"))),
        }
        let browse_name = QualifiedName::new(ns, name);
        if self.child(parent, &browse_name).is_some() {
            return Err(BridgeError::Server(format!(
                "node {parent} already has a child {browse_name}"
            )));
        }

        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                browse_name,
                parent: Some(parent),
                kind,
            },
        );
        Ok(id)
    }

    fn child(&self, parent: NodeId, name: &QualifiedName) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.parent == Some(parent) && &n.browse_name == name)
            .map(|(id, _)| *id)
    }

    fn browse(&self, path: &[QualifiedName]) -> Result<NodeId> {
        let (root, rest) = path
            .split_first()
            .ok_or_else(|| BridgeError::Resolve("empty browse path".to_string()))?;
        if self.nodes[&OBJECTS_FOLDER].browse_name != *root {
            return Err(BridgeError::Resolve(format!("unknown root {root}")));
        }
        rest.iter().try_fold(OBJECTS_FOLDER, |parent, name| {
            self.child(parent, name)
                .ok_or_else(|| BridgeError::Resolve(format!("no child {name} under node {parent}")))
        })
    }

    fn variable_mut(&mut self, node: NodeId) -> Result<(&mut Variant, &mut bool)> {
        match self.nodes.get_mut(&node) {
            Some(Node {
                kind: NodeKind::Variable { value, writable },
                ..
            }) => Ok((value, writable)),
            _ => Err(BridgeError::Write(format!("node {node} is not a variable"))),
        }
    }

    fn read(&self, node: NodeId) -> Result<Variant> {
        match self.nodes.get(&node) {
            Some(Node {
                kind: NodeKind::Variable { value, .. },
                ..
            }) => Ok(*value),
            _ => Err(BridgeError::Read(format!("node {node} is not a variable"))),
        }
    }
}

type SharedSpace = Arc<RwLock<AddressSpace>>;

struct Running {
    token: CancellationToken,
    accept: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Variable server that publishes its address space to WebSocket clients.
///
/// Clients may browse and read any variable and write the writable ones. Every
/// change is pushed to all connected clients.
pub struct WsVariableServer {
    endpoint: Option<(String, u16)>,
    space: SharedSpace,
    changes: broadcast::Sender<ServerMessage>,
    running: Option<Running>,
}

impl WsVariableServer {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            endpoint: None,
            space: Arc::new(RwLock::new(AddressSpace::new())),
            changes,
            running: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn read_value(&self, variable: NodeHandle) -> Result<Variant> {
        self.space
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .read(variable.0)
    }

    fn space_mut(&self) -> std::sync::RwLockWriteGuard<'_, AddressSpace> {
        self.space.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for WsVariableServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WsVariableServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.token.cancel();
        }
    }
}

#[async_trait]
impl VariableServer for WsVariableServer {
    fn set_endpoint(&mut self, url: &str) -> Result<()> {
        self.endpoint = Some(parse_endpoint(url)?);
        Ok(())
    }

    fn register_namespace(&mut self, uri: &str) -> Result<u16> {
        self.space_mut().register_namespace(uri)
    }

    fn add_object(&mut self, ns: u16, name: &str) -> Result<NodeHandle> {
        self.space_mut()
            .add_node(OBJECTS_FOLDER, ns, name, NodeKind::Object)
            .map(NodeHandle)
    }

    fn add_variable(
        &mut self,
        object: NodeHandle,
        ns: u16,
        name: &str,
        initial: Variant,
    ) -> Result<NodeHandle> {
        if !initial.is_finite() {
            return Err(BridgeError::Server(format!("{name} needs a finite initial value")));
        }
        let kind = NodeKind::Variable {
            value: initial,
            writable: false,
        };
        self.space_mut()
            .add_node(object.0, ns, name, kind)
            .map(NodeHandle)
    }

    fn set_writable(&mut self, variable: NodeHandle) -> Result<()> {
        let mut space = self.space_mut();
        let (_, writable) = space
            .variable_mut(variable.0)
            .map_err(|e| BridgeError::Server(e.to_string()))?;
        *writable = true;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(BridgeError::Server("already started".to_string()));
        }
        let (host, port) = self
            .endpoint
            .clone()
            .ok_or_else(|| BridgeError::Server("endpoint not set".to_string()))?;
        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| BridgeError::Server(format!("bind {host}:{port}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let token = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.space),
            self.changes.clone(),
            token.clone(),
        ));
        tracing::info!(%local_addr, "variable server listening");

        self.running = Some(Running {
            token,
            accept,
            local_addr,
        });
        Ok(())
    }

    async fn write_value(&mut self, variable: NodeHandle, value: Variant) -> Result<()> {
        if !value.is_finite() {
            return Err(BridgeError::Write(format!(
                "node {} cannot hold non-finite value {value}",
                variable.0
            )));
        }
        {
            let mut space = self.space_mut();
            let (slot, _) = space.variable_mut(variable.0)?;
            *slot = value;
        }
        // no subscribers is fine
        let _ = self.changes.send(ServerMessage::Changed {
            node: variable.0,
            value,
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let running = self
            .running
            .take()
            .ok_or_else(|| BridgeError::Server("not running".to_string()))?;
        running.token.cancel();
        running
            .accept
            .await
            .map_err(|e| BridgeError::Server(format!("accept task failed: {e}")))?;
        tracing::info!(local_addr = %running.local_addr, "variable server stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    space: SharedSpace,
    changes: broadcast::Sender<ServerMessage>,
    token: CancellationToken,
) {
    let clients = TaskTracker::new();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, address)) => {
                    tracing::debug!(%address, "client connected");
                    let space = Arc::clone(&space);
                    let rx = changes.subscribe();
                    let changes = changes.clone();
                    let token = token.child_token();
                    clients.spawn(async move {
                        if let Err(e) = serve_client(stream, space, changes, rx, token).await {
                            tracing::debug!(%address, error = %e, "client connection ended");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
        }
    }
    drop(listener);
    clients.close();
    clients.wait().await;
}

async fn serve_client(
    stream: TcpStream,
    space: SharedSpace,
    changes: broadcast::Sender<ServerMessage>,
    mut rx: broadcast::Receiver<ServerMessage>,
    token: CancellationToken,
) -> Result<()> {
    let ws_stream = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_async(stream)) => match handshake {
            Ok(ws_stream) => ws_stream?,
            Err(_) => {
                return Err(BridgeError::Protocol(format!(
                    "no handshake within {HANDSHAKE_TIMEOUT:?}"
                )))
            }
        },
    };
    let (mut write, mut read) = ws_stream.split();

    loop {
        let outgoing = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = tokio::time::timeout(HANDSHAKE_TIMEOUT, write.close()).await;
                return Ok(());
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_text(&space, &changes, &text),
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            },
            pushed = rx.recv() => match pushed {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "client lagging behind changes");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        };
        write
            .send(Message::Text(serde_json::to_string(&outgoing)?))
            .await?;
    }
}

fn handle_text(
    space: &SharedSpace,
    changes: &broadcast::Sender<ServerMessage>,
    text: &str,
) -> ServerMessage {
    match serde_json::from_str::<Request>(text) {
        Ok(request) => handle_request(space, changes, request),
        Err(e) => ServerMessage::Error {
            id: 0,
            message: format!("bad request: {e}"),
        },
    }
}

fn handle_request(
    space: &SharedSpace,
    changes: &broadcast::Sender<ServerMessage>,
    request: Request,
) -> ServerMessage {
    let id = request.id();
    let outcome = match request {
        Request::Browse { path, .. } => space
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .browse(&path)
            .map(|node| ServerMessage::Node { id, node }),
        Request::Read { node, .. } => space
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .read(node)
            .map(|value| ServerMessage::Value { id, value }),
        Request::Write { node, value, .. } => {
            let written = {
                let mut space = space.write().unwrap_or_else(PoisonError::into_inner);
                space.variable_mut(node).and_then(|(slot, writable)| {
                    if !*writable {
                        return Err(BridgeError::Write(format!("node {node} is not writable")));
                    }
                    *slot = value;
                    Ok(())
                })
            };
            written.map(|()| {
                let _ = changes.send(ServerMessage::Changed { node, value });
                ServerMessage::Ack { id }
            })
        }
    };
    outcome.unwrap_or_else(|e| ServerMessage::Error {
        id,
        message: e.to_string(),
    })
}
