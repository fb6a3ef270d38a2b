//! Upstream source capability and the in-process simulation source.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Number of segments in a browse path (`Objects/<folder>/<variable>`).
pub const PATH_DEPTH: usize = 3;

/// Node id of the standard `Objects` folder.
pub const OBJECTS_FOLDER: NodeId = 85;

pub type NodeId = u32;

/// Handle to a resolved node, valid for the connection that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHandle(pub NodeId);

/// Dynamically typed value carried over the capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variant {
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl Variant {
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Variant::Int(v) => Some(v),
            Variant::Double(v)
                if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 =>
            {
                Some(v as i64)
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Variant::Int(v) => Some(v as f64),
            Variant::Double(v) => Some(v),
            Variant::Bool(_) => None,
        }
    }

    /// JSON has no NaN or infinity, so only finite values can cross the wire.
    pub fn is_finite(&self) -> bool {
        match *self {
            Variant::Double(v) => v.is_finite(),
            Variant::Int(_) | Variant::Bool(_) => true,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Int(v) => write!(f, "{v}"),
            Variant::Double(v) => write!(f, "{v}"),
            Variant::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Namespace-qualified browse name, written `ns:Name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QualifiedName {
    pub ns: u16,
    pub name: String,
}

impl QualifiedName {
    pub fn new(ns: u16, name: impl Into<String>) -> Self {
        Self {
            ns,
            name: name.into(),
        }
    }
}

impl FromStr for QualifiedName {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let (ns, name) = s
            .split_once(':')
            .ok_or_else(|| BridgeError::Config(format!("missing namespace in '{s}'")))?;
        let ns = ns
            .parse::<u16>()
            .map_err(|e| BridgeError::Config(format!("bad namespace index in '{s}': {e}")))?;
        if name.is_empty() {
            return Err(BridgeError::Config(format!("empty name in '{s}'")));
        }
        Ok(Self::new(ns, name))
    }
}

impl TryFrom<String> for QualifiedName {
    type Error = BridgeError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<QualifiedName> for String {
    fn from(q: QualifiedName) -> Self {
        q.to_string()
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ns, self.name)
    }
}

/// Three-level browse path from the root, e.g. `0:Objects/3:Simulation/3:Counter`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePath(pub [QualifiedName; PATH_DEPTH]);

impl NodePath {
    pub fn segments(&self) -> &[QualifiedName; PATH_DEPTH] {
        &self.0
    }
}

impl FromStr for NodePath {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let segments = s
            .split('/')
            .map(str::parse)
            .collect::<Result<Vec<QualifiedName>>>()?;
        let segments: [QualifiedName; PATH_DEPTH] = segments.try_into().map_err(|v: Vec<_>| {
            BridgeError::Config(format!(
                "path '{s}' has {} segments, expected {PATH_DEPTH}",
                v.len()
            ))
        })?;
        Ok(Self(segments))
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = &self.0;
        write!(f, "{a}/{b}/{c}")
    }
}

/// Client side of the upstream data source.
#[async_trait]
pub trait UpstreamSource: Send + 'static {
    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    async fn resolve(&mut self, path: &NodePath) -> Result<NodeHandle>;

    async fn read_value(&mut self, node: NodeHandle) -> Result<Variant>;
}

const SIM_NAMESPACE: u16 = 3;
const SIM_FOLDER: &str = "Simulation";
const COUNTER_MAX: i64 = 30;
const RANDOM_RANGE: std::ops::Range<f64> = -2.0..2.0;
const SINUSOID_AMPLITUDE: f64 = 2.0;
const SINUSOID_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimSignal {
    Counter,
    Random,
    Sinusoid,
}

impl SimSignal {
    fn node(self) -> NodeHandle {
        match self {
            SimSignal::Counter => NodeHandle(1001),
            SimSignal::Random => NodeHandle(1002),
            SimSignal::Sinusoid => NodeHandle(1003),
        }
    }

    fn from_node(node: NodeHandle) -> Option<Self> {
        [SimSignal::Counter, SimSignal::Random, SimSignal::Sinusoid]
            .into_iter()
            .find(|s| s.node() == node)
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Counter" => Some(SimSignal::Counter),
            "Random" => Some(SimSignal::Random),
            "Senoidal" => Some(SimSignal::Sinusoid),
            _ => None,
        }
    }
}

/// In-process stand-in for a simulation server's `Counter`, `Random` and
/// `Senoidal` (sine wave) variables under `0:Objects/3:Simulation`.
pub struct SimulationSource {
    rng: StdRng,
    counter: i64,
    connected_at: Option<Instant>,
}

impl SimulationSource {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            counter: 0,
            connected_at: None,
        }
    }

    fn next_counter(&mut self) -> i64 {
        let value = self.counter;
        self.counter = if value >= COUNTER_MAX { 0 } else { value + 1 };
        value
    }
}

impl Default for SimulationSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamSource for SimulationSource {
    async fn connect(&mut self) -> Result<()> {
        self.connected_at = Some(Instant::now());
        tracing::info!("simulation source connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected_at = None;
        Ok(())
    }

    async fn resolve(&mut self, path: &NodePath) -> Result<NodeHandle> {
        if self.connected_at.is_none() {
            return Err(BridgeError::Connection("not connected".to_string()));
        }
        let [root, folder, leaf] = path.segments();
        let signal = (root == &QualifiedName::new(0, "Objects")
            && folder == &QualifiedName::new(SIM_NAMESPACE, SIM_FOLDER)
            && leaf.ns == SIM_NAMESPACE)
            .then(|| SimSignal::from_name(&leaf.name))
            .flatten()
            .ok_or_else(|| BridgeError::Resolve(format!("no node at {path}")))?;
        Ok(signal.node())
    }

    async fn read_value(&mut self, node: NodeHandle) -> Result<Variant> {
        let connected_at = self
            .connected_at
            .ok_or_else(|| BridgeError::Connection("not connected".to_string()))?;
        let signal = SimSignal::from_node(node)
            .ok_or_else(|| BridgeError::Read(format!("unknown node {}", node.0)))?;

        let value = match signal {
            SimSignal::Counter => Variant::Int(self.next_counter()),
            SimSignal::Random => Variant::Double(self.rng.random_range(RANDOM_RANGE)),
            SimSignal::Sinusoid => {
                let phase = connected_at.elapsed().as_secs_f64() / SINUSOID_PERIOD.as_secs_f64();
                Variant::Double(SINUSOID_AMPLITUDE * (std::f64::consts::TAU * phase).sin())
            }
        };
        Ok(value)
    }
}
