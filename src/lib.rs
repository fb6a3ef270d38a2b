//! Bridges one polled upstream data source to a locally hosted variable server
//! and a best-effort UDP feed.
//!
//! The [`ingest::IngestWorker`] is the only writer of the
//! [`snapshot::SharedSnapshot`]; the [`republish::RepublishWorker`] and the
//! [`forward::ForwardWorker`] read it on their own cadence. All three observe
//! the token owned by [`shutdown::ShutdownCoordinator`].

pub mod config;
pub mod error;
pub mod forward;
pub mod ingest;
pub mod republish;
pub mod server;
pub mod shutdown;
pub mod snapshot;
pub mod source;
pub mod ticker;
pub mod wire;
pub mod ws_client;

pub use error::{BridgeError, Result};
