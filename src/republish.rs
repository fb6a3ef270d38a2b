use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::server::VariableServer;
use crate::shutdown::{cancellable, catch_panic, WorkerExit};
use crate::snapshot::SharedSnapshot;
use crate::source::{NodeHandle, Variant};
use crate::ticker::Ticker;

/// Where and under which names the derived value is published.
#[derive(Debug, Clone)]
pub struct RepublishSettings {
    pub endpoint: String,
    pub namespace_uri: String,
    pub object_name: String,
    pub variable_name: String,
    pub interval: Duration,
}

/// Keeps one local server variable in sync with the snapshot's derived value.
pub struct RepublishWorker<V> {
    server: V,
    settings: RepublishSettings,
    snapshot: Arc<SharedSnapshot>,
    started: bool,
}

impl<V: VariableServer> RepublishWorker<V> {
    pub fn new(server: V, settings: RepublishSettings, snapshot: Arc<SharedSnapshot>) -> Self {
        Self {
            server,
            settings,
            snapshot,
            started: false,
        }
    }

    pub async fn run(mut self, token: CancellationToken) -> WorkerExit {
        let outcome = catch_panic(self.serve(&token)).await;

        if self.started {
            match self.server.stop().await {
                Ok(()) => tracing::debug!(worker = "republish", "server stopped"),
                Err(e) => tracing::warn!(worker = "republish", error = %e, "server stop failed"),
            }
        }

        match outcome {
            Ok(()) | Err(BridgeError::Cancelled) => {
                tracing::info!(worker = "republish", "stopped");
                WorkerExit::Cancelled
            }
            Err(e) => {
                tracing::error!(worker = "republish", error = %e, "republish loop terminated");
                WorkerExit::Failed(e)
            }
        }
    }

    async fn serve(&mut self, token: &CancellationToken) -> Result<()> {
        let variable = self.setup()?;
        cancellable(token, self.server.start()).await??;
        self.started = true;
        tracing::info!(
            worker = "republish",
            endpoint = %self.settings.endpoint,
            variable = %self.settings.variable_name,
            "server started"
        );

        let mut ticker = Ticker::new(self.settings.interval);
        while ticker.tick(token).await {
            let derived = self.snapshot.read_derived();
            let write = self.server.write_value(variable, Variant::Double(derived));
            if let Err(e) = cancellable(token, write).await? {
                tracing::warn!(worker = "republish", error = %e, "write failed");
            }
        }
        Ok(())
    }

    fn setup(&mut self) -> Result<NodeHandle> {
        let settings = &self.settings;
        self.server.set_endpoint(&settings.endpoint)?;
        let ns = self.server.register_namespace(&settings.namespace_uri)?;
        let object = self.server.add_object(ns, &settings.object_name)?;
        let variable =
            self.server
                .add_variable(object, ns, &settings.variable_name, Variant::Double(0.0))?;
        self.server.set_writable(variable)?;
        Ok(variable)
    }
}
