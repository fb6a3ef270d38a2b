use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::shutdown::{cancellable, catch_panic, WorkerExit};
use crate::snapshot::SharedSnapshot;
use crate::source::{NodeHandle, NodePath, UpstreamSource, Variant};
use crate::ticker::Ticker;

#[derive(Debug, Clone)]
pub struct IngestPaths {
    pub counter: NodePath,
    pub random: NodePath,
    pub derived: NodePath,
}

/// Polls the upstream source and commits each pass into the snapshot.
///
/// Connects and resolves once. A connect, resolve or read failure ends the
/// loop; there is no reconnect.
pub struct IngestWorker<S> {
    source: S,
    paths: IngestPaths,
    snapshot: Arc<SharedSnapshot>,
    interval: Duration,
    connect_timeout: Duration,
}

impl<S: UpstreamSource> IngestWorker<S> {
    pub fn new(
        source: S,
        paths: IngestPaths,
        snapshot: Arc<SharedSnapshot>,
        interval: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            source,
            paths,
            snapshot,
            interval,
            connect_timeout,
        }
    }

    pub async fn run(mut self, token: CancellationToken) -> WorkerExit {
        let outcome = catch_panic(self.poll(&token)).await;

        // best effort, the source may never have connected
        match tokio::time::timeout(self.connect_timeout, self.source.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(worker = "ingest", error = %e, "disconnect failed"),
            Err(_) => tracing::warn!(worker = "ingest", "disconnect timed out"),
        }

        match outcome {
            Ok(()) | Err(BridgeError::Cancelled) => {
                tracing::info!(worker = "ingest", "stopped");
                WorkerExit::Cancelled
            }
            Err(e) => {
                tracing::error!(worker = "ingest", error = %e, "ingest loop terminated");
                WorkerExit::Failed(e)
            }
        }
    }

    async fn poll(&mut self, token: &CancellationToken) -> Result<()> {
        let connect = tokio::time::timeout(self.connect_timeout, self.source.connect());
        match cancellable(token, connect).await? {
            Ok(connected) => connected?,
            Err(_) => {
                return Err(BridgeError::Connection(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                )))
            }
        }

        let paths = self.paths.clone();
        let counter_node = self.resolve(token, &paths.counter).await?;
        let random_node = self.resolve(token, &paths.random).await?;
        let derived_node = self.resolve(token, &paths.derived).await?;
        tracing::info!(worker = "ingest", interval = ?self.interval, "polling upstream");

        let mut ticker = Ticker::new(self.interval);
        while ticker.tick(token).await {
            let counter = self.read(token, counter_node).await?;
            let counter = counter
                .as_i64()
                .ok_or_else(|| BridgeError::Read(format!("counter is not an integer: {counter}")))?;
            let random = as_float(self.read(token, random_node).await?, "random")?;
            let derived = as_float(self.read(token, derived_node).await?, "derived")?;

            self.snapshot.update(counter, random, derived);
            tracing::trace!(counter, random, derived, "snapshot updated");
        }
        Ok(())
    }

    async fn resolve(&mut self, token: &CancellationToken, path: &NodePath) -> Result<NodeHandle> {
        let node = cancellable(token, self.source.resolve(path)).await??;
        tracing::debug!(worker = "ingest", %path, node = node.0, "resolved");
        Ok(node)
    }

    async fn read(&mut self, token: &CancellationToken, node: NodeHandle) -> Result<Variant> {
        cancellable(token, self.source.read_value(node)).await?
    }
}

fn as_float(value: Variant, name: &str) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| BridgeError::Read(format!("{name} is not numeric: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        fail_connect: bool,
        hang_connect: bool,
        hang_disconnect: bool,
        fail_read_after: Option<usize>,
        panic_on_read: bool,
        counter_value: Option<Variant>,
    }

    /// Scripted upstream that counts calls through shared atomics.
    struct FakeSource {
        script: Script,
        reads: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
        next: Arc<Mutex<i64>>,
    }

    impl FakeSource {
        fn new(script: Script) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let reads = Arc::new(AtomicUsize::new(0));
            let disconnects = Arc::new(AtomicUsize::new(0));
            let source = Self {
                script,
                reads: Arc::clone(&reads),
                disconnects: Arc::clone(&disconnects),
                next: Arc::new(Mutex::new(0)),
            };
            (source, reads, disconnects)
        }
    }

    #[async_trait]
    impl UpstreamSource for FakeSource {
        async fn connect(&mut self) -> Result<()> {
            if self.script.hang_connect {
                std::future::pending::<()>().await;
            }
            if self.script.fail_connect {
                return Err(BridgeError::Connection("refused".to_string()));
            }
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            if self.script.hang_disconnect {
                std::future::pending::<()>().await;
            }
            Err(BridgeError::Connection("already gone".to_string()))
        }

        async fn resolve(&mut self, path: &NodePath) -> Result<NodeHandle> {
            let leaf = &path.segments()[2].name;
            match leaf.as_str() {
                "Counter" => Ok(NodeHandle(1)),
                "Random" => Ok(NodeHandle(2)),
                "Senoidal" => Ok(NodeHandle(3)),
                _ => Err(BridgeError::Resolve(leaf.clone())),
            }
        }

        async fn read_value(&mut self, node: NodeHandle) -> Result<Variant> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if self.script.panic_on_read {
                panic!("driver bug");
            }
            if self.script.fail_read_after.is_some_and(|limit| n >= limit) {
                return Err(BridgeError::Read("bad status".to_string()));
            }
            let mut next = self.next.lock().unwrap();
            Ok(match node.0 {
                1 => {
                    *next += 1;
                    self.script.counter_value.unwrap_or(Variant::Int(*next))
                }
                2 => Variant::Double(*next as f64 / 10.0),
                _ => Variant::Double(-(*next as f64)),
            })
        }
    }

    fn paths() -> IngestPaths {
        IngestPaths {
            counter: "0:Objects/3:Simulation/3:Counter".parse().unwrap(),
            random: "0:Objects/3:Simulation/3:Random".parse().unwrap(),
            derived: "0:Objects/3:Simulation/3:Senoidal".parse().unwrap(),
        }
    }

    fn worker(source: FakeSource, snapshot: &Arc<SharedSnapshot>) -> IngestWorker<FakeSource> {
        IngestWorker::new(
            source,
            paths(),
            Arc::clone(snapshot),
            Duration::from_millis(50),
            Duration::from_secs(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_cancelled() {
        let snapshot = Arc::new(SharedSnapshot::new());
        let (source, reads, disconnects) = FakeSource::new(Script::default());
        let token = CancellationToken::new();
        let task = tokio::spawn(worker(source, &snapshot).run(token.clone()));

        tokio::time::sleep(Duration::from_millis(120)).await;
        token.cancel();
        let exit = task.await.unwrap();

        assert!(exit.is_cancelled());
        // ticks at 0, 50 and 100 ms
        assert_eq!(reads.load(Ordering::SeqCst), 9);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        let sample = snapshot.sample();
        assert_eq!(sample.counter, 3);
        assert_eq!(sample.random, 0.3);
        assert_eq!(sample.derived, -3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_exits_cleanly() {
        let snapshot = Arc::new(SharedSnapshot::new());
        let (source, reads, disconnects) = FakeSource::new(Script {
            fail_connect: true,
            ..Script::default()
        });

        let exit = worker(source, &snapshot).run(CancellationToken::new()).await;

        assert!(matches!(exit, WorkerExit::Failed(BridgeError::Connection(_))));
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(snapshot.read_counts(), (0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let snapshot = Arc::new(SharedSnapshot::new());
        let (source, _, disconnects) = FakeSource::new(Script {
            hang_connect: true,
            ..Script::default()
        });

        let exit = worker(source, &snapshot).run(CancellationToken::new()).await;

        match exit {
            WorkerExit::Failed(BridgeError::Connection(msg)) => assert!(msg.contains("timed out")),
            other => panic!("unexpected exit: {other:?}"),
        }
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_hung_connect() {
        let snapshot = Arc::new(SharedSnapshot::new());
        let (source, _, disconnects) = FakeSource::new(Script {
            hang_connect: true,
            ..Script::default()
        });
        let token = CancellationToken::new();
        let task = tokio::spawn(worker(source, &snapshot).run(token.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert!(task.await.unwrap().is_cancelled());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_disconnect_is_bounded() {
        let snapshot = Arc::new(SharedSnapshot::new());
        let (source, _, disconnects) = FakeSource::new(Script {
            hang_disconnect: true,
            ..Script::default()
        });
        let token = CancellationToken::new();
        let task = tokio::spawn(worker(source, &snapshot).run(token.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let start = tokio::time::Instant::now();

        assert!(task.await.unwrap().is_cancelled());
        // bounded by the connect timeout
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(2));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_ends_loop_and_keeps_last_snapshot() {
        let snapshot = Arc::new(SharedSnapshot::new());
        let (source, reads, disconnects) = FakeSource::new(Script {
            fail_read_after: Some(4),
            ..Script::default()
        });

        let exit = worker(source, &snapshot).run(CancellationToken::new()).await;

        assert!(matches!(exit, WorkerExit::Failed(BridgeError::Read(_))));
        assert_eq!(reads.load(Ordering::SeqCst), 5);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        // only the first pass committed
        assert_eq!(snapshot.read_counts(), (1, 0.1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_mismatch_is_read_failure() {
        let snapshot = Arc::new(SharedSnapshot::new());
        let (source, _, _) = FakeSource::new(Script {
            counter_value: Some(Variant::Bool(true)),
            ..Script::default()
        });

        let exit = worker(source, &snapshot).run(CancellationToken::new()).await;
        assert!(matches!(exit, WorkerExit::Failed(BridgeError::Read(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_in_body_still_disconnects_once() {
        let snapshot = Arc::new(SharedSnapshot::new());
        let (source, _, disconnects) = FakeSource::new(Script {
            panic_on_read: true,
            ..Script::default()
        });

        let exit = worker(source, &snapshot).run(CancellationToken::new()).await;

        assert!(matches!(exit, WorkerExit::Failed(BridgeError::Panicked(_))));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_path_fails() {
        let snapshot = Arc::new(SharedSnapshot::new());
        let (source, reads, _) = FakeSource::new(Script::default());
        let mut paths = paths();
        paths.derived = "0:Objects/3:Simulation/3:Square".parse().unwrap();
        let worker = IngestWorker::new(
            source,
            paths,
            Arc::clone(&snapshot),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );

        let exit = worker.run(CancellationToken::new()).await;
        assert!(matches!(exit, WorkerExit::Failed(BridgeError::Resolve(_))));
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }
}
