use arc_swap::ArcSwap;
use portico_core::GatewayError;
use portico_core::snapshot::{ConfigSnapshot, GatewayState};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Commit step run before a snapshot becomes current. Fallible committers
/// (chain assembly) must be registered before infallible appliers
/// (balancer/health/breaker reconciliation): a failing committer aborts the
/// publish and the previous snapshot stays active.
pub type Committer =
    Box<dyn Fn(&Arc<ConfigSnapshot>) -> Result<(), GatewayError> + Send + Sync>;

/// Atomically published configuration snapshot.
///
/// Readers load the current snapshot once at request entry and hold it for
/// the request lifetime; publishes replace the pointer and never mutate a
/// published snapshot.
pub struct SnapshotHandle {
    current: ArcSwap<ConfigSnapshot>,
    version: AtomicU64,
    committers: Mutex<Vec<Committer>>,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::new(Arc::new(ConfigSnapshot::empty())),
            version: AtomicU64::new(0),
            committers: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Register a commit step. Registration happens once at startup, before
    /// the first publish.
    pub fn on_publish(&self, committer: Committer) {
        self.committers.lock().unwrap().push(committer);
    }

    /// Validate, commit, and publish a new snapshot built from raw state.
    ///
    /// On any failure the previous snapshot is retained and the error is
    /// surfaced to the caller (the control-plane side).
    pub fn publish(&self, state: GatewayState) -> Result<u64, GatewayError> {
        let version = self.version.load(Ordering::Acquire) + 1;
        let snapshot = Arc::new(ConfigSnapshot::from_state(state, version)?);

        let committers = self.committers.lock().unwrap();
        for committer in committers.iter() {
            committer(&snapshot).inspect_err(|e| {
                error!(version, error = %e, "Snapshot rejected; previous snapshot retained");
            })?;
        }

        self.current.store(Arc::clone(&snapshot));
        self.version.store(version, Ordering::Release);
        info!(
            version,
            routes = snapshot.routes.len(),
            upstreams = snapshot.upstreams.len(),
            consumers = snapshot.consumers.len(),
            "Snapshot published"
        );
        Ok(version)
    }
}

impl Default for SnapshotHandle {
    fn default() -> Self {
        Self::new()
    }
}
