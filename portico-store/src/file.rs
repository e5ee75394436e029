use crate::publisher::SnapshotHandle;
use async_trait::async_trait;
use portico_core::GatewayError;
use portico_core::snapshot::GatewayState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// A source of routing state. The file source below is the shipped
/// implementation; an etcd-style watcher plugs in at this seam.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    fn name(&self) -> &str;

    /// Load the complete state.
    async fn load(&self) -> Result<GatewayState, GatewayError>;

    /// Cheap change token (file mtime, store revision). `None` forces a
    /// reload on every poll.
    async fn fingerprint(&self) -> Option<String> {
        None
    }
}

/// YAML state file, polled for mtime changes.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self) -> Result<GatewayState, GatewayError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            GatewayError::ConfigInvalid(format!("read {}: {e}", self.path.display()))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| {
            GatewayError::ConfigInvalid(format!("parse {}: {e}", self.path.display()))
        })
    }

    async fn fingerprint(&self) -> Option<String> {
        let meta = tokio::fs::metadata(&self.path).await.ok()?;
        let mtime = meta.modified().ok()?;
        let age = mtime.duration_since(std::time::UNIX_EPOCH).ok()?;
        Some(format!("{}:{}", age.as_nanos(), meta.len()))
    }
}

/// Load the source once and publish. Used at startup, where a failure is a
/// config-validation exit.
pub async fn initial_publish(
    source: &dyn ConfigSource,
    handle: &SnapshotHandle,
) -> Result<u64, GatewayError> {
    let state = source.load().await?;
    handle.publish(state)
}

/// Poll the source forever, publishing on change. Publish failures keep the
/// previous snapshot serving and are logged for the control plane.
pub async fn poll_loop(
    source: Arc<dyn ConfigSource>,
    handle: Arc<SnapshotHandle>,
    poll_interval: Duration,
) {
    let mut last_fingerprint = source.fingerprint().await;
    let mut tick = tokio::time::interval(poll_interval.max(Duration::from_secs(1)));
    tick.tick().await; // first tick fires immediately; state was just published

    loop {
        tick.tick().await;

        let fingerprint = source.fingerprint().await;
        if fingerprint.is_some() && fingerprint == last_fingerprint {
            continue;
        }

        match source.load().await {
            Ok(state) => match handle.publish(state) {
                Ok(version) => {
                    info!(source = source.name(), version, "Config reloaded");
                    last_fingerprint = fingerprint;
                }
                Err(e) => {
                    error!(source = source.name(), error = %e, "Config rejected");
                    // Do not advance the fingerprint: a fixed file with the
                    // same mtime is unlikely, a changed one retries anyway.
                }
            },
            Err(e) => {
                debug!(source = source.name(), error = %e, "Config source unavailable");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(content: &str) -> (tempdir::TempDirGuard, PathBuf) {
        let dir = tempdir::create();
        let path = dir.path.join("state.yaml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    // Minimal self-cleaning temp dir (no extra dev-dependency)
    mod tempdir {
        use std::path::PathBuf;

        pub struct TempDirGuard {
            pub path: PathBuf,
        }

        impl Drop for TempDirGuard {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.path);
            }
        }

        pub fn create() -> TempDirGuard {
            let path = std::env::temp_dir().join(format!(
                "portico-store-test-{}-{:?}",
                std::process::id(),
                std::thread::current().id()
            ));
            std::fs::create_dir_all(&path).unwrap();
            TempDirGuard { path }
        }
    }

    #[tokio::test]
    async fn test_file_source_loads_state() {
        let (_guard, path) = write_temp(
            r#"
upstreams:
  - id: us1
    targets: [{host: a, port: 80}]
routes:
  - id: r1
    paths: [{type: prefix, value: /}]
    upstream_id: us1
"#,
        );
        let source = FileSource::new(path);
        let state = source.load().await.unwrap();
        assert_eq!(state.routes.len(), 1);
        assert_eq!(state.upstreams.len(), 1);
        assert!(source.fingerprint().await.is_some());
    }

    #[tokio::test]
    async fn test_missing_file_is_config_error() {
        let source = FileSource::new(PathBuf::from("/nonexistent/portico.yaml"));
        assert!(matches!(
            source.load().await,
            Err(GatewayError::ConfigInvalid(_))
        ));
        assert!(source.fingerprint().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_yaml_is_config_error() {
        let (_guard, path) = write_temp("routes: [not yaml: {{");
        let source = FileSource::new(path);
        assert!(matches!(
            source.load().await,
            Err(GatewayError::ConfigInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_initial_publish() {
        let (_guard, path) = write_temp(
            r#"
upstreams:
  - id: us1
    targets: [{host: a, port: 80}]
"#,
        );
        let handle = SnapshotHandle::new();
        let version = initial_publish(&FileSource::new(path), &handle).await.unwrap();
        assert_eq!(version, 1);
        assert!(handle.current().upstream("us1").is_some());
    }

    #[tokio::test]
    async fn test_fingerprint_changes_with_content() {
        let (_guard, path) = write_temp("routes: []\n");
        let source = FileSource::new(path.clone());
        let first = source.fingerprint().await.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&path, "routes: []\nupstreams: []\n").unwrap();
        let second = source.fingerprint().await.unwrap();
        assert_ne!(first, second);
    }
}
