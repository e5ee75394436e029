// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Portico: HTTP API Gateway
//
//  Data plane:  monoio thread-per-core, shared-nothing workers
//  Background:  tokio thread (health probes, config polling, sidecar)
//  Config:      static YAML + polled routing-state file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use portico_balance::active_health::{ActiveHealthChecker, HealthView};
use portico_balance::balancer::LoadBalancer;
use portico_balance::breaker::BreakerRegistry;
use portico_balance::passive_health::PassiveHealthChecker;
use portico_core::config::GatewayConfig;
use portico_core::router::{CompiledRouter, Router};
use portico_observability::access_log::AccessLogger;
use portico_observability::metrics::MetricsCollector;
use portico_plugin::chain::ChainManager;
use portico_plugin::registry::FilterRegistry;
use portico_plugins::FilterDeps;
use portico_plugins::sidecar::SidecarClient;
use portico_proxy::proxy::ProxyEngine;
use portico_proxy::worker;
use portico_store::{FileSource, SnapshotHandle};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info};

/// Global shutdown flag, set by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

const EXIT_FATAL: i32 = 1;
const EXIT_CONFIG: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "portico", version, about = "Portico HTTP API Gateway")]
struct Cli {
    /// Path to the static configuration file
    #[arg(short, long, default_value = "/etc/portico/portico.yaml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Routing state file override (routes, upstreams, consumers)
    #[arg(long)]
    state_file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    portico_observability::logger::init(&cli.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Portico starting");

    // ── Static config ──
    let mut config = if cli.config.exists() {
        info!(path = %cli.config.display(), "Loading config file");
        match GatewayConfig::load(&cli.config) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Invalid configuration");
                std::process::exit(EXIT_CONFIG);
            }
        }
    } else {
        info!("No config file found, using defaults");
        GatewayConfig::default()
    };
    if let Some(state_file) = cli.state_file {
        config.source.state_file = state_file;
    }
    let config = Arc::new(config);

    let num_workers = config.effective_workers();
    info!(workers = num_workers, "Worker count");

    // ── Shared data-plane state ──
    let snapshots = Arc::new(SnapshotHandle::new());
    let router = Arc::new(Router::new());
    let chains = Arc::new(ChainManager::new());
    let health_view = Arc::new(HealthView::new());
    let passive = Arc::new(PassiveHealthChecker::new());
    let breakers = Arc::new(BreakerRegistry::new());
    let balancer = Arc::new(LoadBalancer::new(
        Arc::clone(&health_view),
        Arc::clone(&passive),
        Arc::clone(&breakers),
    ));
    let metrics = Arc::new(MetricsCollector::new().unwrap_or_else(|e| {
        error!(error = %e, "Metrics init failed");
        std::process::exit(EXIT_FATAL);
    }));

    wire_traffic_callbacks(&balancer, &passive, &breakers, &metrics);

    // ── Background thread: sidecar, access log, probes, config polling ──
    // Everything that publishes snapshots runs here so commit hooks can
    // spawn tokio tasks (active health probes).
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    {
        let config = Arc::clone(&config);
        let snapshots = Arc::clone(&snapshots);
        let router = Arc::clone(&router);
        let chains = Arc::clone(&chains);
        let balancer = Arc::clone(&balancer);
        let passive = Arc::clone(&passive);
        let breakers = Arc::clone(&breakers);
        let health_view = Arc::clone(&health_view);
        let metrics = Arc::clone(&metrics);

        std::thread::Builder::new()
            .name("portico-background".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("Failed to build tokio runtime");

                rt.block_on(async move {
                    let sidecar = Arc::new(SidecarClient::start());
                    let access_log =
                        Arc::new(AccessLogger::start(config.observability.access_log.clone()));

                    let mut registry = FilterRegistry::new();
                    portico_plugins::register_all(
                        &mut registry,
                        FilterDeps {
                            breakers: Arc::clone(&breakers),
                            sidecar,
                        },
                    );
                    info!(kinds = registry.len(), "Filters registered");
                    let registry = Arc::new(registry);

                    let active = Arc::new(ActiveHealthChecker::new(Arc::clone(&health_view)));
                    {
                        let balancer_cb = Arc::clone(&balancer);
                        let metrics_cb = Arc::clone(&metrics);
                        active.on_change(Arc::new(move |upstream, target, healthy| {
                            metrics_cb
                                .target_healthy
                                .with_label_values(&[upstream, target])
                                .set(healthy as i64);
                            balancer_cb.rebuild_ring(upstream);
                        }));
                    }

                    register_committers(
                        &snapshots, &router, &chains, &registry, &balancer, &passive,
                        &breakers, &active,
                    );

                    // Initial snapshot: validation failure is a config exit
                    let source = Arc::new(FileSource::new(config.source.state_file.clone()));
                    let initial =
                        portico_store::file::initial_publish(source.as_ref(), &snapshots).await;
                    let ok = match initial {
                        Ok(version) => {
                            info!(version, "Initial snapshot published");
                            true
                        }
                        Err(e) => {
                            error!(
                                path = %config.source.state_file.display(),
                                error = %e,
                                "Initial routing state rejected"
                            );
                            false
                        }
                    };
                    let _ = ready_tx.send((ok, access_log));
                    if !ok {
                        return;
                    }

                    portico_store::file::poll_loop(
                        source,
                        snapshots,
                        Duration::from_secs(config.source.poll_interval_secs),
                    )
                    .await;
                });
            })
            .expect("Failed to spawn background thread");
    }

    let (ready, access_log) = ready_rx.recv().unwrap_or_else(|_| {
        error!("Background thread died during startup");
        std::process::exit(EXIT_FATAL);
    });
    if !ready {
        std::process::exit(EXIT_CONFIG);
    }

    // ── Data-plane workers ──
    let engine = Arc::new(ProxyEngine {
        router,
        chains,
        snapshots,
        balancer,
        breakers,
        passive,
        config: Arc::clone(&config),
        metrics,
        access_log,
    });
    let worker_handles = worker::spawn_workers(engine, num_workers);

    info!(
        workers = num_workers,
        proxy_addr = %config.proxy.http_addr,
        state_file = %config.source.state_file.display(),
        "Portico is ready, serving traffic"
    );

    // ── Shutdown on SIGTERM/SIGINT ──
    setup_signal_handler();
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("Shutdown signal received, stopping");
    // Workers run infinite accept loops; thread teardown happens with the
    // process.
    drop(worker_handles);
    info!("Portico stopped");
}

/// Health and breaker callbacks that keep metrics and hash rings aligned.
fn wire_traffic_callbacks(
    balancer: &Arc<LoadBalancer>,
    passive: &Arc<PassiveHealthChecker>,
    breakers: &Arc<BreakerRegistry>,
    metrics: &Arc<MetricsCollector>,
) {
    {
        let balancer = Arc::clone(balancer);
        let metrics = Arc::clone(metrics);
        passive.on_change(Arc::new(move |upstream, target, healthy| {
            metrics
                .target_healthy
                .with_label_values(&[upstream, target])
                .set(healthy as i64);
            balancer.rebuild_ring(upstream);
        }));
    }
    {
        let metrics = Arc::clone(metrics);
        breakers.on_state_change(Arc::new(move |name, _from, to| {
            metrics
                .breaker_transitions
                .with_label_values(&[name, &to.to_string()])
                .inc();
        }));
    }
}

/// Snapshot commit pipeline: fallible steps (router compile, chain
/// assembly) run first so a rejected snapshot leaves everything serving the
/// previous one; traffic-state reconciliation follows.
#[allow(clippy::too_many_arguments)]
fn register_committers(
    snapshots: &Arc<SnapshotHandle>,
    router: &Arc<Router>,
    chains: &Arc<ChainManager>,
    registry: &Arc<FilterRegistry>,
    balancer: &Arc<LoadBalancer>,
    passive: &Arc<PassiveHealthChecker>,
    breakers: &Arc<BreakerRegistry>,
    active: &Arc<ActiveHealthChecker>,
) {
    {
        let chains = Arc::clone(chains);
        let registry = Arc::clone(registry);
        snapshots.on_publish(Box::new(move |snapshot| {
            chains.rebuild(&registry, snapshot)
        }));
    }
    {
        let router = Arc::clone(router);
        snapshots.on_publish(Box::new(move |snapshot| {
            let compiled = CompiledRouter::build(snapshot)?;
            router.reload(compiled);
            Ok(())
        }));
    }
    {
        let balancer = Arc::clone(balancer);
        let passive = Arc::clone(passive);
        let breakers = Arc::clone(breakers);
        let active = Arc::clone(active);
        snapshots.on_publish(Box::new(move |snapshot| {
            passive.reconcile(snapshot);
            breakers.reconcile(snapshot);
            balancer.reconcile(snapshot);
            active.reconcile(snapshot);
            Ok(())
        }));
    }
}

fn setup_signal_handler() {
    // SIGTERM (docker stop) + SIGINT (Ctrl+C)
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
