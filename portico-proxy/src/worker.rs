use crate::pool::ConnPool;
use crate::proxy::ProxyEngine;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Spawn monoio worker threads, one per core.
///
/// Each thread runs an independent monoio runtime with its own TCP
/// listener (SO_REUSEPORT), event loop, and thread-local connection pool.
/// All shared state lives in the engine behind swap-on-publish pointers.
pub fn spawn_workers(
    engine: Arc<ProxyEngine>,
    num_workers: usize,
) -> Vec<std::thread::JoinHandle<()>> {
    let listen_addr = engine.config.proxy.http_addr.to_string();
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let engine = Arc::clone(&engine);
        let addr = listen_addr.clone();

        let handle = std::thread::Builder::new()
            .name(format!("portico-worker-{worker_id}"))
            .spawn(move || {
                let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_all()
                    .build()
                    .expect("Failed to build monoio runtime");

                rt.block_on(worker_loop(worker_id, engine, addr));
            })
            .expect("Failed to spawn worker thread");

        handles.push(handle);
    }

    info!(workers = num_workers, addr = %listen_addr, "Workers spawned");
    handles
}

/// Main loop for a single worker thread.
///
/// One ConnPool per thread, shared by all connections via Rc<RefCell>.
/// The pool is pre-warmed before accepting traffic, and idle connections
/// are reaped on a timer.
async fn worker_loop(worker_id: usize, engine: Arc<ProxyEngine>, addr: String) {
    use monoio::net::TcpListener;

    let listener = TcpListener::bind(&addr).unwrap_or_else(|e| {
        panic!("Worker {worker_id} failed to bind to {addr}: {e}");
    });

    info!(worker = worker_id, addr = %addr, "Worker listening");

    let proxy_cfg = &engine.config.proxy;
    let mut pool_inner = ConnPool::new(
        proxy_cfg.max_idle_conns_per_host,
        proxy_cfg.max_idle_conns,
        Duration::from_millis(proxy_cfg.keepalive_timeout_ms),
    );

    // Pre-warm against every known target
    let snapshot = engine.snapshots.current();
    let upstream_addrs: Vec<String> = snapshot
        .upstreams
        .values()
        .flat_map(|u| u.target_addrs())
        .collect();
    let warm_count = (proxy_cfg.max_idle_conns_per_host / 2).clamp(1, 8);
    pool_inner.warm(&upstream_addrs, warm_count).await;
    drop(snapshot);

    let pool = Rc::new(RefCell::new(pool_inner));

    // Idle-connection reaping runs off the accept path
    {
        let pool = Rc::clone(&pool);
        let reap_interval =
            Duration::from_millis(proxy_cfg.keepalive_timeout_ms.max(1000) / 2);
        monoio::spawn(async move {
            loop {
                monoio::time::sleep(reap_interval).await;
                pool.borrow_mut().reap();
            }
        });
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                // Nagle off for lowest latency
                let _ = stream.set_nodelay(true);

                let engine = Arc::clone(&engine);
                let pool = Rc::clone(&pool);

                monoio::spawn(async move {
                    if let Err(e) =
                        crate::connection::handle_connection(stream, peer_addr, engine, pool)
                            .await
                    {
                        tracing::debug!(error = %e, "Connection closed");
                    }
                });
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "Accept error");
            }
        }
    }
}
