//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Initialize logging, metrics and the coordination store in dependency order
//! - Start background tasks (snapshots, config hot reload)
//! - Bind the admin listener last
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Hot reload swaps site policies only; store and listener changes need a restart

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::RecommendedWatcher;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::admin::{self, AdminState};
use crate::config::loader::{load_config, ConfigError};
use crate::config::schema::{ResilienceConfig, StoreBackend, StoreConfig};
use crate::config::validation::validate_config;
use crate::config::watcher::ConfigWatcher;
use crate::guard::Guard;
use crate::lifecycle::shutdown::Shutdown;
use crate::observability::{logging, metrics};
use crate::store::memory::spawn_snapshot_task;
use crate::store::{KeyStore, MemoryStore, SharedClock, StoreError, SystemClock};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("key store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("{0}")]
    Unsupported(String),
}

/// A started resilience layer and the background tasks serving it.
pub struct Runtime {
    guard: Guard,
    shutdown: Arc<Shutdown>,
    admin_addr: Option<SocketAddr>,
    _watcher: Option<RecommendedWatcher>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("guard", &self.guard)
            .field("admin_addr", &self.admin_addr)
            .field("watching", &self._watcher.is_some())
            .finish()
    }
}

impl Runtime {
    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    /// Shared shutdown coordinator, e.g. for [`crate::lifecycle::signals::spawn_signal_listener`].
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// Bound admin address, when the admin surface is enabled.
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    /// Stop background tasks, writing a final store snapshot if configured.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let clean = self.shutdown.drain(timeout).await;
        tracing::info!(clean, "Shutdown complete");
        clean
    }
}

/// Build the coordination store described by `config`.
///
/// A persistent in-process store registers its snapshot task with `shutdown`.
pub async fn build_store(
    config: &StoreConfig,
    clock: SharedClock,
    shutdown: &Shutdown,
) -> Result<Arc<dyn KeyStore>, StartupError> {
    match config.backend {
        StoreBackend::Memory => {
            let Some(path) = &config.persistence_path else {
                tracing::info!(max_entries = config.max_entries, "Using in-process key store");
                return Ok(Arc::new(MemoryStore::new(clock, config.max_entries)));
            };
            let store = Arc::new(MemoryStore::with_persistence(
                clock,
                config.max_entries,
                path.clone(),
            )?);
            shutdown.track(spawn_snapshot_task(
                Arc::clone(&store),
                Duration::from_secs(config.snapshot_interval_secs.max(1)),
                shutdown.subscribe(),
            ));
            tracing::info!(
                path = %path.display(),
                interval_secs = config.snapshot_interval_secs,
                "Using persistent in-process key store"
            );
            Ok(store)
        }
        StoreBackend::Redis => redis_store(config).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_store(config: &StoreConfig) -> Result<Arc<dyn KeyStore>, StartupError> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| StartupError::Unsupported("redis backend requires store.url".into()))?;
    let store = crate::store::redis::RedisStore::connect(url, config.key_prefix.clone()).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn redis_store(_config: &StoreConfig) -> Result<Arc<dyn KeyStore>, StartupError> {
    Err(StartupError::Unsupported(
        "redis backend requires building with the `redis` feature".into(),
    ))
}

/// Load `path` and start with hot reload enabled.
pub async fn start_from_file(path: &Path) -> Result<Runtime, StartupError> {
    let config = load_config(path)?;
    start(config, Some(path)).await
}

/// Start the resilience layer. With `config_path`, the file is watched and
/// valid changes replace site policies in place.
pub async fn start(
    config: ResilienceConfig,
    config_path: Option<&Path>,
) -> Result<Runtime, StartupError> {
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        sites = config.sites.len(),
        "bulwark starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Arc::new(Shutdown::new());
    let clock: SharedClock = Arc::new(SystemClock);
    let store = build_store(&config.store, clock.clone(), &shutdown).await?;

    let guard = Guard::builder()
        .store(store)
        .clock(clock)
        .config(&config)
        .build();

    let watcher = match config_path {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            let handle = watcher.run()?;
            shutdown.track(spawn_reload_task(guard.clone(), updates, &shutdown));
            Some(handle)
        }
        None => None,
    };

    let admin_addr = if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let addr = listener.local_addr()?;
        let state = AdminState {
            guard: guard.clone(),
            api_key: config.admin.api_key.clone(),
        };
        let stop = shutdown.subscribe();
        shutdown.track(tokio::spawn(async move {
            if let Err(e) = admin::serve(listener, state, stop).await {
                tracing::error!(error = %e, "Admin server failed");
            }
        }));
        Some(addr)
    } else {
        None
    };

    Ok(Runtime {
        guard,
        shutdown,
        admin_addr,
        _watcher: watcher,
    })
}

fn spawn_reload_task(
    guard: Guard,
    mut updates: mpsc::UnboundedReceiver<ResilienceConfig>,
    shutdown: &Shutdown,
) -> tokio::task::JoinHandle<()> {
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(config) => guard.reload(&config),
                    None => break,
                },
                _ = stop.recv() => break,
            }
        }
    })
}
