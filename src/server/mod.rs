//! Gateway server

pub mod auth;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use self::auth::SubjectResolver;
use self::router::{create_router, AppState};
use crate::cache::RoleCache;
use crate::config::Config;
use crate::failsafe::CircuitBreaker;
use crate::kv::{KvBackend, MemoryBackend, RedisBackend};
use crate::service::RolesService;
use crate::upstream::ZitadelClient;
use crate::{Error, Result};

/// Startup budget for the store liveness check
const STARTUP_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Rolegate server
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
}

impl Gateway {
    /// Wire the gateway from configuration: KV backend, breaker, upstream
    /// client, cache, and service.
    pub async fn new(config: Config) -> Result<Self> {
        let kv: Arc<dyn KvBackend> = if config.redis_addr.is_empty() {
            info!("REDIS_ADDR empty, using in-process cache backend");
            Arc::new(MemoryBackend::new())
        } else {
            Arc::new(RedisBackend::new(&config.redis_url())?)
        };

        tokio::time::timeout(STARTUP_PING_TIMEOUT, kv.ping())
            .await
            .map_err(|_| Error::Store("store ping timed out".into()))??;

        let breaker = Arc::new(CircuitBreaker::new(
            "zitadel",
            config.cb_interval,
            config.cb_timeout,
            config.cb_max_requests,
        ));
        let idp = Arc::new(ZitadelClient::new(&config, Arc::clone(&breaker))?);
        let cache = RoleCache::new(Arc::clone(&kv), config.cache_ttl);
        let service = Arc::new(RolesService::new(idp, cache, config.cache_ttl));
        let resolver = Arc::new(SubjectResolver::new(&config.zitadel_domain)?);

        Ok(Self {
            config,
            state: Arc::new(AppState {
                service,
                resolver,
                kv,
                breaker,
            }),
        })
    }

    /// Run the gateway until shutdown
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;

        info!("============================================================");
        info!("ROLEGATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(port = self.config.port, "listening");
        info!(upstream = %self.config.zitadel_domain, "identity provider");
        info!(
            cache_ttl_secs = self.config.cache_ttl.as_secs(),
            "role snapshot TTL"
        );
        info!("============================================================");

        let app = create_router(self.state);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(format!("server error: {e}")))?;

        info!("gateway stopped");
        Ok(())
    }
}

/// Resolve when the process receives ctrl-c or SIGTERM.
///
/// Detached cleanup workers are not drained: they stop with the process
/// and their last persisted snapshot remains `running` until the job
/// record's TTL expires.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
