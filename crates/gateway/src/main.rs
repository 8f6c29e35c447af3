//! Gateway service entry point.
//!
//! Exit codes: 0 clean, 2 configuration error, 3 bus/cache unreachable in
//! strict startup mode. The default is lenient: the process starts degraded
//! and the bus client reconnects with backoff.

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use auth::TokenVerifier;
use bus_client::{Bus, NatsBus, ReconnectConfig};
use gateway::{api_router, ws_router, AppState, Config, Dispatcher};
use metrics_exporter_prometheus::PrometheusBuilder;
use session_cache::{RedisSessionCache, SessionStore};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting chat gateway");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            std::process::exit(2);
        }
    };
    config.log();

    if let Err(e) = PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
    {
        warn!("metrics exporter not started: {}", e);
    }

    let bus: Arc<dyn Bus> = if config.startup_strict {
        match NatsBus::connect(&config.bus_url).await {
            Ok(bus) => Arc::new(bus),
            Err(e) => {
                error!("cannot reach bus at {}: {}", config.bus_url, e);
                std::process::exit(3);
            }
        }
    } else {
        match NatsBus::connect_lenient(&config.bus_url, ReconnectConfig::default()).await {
            Ok(bus) => Arc::new(bus),
            Err(e) => {
                error!("cannot initialize bus client: {}", e);
                std::process::exit(3);
            }
        }
    };

    let cache: Arc<dyn SessionStore> =
        match RedisSessionCache::new(&config.cache_url, config.cache_config()) {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                error!("invalid cache url {}: {}", config.cache_url, e);
                std::process::exit(2);
            }
        };
    if config.startup_strict {
        if let Err(e) = cache.ping().await {
            error!("cannot reach cache at {}: {}", config.cache_url, e);
            std::process::exit(3);
        }
    }

    let verifier = match TokenVerifier::new(&config.jwt_secret, &config.jwt_alg) {
        Ok(verifier) => verifier,
        Err(e) => {
            error!("invalid token configuration: {}", e);
            std::process::exit(2);
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(
        bus,
        cache.clone(),
        config.dispatcher_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        dispatcher,
        verifier,
        cache,
        connections: AtomicUsize::new(0),
        keepalive: config.keepalive,
        history_limit: config.hot_msg_limit,
        shutdown: shutdown_rx,
    });

    let app = ws_router(state.clone(), &config.stream_path)
        .merge(api_router(state, config.http_deadline))
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("gateway listening on {}", addr);

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Tell live sockets we are going away before the listener stops.
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = serve.await {
        error!("server error: {}", e);
        std::process::exit(1);
    }

    info!("gateway stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received terminate signal"),
    }
}
