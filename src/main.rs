//! Egret - Entry Point
//!
//! Wires the balancer, limiter, health checker, and servers together and
//! handles graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use egret::balancer::{CircuitBreaker, HealthView, LruBalancer, SlotAvailability};
use egret::config::Config;
use egret::health::{HealthChecker, HttpProbe, Probe, TcpProbe};
use egret::limiter::Limiter;
use egret::metrics::StatsCollector;
use egret::ops::{OpsServer, OpsState};
use egret::proxy::middleware::ProxyAuth;
use egret::proxy::server::wait_for_drain;
use egret::proxy::transport::TransportPool;
use egret::proxy::{ProxyServer, RequestHandler, RequestHandlerConfig};

/// Graceful shutdown drain window.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Configuration failures are fatal before logging is up
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("egret: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&config);
    info!(
        port = config.port,
        ops_port = config.ops_port,
        ips = ?config.ips,
        auth_enabled = !config.auth.is_empty(),
        "egret starting"
    );

    // Core components
    let stats = Arc::new(StatsCollector::new(&config.ips));
    let limiter = Arc::new(Limiter::new(
        config.max_conns_per_ip,
        config.max_conns_total,
        &config.ips,
    ));

    let breaker = if config.circuit_breaker.enabled {
        info!(
            failure_threshold = config.circuit_breaker.failure_threshold,
            success_threshold = config.circuit_breaker.success_threshold,
            "circuit breaker enabled"
        );
        Some(Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())))
    } else {
        None
    };

    let health = if config.health_check.enabled {
        let probe: Arc<dyn Probe> = match config.health_check.check_type.as_str() {
            "http" => Arc::new(HttpProbe::new(
                &config.health_check.target,
                config.health_check.timeout,
            )),
            _ => Arc::new(TcpProbe::new(
                &config.health_check.target,
                config.health_check.timeout,
            )),
        };
        info!(
            check_type = %config.health_check.check_type,
            target = %config.health_check.target,
            "health checks configured"
        );
        Some(Arc::new(HealthChecker::new(
            &config.ips,
            probe,
            config.health_check.interval,
            config.health_check.timeout,
            config.health_check.failure_threshold,
            config.health_check.success_threshold,
        )))
    } else {
        None
    };

    let balancer = Arc::new(LruBalancer::new(
        config.ips.clone(),
        config.history_window,
        config.history_size,
        config.history_max_total_entries,
        Some(limiter.clone() as Arc<dyn SlotAvailability>),
        health.clone().map(|h| h as Arc<dyn HealthView>),
        breaker.clone(),
    ));

    let transports = Arc::new(TransportPool::new(
        &config.ips,
        config.timeout,
        config.tcp_keepalive,
        config.idle_conn_timeout,
    ));

    let auth = ProxyAuth::new(config.auth_credentials());

    let handler = Arc::new(RequestHandler::new(
        balancer.clone(),
        limiter.clone(),
        breaker.clone(),
        transports.clone(),
        stats.clone(),
        auth,
        RequestHandlerConfig {
            timeout: config.timeout,
            idle_timeout: config.idle_timeout,
            tcp_keepalive: config.tcp_keepalive,
        },
    ));

    // Shutdown plumbing and readiness flag
    let (shutdown_tx, _) = watch::channel(false);
    let ready = Arc::new(AtomicBool::new(false));

    // Background services
    let health_task = health.clone().map(|checker| {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { checker.run(shutdown).await })
    });

    let cleanup_task = {
        let balancer = balancer.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { balancer.run_cleanup(shutdown).await })
    };

    let ops_server = OpsServer::new(
        config.ops_addr(),
        OpsState {
            stats: stats.clone(),
            balancer: balancer.clone(),
            limiter: limiter.clone(),
            health: health.clone(),
            breaker: breaker.clone(),
            ready: ready.clone(),
            started_at: Instant::now(),
        },
    );
    let ops_task = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = ops_server.run(shutdown).await {
                error!(error = %e, "ops server error");
            }
        })
    };

    let proxy_server = ProxyServer::new(config.proxy_addr(), handler);
    let proxy_task = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = proxy_server.run(shutdown).await {
                error!(error = %e, "proxy server error");
                std::process::exit(1);
            }
        })
    };

    ready.store(true, Ordering::Relaxed);
    info!("egret started");

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("shutdown signal received");

    // Readiness flips first so load balancers stop routing here, then the
    // listener stops accepting, then in-flight connections drain.
    ready.store(false, Ordering::Relaxed);
    let _ = shutdown_tx.send(true);

    info!("waiting for active connections to complete");
    wait_for_drain(&limiter, DRAIN_TIMEOUT).await;

    transports.close_idle();

    let _ = proxy_task.await;
    let _ = ops_task.await;
    let _ = cleanup_task.await;
    if let Some(task) = health_task {
        let _ = task.await;
    }

    info!("egret stopped");
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "egret={},tower_http=warn",
            config.log_level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
