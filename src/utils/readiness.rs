//! Process readiness: a prober task and a gRPC health server task.
//!
//! The two tasks share only an `AtomicBool` and a shutdown `watch` channel.
//! The prober checks the platform on an interval and flips the flag; the
//! health task mirrors the flag as SERVING / NOT_SERVING.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tonic::transport::Server;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tracing::{info, warn};

use crate::platform::KubePlatform;

use super::bootstrap::wait_for_shutdown;

/// Dependency checked by the readiness prober.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self) -> Result<(), String>;
}

#[async_trait]
impl ReadinessProbe for KubePlatform {
    async fn check(&self) -> Result<(), String> {
        self.ping().await.map_err(|e| e.to_string())
    }
}

/// Run `probe` every `interval` until shutdown, storing the result in `ready`.
pub async fn run_readiness_prober(
    probe: Arc<dyn ReadinessProbe>,
    ready: Arc<AtomicBool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    info!(?interval, "Readiness prober started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let healthy = match probe.check().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "Readiness check failed");
                        false
                    }
                };
                let was = ready.swap(healthy, Ordering::SeqCst);
                if was != healthy {
                    info!(ready = healthy, "Readiness changed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Readiness prober stopped");
                    break;
                }
            }
        }
    }
}

fn serving_status(ready: bool) -> ServingStatus {
    if ready {
        ServingStatus::Serving
    } else {
        ServingStatus::NotServing
    }
}

/// Mirror `ready` into the health reporter until shutdown.
async fn reflect_readiness(
    mut reporter: HealthReporter,
    ready: Arc<AtomicBool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut last: Option<bool> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = ready.load(Ordering::SeqCst);
                if last != Some(current) {
                    reporter.set_service_status("", serving_status(current)).await;
                    last = Some(current);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    reporter.set_service_status("", ServingStatus::NotServing).await;
                    break;
                }
            }
        }
    }
}

/// Serve the standard gRPC health service on `addr` until shutdown.
///
/// The overall (`""`) service status follows `ready`, sampled every
/// `interval`.
pub async fn serve_health(
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<(), tonic::transport::Error> {
    let (reporter, health_service) = tonic_health::server::health_reporter();
    let reflector = tokio::spawn(reflect_readiness(
        reporter,
        ready,
        interval,
        shutdown.clone(),
    ));

    info!(address = %addr, "Health server listening");
    let result = Server::builder()
        .add_service(health_service)
        .serve_with_shutdown(addr, wait_for_shutdown(shutdown))
        .await;

    if let Err(e) = reflector.await {
        warn!(error = %e, "Readiness reflector task failed");
    }
    info!("Health server stopped");
    result
}
