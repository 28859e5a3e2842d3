mod adb;
mod archive;
mod cancel;
mod checker;
mod config;
mod devices;
mod error;
mod files;
mod gradle;
mod instrument;
mod proc;
mod workspace;


use std::sync::Arc;
use std::time::Duration;

use droidgrade_common::bus::{self, EventBus, RedisBus};
use droidgrade_common::locks::{LockProvider, RedisLockProvider};
use droidgrade_common::types::{CheckRequest, ResultEvent};
use tokio::signal;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::adb::AdbClient;
use crate::checker::AndroidChecker;
use crate::config::CheckerConfig;
use crate::error::CheckError;
use crate::files::HttpFileStore;

const QUEUE_POLL_SECONDS: f64 = 5.0;
const RETRY_PROMOTION_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Droidgrade checker booting...");

    let config = CheckerConfig::from_env()?;
    info!(
        checker = %config.checker_name,
        adb = %config.adb_path.display(),
        parallel_checks = config.max_parallel_checks,
        "Worker configured"
    );

    let client = redis::Client::open(config.redis_url.as_str())?;
    let conn = redis::aio::ConnectionManager::new(client).await?;
    info!("Connected to Redis: {}", config.redis_url);

    let bus: Arc<dyn EventBus> = Arc::new(RedisBus::new(conn.clone()));
    let locks: Arc<dyn LockProvider> = Arc::new(RedisLockProvider::new(conn.clone()));
    let control = Arc::new(AdbClient::new(config.adb_path.clone()));
    let files = Arc::new(HttpFileStore::new(&config.controller_url));
    let checker = Arc::new(AndroidChecker::new(
        control,
        files,
        locks,
        bus.clone(),
        config.android_sdk_root.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_err() {
            error!("failed to install CTRL+C signal handler");
            return;
        }
        warn!("Received shutdown signal, draining in-flight checks...");
        let _ = shutdown_tx.send(true);
    });

    tokio::spawn(retry_promoter(
        conn.clone(),
        config.checker_name.clone(),
        shutdown_rx.clone(),
    ));

    worker_loop(conn, checker, bus, config, shutdown_rx).await;

    info!("Worker shutdown complete");
    Ok(())
}

async fn worker_loop(
    mut conn: redis::aio::ConnectionManager,
    checker: Arc<AndroidChecker>,
    bus: Arc<dyn EventBus>,
    config: CheckerConfig,
    shutdown: watch::Receiver<bool>,
) {
    let limiter = Arc::new(Semaphore::new(config.max_parallel_checks));
    let mut checks = JoinSet::new();

    while !cancel::is_cancelled(&shutdown) {
        while let Some(finished) = checks.try_join_next() {
            if let Err(err) = finished {
                error!(error = %err, "check task aborted");
            }
        }

        match bus::pop_request(&mut conn, &config.checker_name, QUEUE_POLL_SECONDS).await {
            Ok(Some(request)) => {
                let permit = tokio::select! {
                    permit = limiter.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = cancel::cancelled(shutdown.clone()) => {
                        // Don't lose the request we already popped.
                        reschedule(&bus, &config.checker_name, &request, config.retry_delay).await;
                        break;
                    }
                };

                checks.spawn(process_submission(
                    checker.clone(),
                    bus.clone(),
                    config.checker_name.clone(),
                    config.retry_delay,
                    request,
                    shutdown.clone(),
                    permit,
                ));
            }
            Ok(None) => {
                // Poll timeout; loop back around to re-check shutdown.
                continue;
            }
            Err(err) => {
                error!(error = %err, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    while checks.join_next().await.is_some() {}
}

async fn process_submission(
    checker: Arc<AndroidChecker>,
    bus: Arc<dyn EventBus>,
    checker_name: String,
    retry_delay: Duration,
    request: CheckRequest,
    shutdown: watch::Receiver<bool>,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    let submission_id = request.submission_id;
    info!(submission_id = %submission_id, "Received check request");
    let started = std::time::Instant::now();

    match checker.check_submission(&request, shutdown).await {
        Ok(result) => {
            info!(
                submission_id = %submission_id,
                outcome = result.kind(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Check completed"
            );
            let event = ResultEvent::new(submission_id, result);
            if let Err(err) = bus.publish_result(&event).await {
                error!(
                    submission_id = %submission_id,
                    error = %err,
                    "Failed to publish result; rescheduling submission"
                );
                reschedule(&bus, &checker_name, &request, retry_delay).await;
            }
        }
        Err(err) => {
            match &err {
                CheckError::DeviceOffline => {
                    warn!(submission_id = %submission_id, "Device went offline mid-check; rescheduling")
                }
                CheckError::Cancelled => {
                    warn!(submission_id = %submission_id, "Check cancelled; rescheduling")
                }
                CheckError::Infra(err) => {
                    error!(submission_id = %submission_id, error = %err, "Check failed; rescheduling")
                }
            }
            reschedule(&bus, &checker_name, &request, retry_delay).await;
        }
    }
}

async fn reschedule(
    bus: &Arc<dyn EventBus>,
    checker_name: &str,
    request: &CheckRequest,
    delay: Duration,
) {
    if let Err(err) = bus.schedule_retry(checker_name, request, delay).await {
        error!(
            submission_id = %request.submission_id,
            error = %err,
            "failed to reschedule submission"
        );
    }
}

async fn retry_promoter(
    mut conn: redis::aio::ConnectionManager,
    checker_name: String,
    shutdown: watch::Receiver<bool>,
) {
    while !cancel::is_cancelled(&shutdown) {
        match bus::promote_due_retries(&mut conn, &checker_name).await {
            Ok(promoted) if promoted > 0 => debug!(promoted, "promoted delayed retries"),
            Ok(_) => {}
            Err(err) => error!(error = %err, "failed to promote delayed retries"),
        }

        tokio::select! {
            _ = tokio::time::sleep(RETRY_PROMOTION_INTERVAL) => {}
            _ = cancel::cancelled(shutdown.clone()) => break,
        }
    }
}
