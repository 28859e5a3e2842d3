use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{CheckRequest, ResultEvent, StatusEvent};

/// Redis message-bus semantics shared by the scheduler and every checker
/// worker. Key names live here so producers and consumers never drift.

pub const REQUEST_QUEUE_PREFIX: &str = "droidgrade:requests";
pub const RETRY_QUEUE_PREFIX: &str = "droidgrade:retries";
pub const STATUS_EVENTS_KEY: &str = "droidgrade:statuses";
pub const RESULT_EVENTS_KEY: &str = "droidgrade:results";
pub const RESULT_PREFIX: &str = "droidgrade:result";

/// Per-submission result keys expire after 24 hours.
const RESULT_TTL_SECONDS: u64 = 86_400;
const RETRY_PROMOTION_BATCH: isize = 16;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message bus failure: {0}")]
    Transport(String),
    #[error("message codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Transport(err.to_string())
    }
}

/// Generate the deterministic request queue name for a checker system.
pub fn request_queue(checker: &str) -> String {
    format!("{REQUEST_QUEUE_PREFIX}:{checker}")
}

/// Generate the delayed-retry sorted-set name for a checker system.
pub fn retry_queue(checker: &str) -> String {
    format!("{RETRY_QUEUE_PREFIX}:{checker}")
}

/// Generate the per-submission result key.
pub fn result_key(submission_id: &Uuid) -> String {
    format!("{RESULT_PREFIX}:{submission_id}")
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Push a check request onto a checker's queue. Uses RPUSH for FIFO
/// semantics.
pub async fn push_request(
    conn: &mut redis::aio::ConnectionManager,
    checker: &str,
    request: &CheckRequest,
) -> Result<(), BusError> {
    let payload = serde_json::to_string(request)?;
    let _: () = conn.rpush(request_queue(checker), payload).await?;
    Ok(())
}

/// Pop a check request from a checker's queue. Uses BLPOP with a timeout so
/// the worker loop can poll its shutdown signal.
pub async fn pop_request(
    conn: &mut redis::aio::ConnectionManager,
    checker: &str,
    timeout_seconds: f64,
) -> Result<Option<CheckRequest>, BusError> {
    let queue = request_queue(checker);
    let reply: Option<(String, String)> = conn.blpop(&queue, timeout_seconds).await?;

    match reply {
        Some((_key, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
        None => Ok(None),
    }
}

/// Move due entries from the retry sorted set back onto the request queue.
///
/// ZREM decides ownership: when several workers promote concurrently, only
/// the one that actually removed the member re-enqueues it, so a retry is
/// delivered once.
pub async fn promote_due_retries(
    conn: &mut redis::aio::ConnectionManager,
    checker: &str,
) -> Result<usize, BusError> {
    let retry_key = retry_queue(checker);
    let queue = request_queue(checker);
    let now = epoch_millis();

    let due: Vec<String> = conn
        .zrangebyscore_limit(&retry_key, 0f64, now as f64, 0, RETRY_PROMOTION_BATCH)
        .await?;

    let mut promoted = 0;
    for payload in due {
        let removed: i32 = conn.zrem(&retry_key, &payload).await?;
        if removed == 0 {
            continue;
        }
        let _: () = conn.rpush(&queue, &payload).await?;
        promoted += 1;
    }
    Ok(promoted)
}

/// Outbound publication surface of the checker: versioned status events,
/// one-shot results, and delayed redelivery of failed requests.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish_status(&self, event: &StatusEvent) -> Result<(), BusError>;
    async fn publish_result(&self, event: &ResultEvent) -> Result<(), BusError>;
    async fn schedule_retry(
        &self,
        checker: &str,
        request: &CheckRequest,
        delay: Duration,
    ) -> Result<(), BusError>;
}

#[derive(Clone)]
pub struct RedisBus {
    conn: redis::aio::ConnectionManager,
}

impl RedisBus {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish_status(&self, event: &StatusEvent) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(event)?;
        let _: () = conn.rpush(STATUS_EVENTS_KEY, payload).await?;
        Ok(())
    }

    async fn publish_result(&self, event: &ResultEvent) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(event)?;

        // Redelivered attempts overwrite instead of duplicating: last write
        // wins under the per-submission key.
        let _: () = conn
            .set_ex(result_key(&event.submission_id), &payload, RESULT_TTL_SECONDS)
            .await?;
        let _: () = conn.rpush(RESULT_EVENTS_KEY, &payload).await?;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        checker: &str,
        request: &CheckRequest,
        delay: Duration,
    ) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(request)?;
        let due = epoch_millis() + delay.as_millis() as u64;
        let _: () = conn.zadd(retry_queue(checker), payload, due as f64).await?;
        Ok(())
    }
}
