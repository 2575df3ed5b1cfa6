//! Redis-backed broker.
//!
//! # Key layout
//!
//! - `{prefix}:queue:{queue}`: list of pending envelopes (LPUSH by the
//!   dispatcher, popped from the right by workers)
//! - `{prefix}:result:{id}`: list holding the single result record a worker
//!   pushes for attempt `id`
//! - `{prefix}:workers:{queue}`: set of worker ids subscribed to `queue`
//!
//! # Worker contract
//!
//! A worker pops an [`Envelope`], base64-decodes `body` (a JSON task
//! message), runs it, and pushes a JSON [`ResultRecord`] onto the result key.
//! `retryable` defaults to `true` when omitted.
//!
//! Results are polled with non-blocking `LPOP` at a fixed interval rather than
//! `BLPOP`, because a blocking pop would stall every other command sharing the
//! multiplexed connection.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::BrokerError;

use super::{Broker, ErrorInfo, PollResponse, ScaleQuery};

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "task_dispatch";

/// Default interval between result checks.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Message wrapper pushed onto a queue list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub queue: String,
    /// Base64 of the task message bytes.
    pub body: String,
    pub enqueued_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(id: impl Into<String>, queue: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            body: BASE64.encode(payload),
            enqueued_at: Utc::now(),
        }
    }

    /// Decodes the task message bytes.
    pub fn payload(&self) -> Result<Vec<u8>, BrokerError> {
        Ok(BASE64.decode(&self.body)?)
    }
}

/// Terminal status written by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// Result record a worker pushes for an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub status: ResultStatus,
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Base64 of the encoded task result, on success.
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

impl ResultRecord {
    pub fn success(worker_id: impl Into<String>, result: &[u8]) -> Self {
        Self {
            status: ResultStatus::Success,
            worker_id: Some(worker_id.into()),
            body: Some(BASE64.encode(result)),
            error: None,
            retryable: true,
        }
    }

    pub fn failure(worker_id: impl Into<String>, info: &ErrorInfo) -> Self {
        Self {
            status: ResultStatus::Failure,
            worker_id: Some(worker_id.into()),
            body: None,
            error: Some(info.message.clone()),
            retryable: info.retryable,
        }
    }

    /// Converts the record into the broker-neutral poll response.
    pub fn into_poll_response(self) -> Result<PollResponse, BrokerError> {
        match self.status {
            ResultStatus::Success => {
                let body = self.body.unwrap_or_default();
                Ok(PollResponse::Completed(BASE64.decode(body)?))
            }
            ResultStatus::Failure => Ok(PollResponse::Failed(ErrorInfo {
                message: self
                    .error
                    .unwrap_or_else(|| "worker reported failure".to_string()),
                retryable: self.retryable,
                worker_id: self.worker_id,
            })),
        }
    }
}

/// Broker backed by Redis lists.
pub struct RedisBroker {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    key_prefix: String,
    poll_interval: Duration,
}

impl RedisBroker {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Unavailable` if the connection fails.
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        Ok(Self::from_connection(redis, key_prefix))
    }

    /// Creates a broker from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            redis,
            key_prefix: key_prefix.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.key_prefix, queue)
    }

    pub fn result_key(&self, id: &str) -> String {
        format!("{}:result:{}", self.key_prefix, id)
    }

    pub fn workers_key(&self, queue: &str) -> String {
        format!("{}:workers:{}", self.key_prefix, queue)
    }

    async fn try_take_result(&self, key: &str) -> Result<Option<PollResponse>, BrokerError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = redis::cmd("LPOP").arg(key).query_async(&mut conn).await?;

        match data {
            Some(raw) => {
                let record: ResultRecord = serde_json::from_str(&raw)?;
                Ok(Some(record.into_poll_response()?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn submit(&self, queue: &str, payload: Vec<u8>) -> Result<String, BrokerError> {
        let id = Uuid::new_v4().to_string();
        let envelope = Envelope::new(&id, queue, &payload);
        let serialized = serde_json::to_string(&envelope)?;

        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.queue_key(queue), serialized)
            .await?;

        debug!(task_id = %id, queue = queue, "Envelope pushed");
        Ok(id)
    }

    async fn poll(&self, id: &str, timeout: Duration) -> Result<PollResponse, BrokerError> {
        let key = self.result_key(id);
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(response) = self.try_take_result(&key).await? {
                return Ok(response);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(PollResponse::Pending);
            }
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

#[async_trait]
impl ScaleQuery for RedisBroker {
    async fn current_worker_count(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let count: usize = conn.scard(self.workers_key(queue)).await?;
        Ok(count)
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.queue_key(queue)).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_payload_survives_encoding() {
        let envelope = Envelope::new("id-1", "queue_a", b"{\"attempt\":0}");

        assert_eq!(envelope.queue, "queue_a");
        assert_eq!(envelope.payload().unwrap(), b"{\"attempt\":0}".to_vec());
    }

    #[test]
    fn test_success_record_to_poll_response() {
        let record = ResultRecord::success("worker-a", b"{\"message\":\"hi\"}");

        let response = record.into_poll_response().unwrap();
        assert_eq!(
            response,
            PollResponse::Completed(b"{\"message\":\"hi\"}".to_vec())
        );
    }

    #[test]
    fn test_failure_record_defaults_to_retryable() {
        let raw = r#"{"status": "failure", "worker_id": "worker-b", "error": "boom"}"#;
        let record: ResultRecord = serde_json::from_str(raw).unwrap();

        match record.into_poll_response().unwrap() {
            PollResponse::Failed(info) => {
                assert!(info.retryable);
                assert_eq!(info.message, "boom");
                assert_eq!(info.worker_id.as_deref(), Some("worker-b"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_permanent_failure_record() {
        let record = ResultRecord::failure("worker-b", &ErrorInfo::permanent("bad input"));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["status"], "failure");
        assert_eq!(json["retryable"], false);
    }

    #[test]
    fn test_invalid_base64_body_is_an_error() {
        let record = ResultRecord {
            status: ResultStatus::Success,
            worker_id: None,
            body: Some("%%%".to_string()),
            error: None,
            retryable: true,
        };
        assert!(matches!(
            record.into_poll_response(),
            Err(BrokerError::Encoding(_))
        ));
    }
}
