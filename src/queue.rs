//! Work queue and instruction channel
//!
//! The orchestrator talks to the agent through Redis:
//!
//! ```text
//! orchestrator ──LPUSH──► vm_create_queue ──RPOP──► Creation Engine
//! orchestrator ──PUBLISH─► instruction_channel ──► Operate Engine
//! ```
//!
//! Both carry JSON payloads which the engines decode themselves; this module
//! only moves strings.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::error::QueueError;

/// Source of creation job payloads
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Pop one payload without blocking; `None` if the queue is empty
    async fn pop(&self) -> Result<Option<String>, QueueError>;
}

/// Source of instruction payloads
#[async_trait]
pub trait InstructionSource: Send {
    /// Wait up to `timeout` for the next payload; `None` on timeout
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<String>, QueueError>;
}

/// Work queue backed by a Redis list
#[derive(Clone)]
pub struct RedisWorkQueue {
    conn: ConnectionManager,
    key: String,
}

impl RedisWorkQueue {
    pub fn new(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self { conn, key: key.into() }
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn pop(&self) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.rpop(&self.key, None).await?;
        Ok(payload)
    }
}

/// Opens a fresh message stream on the instruction channel
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self) -> Result<BoxStream<'static, String>, QueueError>;
}

/// Pub/sub subscription on one Redis channel
pub struct RedisChannel {
    client: redis::Client,
    channel: String,
}

impl RedisChannel {
    pub fn new(client: redis::Client, channel: impl Into<String>) -> Self {
        Self {
            client,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl Subscriber for RedisChannel {
    async fn subscribe(&self) -> Result<BoxStream<'static, String>, QueueError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        info!(channel = %self.channel, "subscribed to instruction channel");

        Ok(pubsub
            .into_on_message()
            .map(|msg| String::from_utf8_lossy(msg.get_payload_bytes()).into_owned())
            .boxed())
    }
}

/// Instruction source that subscribes again after its stream ends
///
/// A closed stream is reported once as `QueueError::Closed`; the following
/// call opens a new subscription. Messages published while no subscription
/// is open are lost.
pub struct ResubscribingSource<S> {
    subscriber: S,
    messages: Option<BoxStream<'static, String>>,
}

impl<S: Subscriber> ResubscribingSource<S> {
    /// Subscribe once; failure here is fatal to agent startup
    pub async fn connect(subscriber: S) -> Result<Self, QueueError> {
        let messages = subscriber.subscribe().await?;
        Ok(Self {
            subscriber,
            messages: Some(messages),
        })
    }
}

/// Instruction source backed by a Redis pub/sub subscription
pub type RedisInstructionSource = ResubscribingSource<RedisChannel>;

impl RedisInstructionSource {
    pub async fn subscribe(client: &redis::Client, channel: &str) -> Result<Self, QueueError> {
        Self::connect(RedisChannel::new(client.clone(), channel)).await
    }
}

#[async_trait]
impl<S: Subscriber> InstructionSource for ResubscribingSource<S> {
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut messages = match self.messages.take() {
            Some(messages) => messages,
            None => {
                info!("resubscribing to instruction channel");
                self.subscriber.subscribe().await?
            }
        };

        match tokio::time::timeout(timeout, messages.next()).await {
            Err(_elapsed) => {
                self.messages = Some(messages);
                Ok(None)
            }
            Ok(Some(payload)) => {
                self.messages = Some(messages);
                Ok(Some(payload))
            }
            Ok(None) => {
                warn!("instruction subscription closed");
                Err(QueueError::Closed)
            }
        }
    }
}
