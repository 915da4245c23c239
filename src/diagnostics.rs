//! Alert emission
//!
//! Besides logging, noteworthy events are reported to the cluster through an
//! `Emitter`. The Redis emitter publishes one JSON document per event on the
//! emit channel, where the orchestrator collects them:
//!
//! ```text
//! {"kind":"log","level":"warn","host":"node-07","message":"...","timestamp":1760600000}
//! ```
//!
//! Emission is best effort: a failed publish is logged and dropped.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmitLevel {
    Debug,
    Warn,
    Error,
}

impl fmt::Display for EmitLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EmitLevel::Debug => "debug",
            EmitLevel::Warn => "warn",
            EmitLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// Sink for cluster-visible diagnostics
#[async_trait]
pub trait Emitter: Send + Sync {
    async fn emit(&self, level: EmitLevel, message: &str);
}

/// Event published on the emit channel
#[derive(Debug, Serialize)]
struct EmitEvent<'a> {
    kind: &'static str,
    level: EmitLevel,
    host: &'a str,
    message: &'a str,
    timestamp: u64,
}

/// Emitter publishing events on a Redis pub/sub channel
#[derive(Clone)]
pub struct RedisEmitter {
    conn: ConnectionManager,
    channel: String,
    host: String,
}

impl RedisEmitter {
    pub fn new(conn: ConnectionManager, channel: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            conn,
            channel: channel.into(),
            host: host.into(),
        }
    }
}

#[async_trait]
impl Emitter for RedisEmitter {
    async fn emit(&self, level: EmitLevel, message: &str) {
        let event = EmitEvent {
            kind: "log",
            level,
            host: &self.host,
            message,
            timestamp: unix_timestamp(),
        };

        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode emit event");
                return;
            }
        };

        let mut conn = self.conn.clone();
        let published: redis::RedisResult<i64> = conn.publish(&self.channel, payload).await;
        if let Err(e) = published {
            warn!(channel = %self.channel, error = %e, "failed to publish emit event");
        }
    }
}

/// Emitter used when no emit channel is configured; events only reach the log
#[derive(Debug, Clone, Default)]
pub struct LogEmitter;

#[async_trait]
impl Emitter for LogEmitter {
    async fn emit(&self, _level: EmitLevel, _message: &str) {}
}

/// Name of this node, as reported in emitted events
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
