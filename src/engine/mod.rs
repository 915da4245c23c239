//! Agent engines
//!
//! Two long-lived workers share the hypervisor connection and a cancellation
//! token, and nothing else:
//!
//! ```text
//!                 ┌──────────────────────┐
//!  work queue ──► │   CreationEngine     │──define/start──┐
//!                 │  (admission control) │                │
//!                 └──────────────────────┘                ▼
//!                                                 Arc<dyn Hypervisor>
//!                 ┌──────────────────────┐                ▲
//!  instructions ─►│   OperateEngine      │──lifecycle─────┘
//!                 │  (mapping + dispatch)│
//!                 └──────────────────────┘
//! ```
//!
//! Each engine checks the token at the top of every iteration; an iteration
//! in flight always runs to completion or failure. Every iteration runs under
//! `guarded`, so an error or panic is logged, reported and the loop goes on.

pub mod admission;
pub mod create;
pub mod instruction;
pub mod mapping;
pub mod operate;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::diagnostics::{EmitLevel, Emitter};
use crate::error::AgentError;
use crate::hypervisor::Hypervisor;
use crate::metrics::ENGINE_ERRORS;
use crate::storage::VolumeStore;

pub use admission::{admission_delay, Admission, LoadProbe, SystemLoad};
pub use create::{CreationEngine, CycleOutcome, Step};
pub use instruction::{Action, InstructionMessage};
pub use mapping::GuestMapping;
pub use operate::{DispatchOutcome, OperateEngine};

/// Collaborators both engines use
#[derive(Clone)]
pub struct Shared {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub store: Arc<dyn VolumeStore>,
    pub emitter: Arc<dyn Emitter>,
}

/// Run one engine iteration, catching errors and panics
///
/// Returns `Err(message)` when the iteration failed; the message has already
/// been logged and emitted.
pub(crate) async fn guarded<F, T>(engine: &'static str, emitter: &dyn Emitter, iteration: F) -> Result<T, String>
where
    F: Future<Output = Result<T, AgentError>>,
{
    let message = match AssertUnwindSafe(iteration).catch_unwind().await {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
    };

    error!(engine = engine, error = %message, "engine iteration failed");
    ENGINE_ERRORS.with_label_values(&[engine]).inc();
    emitter.emit(EmitLevel::Error, &message).await;
    Err(message)
}

/// Best-effort text of a panic payload
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Running engines
pub struct AgentHandle {
    cancel: CancellationToken,
    workers: JoinSet<()>,
}

impl AgentHandle {
    /// Spawn both engines on the current runtime
    pub fn spawn(creation: CreationEngine, operate: OperateEngine, cancel: CancellationToken) -> Self {
        let mut workers = JoinSet::new();
        workers.spawn(creation.run(cancel.clone()));
        workers.spawn(operate.run(cancel.clone()));
        info!("engines started");
        Self { cancel, workers }
    }

    /// Wait until any engine exits on its own
    pub async fn wait_any(&mut self) {
        if let Some(Err(e)) = self.workers.join_next().await {
            error!(error = %e, "engine task ended abnormally");
        }
    }

    /// Signal shutdown and wait for both engines to finish their iteration
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "engine task ended abnormally");
            }
        }
        info!("engines stopped");
    }
}
