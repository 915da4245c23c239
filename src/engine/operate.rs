//! Operate Engine - lifecycle instruction dispatch
//!
//! Each iteration waits briefly for one instruction, refreshes the guest
//! mapping from the hypervisor and applies the action to the named guest.
//! Instructions for guests this node does not host are expected (the
//! orchestrator's view may be stale) and are dropped quietly.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use super::instruction::{Action, InstructionMessage};
use super::mapping::GuestMapping;
use super::{guarded, Shared};
use crate::diagnostics::EmitLevel;
use crate::error::{HypervisorError, Result};
use crate::hypervisor::{descriptor, Domain};
use crate::metrics::{INSTRUCTIONS, LIVE_WORKERS};
use crate::queue::InstructionSource;

/// What one operate iteration did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No message within the poll timeout
    Idle,
    /// Payload was not a JSON object
    Malformed,
    /// `action` or `uuid` missing
    Incomplete,
    /// No such guest on this node
    UnknownGuest(String),
    /// Action applied to the guest
    Dispatched(Action),
    /// Recognised action with no implementation on this node
    NoOp(Action),
    Unsupported(String),
    /// Error or panic caught by the iteration handler
    Failed(String),
}

/// Worker consuming the instruction channel
pub struct OperateEngine {
    shared: Shared,
    source: Box<dyn InstructionSource>,
    mapping: GuestMapping,
    poll_timeout: Duration,
    hostname: String,
    debug: bool,
}

impl OperateEngine {
    pub fn new(
        shared: Shared,
        source: Box<dyn InstructionSource>,
        poll_timeout: Duration,
        hostname: impl Into<String>,
        debug: bool,
    ) -> Self {
        Self {
            shared,
            source,
            mapping: GuestMapping::new(),
            poll_timeout,
            hostname: hostname.into(),
            debug,
        }
    }

    /// Poll instructions until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        LIVE_WORKERS.inc();
        info!(host = %self.hostname, "operate engine started");

        while !cancel.is_cancelled() {
            if let DispatchOutcome::Failed(_) = self.poll_once().await {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.poll_timeout) => {}
                }
            }
        }

        LIVE_WORKERS.dec();
        info!("operate engine stopped");
    }

    /// Handle at most one instruction under the iteration handler
    pub async fn poll_once(&mut self) -> DispatchOutcome {
        let emitter = self.shared.emitter.clone();
        guarded("operate", emitter.as_ref(), self.poll())
            .await
            .unwrap_or_else(DispatchOutcome::Failed)
    }

    async fn poll(&mut self) -> Result<DispatchOutcome> {
        let Some(payload) = self.source.next_message(self.poll_timeout).await? else {
            return Ok(DispatchOutcome::Idle);
        };
        trace!("operate engine alive");

        let msg = match InstructionMessage::decode(&payload) {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(DispatchOutcome::Incomplete),
            Err(e) => {
                let log = format!("discarding undecodable instruction: {}", e);
                error!("{}", log);
                self.shared.emitter.emit(EmitLevel::Error, &log).await;
                return Ok(DispatchOutcome::Malformed);
            }
        };

        self.mapping.refresh(self.shared.hypervisor.as_ref()).await?;

        let Some(domain) = self.mapping.get(&msg.guest_id).cloned() else {
            let log = format!("uuid {} not found on host {}", msg.guest_id, self.hostname);
            debug!(action = %msg.action, "{}", log);
            if self.debug {
                self.shared.emitter.emit(EmitLevel::Debug, &log).await;
            }
            INSTRUCTIONS
                .with_label_values(&[msg.action.label(), "unknown_guest"])
                .inc();
            return Ok(DispatchOutcome::UnknownGuest(msg.guest_id));
        };

        let span = info_span!(
            "operate_guest",
            guest_id = %msg.guest_id,
            action = %msg.action,
            trace_id = %Uuid::now_v7(),
            otel.name = "operate_guest"
        );
        let outcome = dispatch(&self.shared, &msg.action, &domain).instrument(span).await;
        if outcome.is_err() {
            INSTRUCTIONS.with_label_values(&[msg.action.label(), "failed"]).inc();
        }
        outcome
    }
}

async fn dispatch(shared: &Shared, action: &Action, domain: &Domain) -> Result<DispatchOutcome> {
    let hv = shared.hypervisor.as_ref();

    match action {
        Action::Reboot => hv.reboot(domain).await?,
        Action::ForceReboot => {
            hv.destroy(domain).await?;
            hv.create(domain).await?;
        }
        Action::Shutdown => hv.shutdown(domain).await?,
        Action::ForceShutdown => hv.destroy(domain).await?,
        Action::Boot => hv.create(domain).await?,
        Action::Suspend => hv.suspend(domain).await?,
        Action::Resume => hv.resume(domain).await?,
        Action::Delete => delete(shared, domain).await?,
        Action::DiskResize | Action::AttachDisk | Action::DetachDisk | Action::Migrate => {
            debug!("action not implemented on this node");
            INSTRUCTIONS.with_label_values(&[action.label(), "noop"]).inc();
            return Ok(DispatchOutcome::NoOp(action.clone()));
        }
        Action::Unsupported(name) => {
            let log = format!("unsupported action: {}", name);
            error!("{}", log);
            shared.emitter.emit(EmitLevel::Error, &log).await;
            INSTRUCTIONS.with_label_values(&[action.label(), "noop"]).inc();
            return Ok(DispatchOutcome::Unsupported(name.clone()));
        }
    }

    info!("instruction applied");
    INSTRUCTIONS.with_label_values(&[action.label(), "dispatched"]).inc();
    Ok(DispatchOutcome::Dispatched(action.clone()))
}

/// Destroy and undefine the domain, then reclaim its storage
///
/// The storage location comes from the domain's own descriptor, which is
/// read before undefine makes it unavailable.
async fn delete(shared: &Shared, domain: &Domain) -> Result<()> {
    let hv = shared.hypervisor.as_ref();
    let xml = hv.xml_desc(domain).await?;

    match hv.destroy(domain).await {
        Ok(()) => {}
        Err(HypervisorError::NotRunning(_)) => debug!("domain already stopped"),
        Err(e) => return Err(e.into()),
    }
    hv.undefine(domain).await?;

    let storage = descriptor::storage_path(&xml)?;
    let store = shared.store.as_ref();
    if store.exists(&storage.volume, &storage.path).await? {
        store.remove_all(&storage.volume, &storage.path).await?;
        info!(volume = %storage.volume, path = %storage.path, "guest storage removed");
    } else {
        warn!(volume = %storage.volume, path = %storage.path, "guest storage already gone");
    }
    Ok(())
}
