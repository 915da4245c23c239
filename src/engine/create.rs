//! Creation Engine - admission-controlled guest provisioning
//!
//! Each cycle:
//!
//! ```text
//! cleanup dirty scene ─► read load ─► sleep load*10+1 ─► load > threshold? ─► skip
//!                                                              │ no
//!                                                              ▼
//!   pop job ─► decode ─► guest dir (scene dirty) ─► system image ─► config
//!         ─► data disks ─► define (scene clean) ─► start
//! ```
//!
//! A failed step ends the cycle. Anything created before the domain is
//! defined is reclaimed by the next cycle's cleanup. A domain that was
//! defined but fails to start is left for an operator.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, trace, warn, Instrument};

use super::admission::{Admission, LoadProbe};
use super::{guarded, Shared};
use crate::diagnostics::EmitLevel;
use crate::error::{AgentError, Result};
use crate::guest::{CreationJob, GuestContext, GuestProvisioner, SceneState};
use crate::metrics::{ADMISSION_SKIPPED, CREATE_DURATION, CREATE_JOBS, LIVE_WORKERS, LOAD_AVERAGE};
use crate::queue::WorkQueue;

/// Provisioning step that can abort a creation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    SystemImage,
    DiskImage,
    Define,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::SystemImage => "system image",
            Step::DiskImage => "disk image",
            Step::Define => "domain definition",
        };
        f.write_str(s)
    }
}

/// What one creation cycle did
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Shutdown was signalled during the admission delay
    Cancelled,
    /// Load above threshold, nothing dequeued
    Saturated { load: f64 },
    /// Queue empty
    Idle,
    /// Payload could not be decoded and was discarded
    Dropped,
    Completed { guest_id: String },
    /// A step failed before the domain was started
    Aborted { guest_id: String, step: Step },
    /// Domain defined but not started
    StartFailed { guest_id: String },
    /// Error or panic caught by the iteration handler
    Failed(String),
}

/// Worker consuming the creation queue
pub struct CreationEngine {
    shared: Shared,
    provisioner: Arc<dyn GuestProvisioner>,
    queue: Arc<dyn WorkQueue>,
    load: Arc<dyn LoadProbe>,
    admission: Admission,
    instances_dir: String,
    scene: SceneState,
}

impl CreationEngine {
    pub fn new(
        shared: Shared,
        provisioner: Arc<dyn GuestProvisioner>,
        queue: Arc<dyn WorkQueue>,
        load: Arc<dyn LoadProbe>,
        admission: Admission,
        instances_dir: impl Into<String>,
    ) -> Self {
        Self {
            shared,
            provisioner,
            queue,
            load,
            admission,
            instances_dir: instances_dir.into(),
            scene: SceneState::new(),
        }
    }

    pub fn scene(&self) -> &SceneState {
        &self.scene
    }

    /// Run cycles until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        LIVE_WORKERS.inc();
        info!(
            threshold = self.admission.threshold,
            time_unit_ms = self.admission.time_unit.as_millis() as u64,
            "creation engine started"
        );

        while !cancel.is_cancelled() {
            if let CycleOutcome::Failed(_) = self.run_cycle(&cancel).await {
                // failures may precede the admission delay; keep the loop from spinning
                pause(self.admission.time_unit, &cancel).await;
            }
        }

        LIVE_WORKERS.dec();
        info!("creation engine stopped");
    }

    /// Run one cycle under the iteration handler
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleOutcome {
        let emitter = self.shared.emitter.clone();
        match guarded("create", emitter.as_ref(), self.cycle(cancel)).await {
            Ok(outcome) => outcome,
            Err(message) => {
                CREATE_JOBS.with_label_values(&["failed"]).inc();
                CycleOutcome::Failed(message)
            }
        }
    }

    async fn cycle(&mut self, cancel: &CancellationToken) -> Result<CycleOutcome> {
        self.scene
            .cleanup(self.shared.store.as_ref(), self.shared.emitter.as_ref())
            .await;

        let load = self.load.five_minute().map_err(AgentError::Load)?;
        LOAD_AVERAGE.set(load);

        if !pause(self.admission.delay(load), cancel).await {
            return Ok(CycleOutcome::Cancelled);
        }
        trace!(load_avg = load, "creation engine alive");

        if !self.admission.admits(load) {
            ADMISSION_SKIPPED.inc();
            return Ok(CycleOutcome::Saturated { load });
        }

        let Some(payload) = self.queue.pop().await? else {
            return Ok(CycleOutcome::Idle);
        };

        let job = match CreationJob::decode(&payload) {
            Ok(job) => job,
            Err(e) => {
                let msg = format!("discarding undecodable creation job: {}", e);
                error!("{}", msg);
                self.shared.emitter.emit(EmitLevel::Error, &msg).await;
                CREATE_JOBS.with_label_values(&["dropped"]).inc();
                return Ok(CycleOutcome::Dropped);
            }
        };

        let guest = GuestContext::new(job, &self.instances_dir);
        let span = info_span!(
            "create_guest",
            guest_id = %guest.guest_id(),
            trace_id = %guest.trace_id,
            otel.name = "create_guest"
        );
        self.provision(&guest).instrument(span).await
    }

    async fn provision(&mut self, guest: &GuestContext) -> Result<CycleOutcome> {
        let started = Instant::now();
        info!(name = %guest.job.name, volume = %guest.volume(), "creating guest");

        self.provisioner.generate_guest_dir(guest).await?;
        self.scene.mark_dirty(guest);

        if let Err(e) = self.provisioner.generate_system_image(guest).await {
            return Ok(self.abort(guest, Step::SystemImage, e.into()).await);
        }

        // a rendering failure is left to the iteration handler
        self.provisioner.init_config(guest).await?;

        if let Err(e) = self.provisioner.generate_disk_image(guest).await {
            return Ok(self.abort(guest, Step::DiskImage, e.into()).await);
        }

        let domain = match self.shared.hypervisor.define_xml(&guest.job.domain_xml).await {
            Ok(domain) => domain,
            Err(e) => return Ok(self.abort(guest, Step::Define, e.into()).await),
        };
        self.scene.mark_clean();
        info!(domain = %domain, "domain defined");

        if let Err(e) = self.shared.hypervisor.create(&domain).await {
            let msg = format!("guest {} defined but failed to start: {}", guest.guest_id(), e);
            error!("{}", msg);
            self.shared.emitter.emit(EmitLevel::Error, &msg).await;
            CREATE_JOBS.with_label_values(&["start_failed"]).inc();
            return Ok(CycleOutcome::StartFailed {
                guest_id: guest.guest_id().to_string(),
            });
        }

        let elapsed = started.elapsed();
        CREATE_DURATION.observe(elapsed.as_secs_f64());
        CREATE_JOBS.with_label_values(&["completed"]).inc();
        info!(elapsed_ms = elapsed.as_millis() as u64, "guest started");

        Ok(CycleOutcome::Completed {
            guest_id: guest.guest_id().to_string(),
        })
    }

    async fn abort(&self, guest: &GuestContext, step: Step, e: AgentError) -> CycleOutcome {
        let msg = format!("guest {} creation aborted at {}: {}", guest.guest_id(), step, e);
        warn!(step = %step, "{}", msg);
        self.shared.emitter.emit(EmitLevel::Error, &msg).await;
        CREATE_JOBS.with_label_values(&["aborted"]).inc();
        CycleOutcome::Aborted {
            guest_id: guest.guest_id().to_string(),
            step,
        }
    }
}

/// Sleep for `duration` unless cancelled first; false when cancelled
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        job_payload, FixedLoad, MemoryQueue, MemoryVolumeStore, MockHypervisor, ProvisionStep,
        RecordingEmitter, ScriptedProvisioner,
    };

    struct Harness {
        engine: CreationEngine,
        hv: Arc<MockHypervisor>,
        store: Arc<MemoryVolumeStore>,
        queue: Arc<MemoryQueue>,
        provisioner: Arc<ScriptedProvisioner>,
        emitter: Arc<RecordingEmitter>,
    }

    fn harness(load: f64) -> Harness {
        let hv = Arc::new(MockHypervisor::default());
        let store = Arc::new(MemoryVolumeStore::default());
        let queue = Arc::new(MemoryQueue::default());
        let provisioner = Arc::new(ScriptedProvisioner::new(store.clone()));
        let emitter = Arc::new(RecordingEmitter::default());

        let shared = Shared {
            hypervisor: hv.clone(),
            store: store.clone(),
            emitter: emitter.clone(),
        };
        let engine = CreationEngine::new(
            shared,
            provisioner.clone(),
            queue.clone(),
            Arc::new(FixedLoad(load)),
            Admission::new(0.6, Duration::from_secs(1)),
            "instances",
        );

        Harness {
            engine,
            hv,
            store,
            queue,
            provisioner,
            emitter,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_creation() {
        let mut h = harness(0.2);
        h.queue.push(job_payload("g1"));
        assert!(!h.engine.scene().is_dirty());

        let started = tokio::time::Instant::now();
        let outcome = h.engine.run_cycle(&CancellationToken::new()).await;

        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(outcome, CycleOutcome::Completed { guest_id: "g1".to_string() });
        assert_eq!(h.hv.calls(), vec!["define g1", "create g1"]);
        assert!(!h.engine.scene().is_dirty());
        assert!(h.store.contains("gv0", "instances/g1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_node_skips_dequeue() {
        let mut h = harness(1.5);
        h.queue.push(job_payload("g1"));

        let started = tokio::time::Instant::now();
        let outcome = h.engine.run_cycle(&CancellationToken::new()).await;

        assert_eq!(outcome, CycleOutcome::Saturated { load: 1.5 });
        assert_eq!(started.elapsed(), Duration::from_secs(16));
        assert_eq!(h.queue.len(), 1);
        assert!(h.hv.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_just_above_threshold_is_refused() {
        let mut h = harness(0.61);
        h.queue.push(job_payload("g1"));

        let outcome = h.engine.run_cycle(&CancellationToken::new()).await;
        assert!(matches!(outcome, CycleOutcome::Saturated { .. }));
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_load_is_admitted() {
        let mut h = harness(0.6);
        h.queue.push(job_payload("g1"));

        let outcome = h.engine.run_cycle(&CancellationToken::new()).await;
        assert!(matches!(outcome, CycleOutcome::Completed { .. }));
        assert_eq!(h.queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_load_still_sleeps_one_unit() {
        let mut h = harness(0.0);

        let started = tokio::time::Instant::now();
        let outcome = h.engine.run_cycle(&CancellationToken::new()).await;

        assert_eq!(outcome, CycleOutcome::Idle);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_job_has_no_side_effects() {
        let mut h = harness(0.1);
        h.queue.push("{\"uuid\": \"g1\"".to_string());

        let outcome = h.engine.run_cycle(&CancellationToken::new()).await;

        assert_eq!(outcome, CycleOutcome::Dropped);
        assert!(h.hv.calls().is_empty());
        assert!(h.provisioner.calls().is_empty());
        assert_eq!(h.store.removals(), 0);
        assert!(!h.engine.scene().is_dirty());
        assert_eq!(h.emitter.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_system_image_is_reclaimed_next_cycle() {
        let mut h = harness(0.1);
        h.provisioner.fail_at(ProvisionStep::SystemImage);
        h.queue.push(job_payload("g1"));
        h.queue.push(job_payload("g2"));

        let outcome = h.engine.run_cycle(&CancellationToken::new()).await;
        assert_eq!(
            outcome,
            CycleOutcome::Aborted {
                guest_id: "g1".to_string(),
                step: Step::SystemImage
            }
        );
        assert!(h.engine.scene().is_dirty());
        assert!(h.store.contains("gv0", "instances/g1"));
        assert!(h.hv.calls().is_empty());

        // next cycle removes g1's directory before dequeuing g2
        h.queue.watch(h.store.clone(), "gv0", "instances/g1");
        h.provisioner.fail_at(ProvisionStep::GuestDir);
        let outcome = h.engine.run_cycle(&CancellationToken::new()).await;
        assert!(matches!(outcome, CycleOutcome::Failed(_)));
        assert_eq!(h.queue.seen_at_pop(), vec![false]);
        assert!(!h.store.contains("gv0", "instances/g1"));
        assert_eq!(h.store.removals(), 1);
        assert_eq!(h.queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_define_leaves_scene_dirty() {
        let mut h = harness(0.1);
        h.hv.fail("define");
        h.queue.push(job_payload("g1"));

        let outcome = h.engine.run_cycle(&CancellationToken::new()).await;

        assert!(matches!(outcome, CycleOutcome::Aborted { step: Step::Define, .. }));
        assert!(h.engine.scene().is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_disk_image_aborts_before_define() {
        let mut h = harness(0.1);
        h.provisioner.fail_at(ProvisionStep::DiskImage);
        h.queue.push(job_payload("g1"));

        let outcome = h.engine.run_cycle(&CancellationToken::new()).await;

        assert!(matches!(outcome, CycleOutcome::Aborted { step: Step::DiskImage, .. }));
        assert!(h.hv.calls().is_empty());
        assert!(h.engine.scene().is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_failure_reaches_iteration_handler() {
        let mut h = harness(0.1);
        h.provisioner.fail_at(ProvisionStep::Config);
        h.queue.push(job_payload("g1"));

        let outcome = h.engine.run_cycle(&CancellationToken::new()).await;

        assert!(matches!(outcome, CycleOutcome::Failed(_)));
        assert!(h.engine.scene().is_dirty());
        assert!(h.hv.calls().is_empty());
        assert_eq!(h.emitter.events()[0].0, EmitLevel::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_keeps_defined_domain() {
        let mut h = harness(0.1);
        h.hv.fail("create");
        h.queue.push(job_payload("g1"));

        let outcome = h.engine.run_cycle(&CancellationToken::new()).await;
        assert_eq!(outcome, CycleOutcome::StartFailed { guest_id: "g1".to_string() });
        assert!(!h.engine.scene().is_dirty());

        // nothing is reclaimed on the following cycle
        h.engine.run_cycle(&CancellationToken::new()).await;
        assert_eq!(h.store.removals(), 0);
        assert!(h.hv.calls().iter().all(|c| !c.starts_with("destroy") && !c.starts_with("undefine")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_admission_delay() {
        let mut h = harness(0.1);
        h.queue.push(job_payload("g1"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.engine.run_cycle(&cancel).await;
        assert_eq!(outcome, CycleOutcome::Cancelled);
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_on_cancel() {
        let h = harness(0.1);
        let queue = h.queue.clone();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.engine.run(cancel.clone()));

        queue.push(job_payload("g1"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(queue.len(), 0);
        assert_eq!(h.hv.calls(), vec!["define g1", "create g1"]);
    }
}
