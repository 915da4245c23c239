//! In-memory collaborators for engine tests

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;

use crate::diagnostics::{EmitLevel, Emitter};
use crate::engine::LoadProbe;
use crate::error::{HypervisorError, ProvisionError, QueueError, StorageError};
use crate::guest::{CreationJob, GuestContext, GuestProvisioner};
use crate::hypervisor::{descriptor, Domain, Hypervisor};
use crate::queue::{InstructionSource, Subscriber, WorkQueue};
use crate::storage::VolumeStore;

/// Minimal descriptor whose first disk lives on a gluster volume
pub fn domain_xml(uuid: &str, source_name: &str) -> String {
    format!(
        "<domain type='kvm'><name>{uuid}</name><uuid>{uuid}</uuid><devices>\
         <disk type='network' device='disk'><source protocol='gluster' name='{source_name}'/></disk>\
         </devices></domain>"
    )
}

/// Queue payload for a guest on volume `gv0` with one data disk
pub fn job_payload(guest_id: &str) -> String {
    serde_json::json!({
        "uuid": guest_id,
        "name": format!("vm-{}", guest_id),
        "glusterfs_volume": "gv0",
        "template_path": "templates/base.qcow2",
        "guest_disks": [
            {"label": "disk0", "size_gb": 20},
            {"label": "disk1", "size_gb": 50}
        ],
        "writes": {"hostname": guest_id},
        "xml": domain_xml(guest_id, &format!("gv0/instances/{}/disk0.qcow2", guest_id)),
    })
    .to_string()
}

pub fn context(guest_id: &str) -> GuestContext {
    let job = CreationJob::decode(&job_payload(guest_id)).unwrap();
    GuestContext::new(job, "instances")
}

pub struct FixedLoad(pub f64);

impl LoadProbe for FixedLoad {
    fn five_minute(&self) -> io::Result<f64> {
        Ok(self.0)
    }
}

#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<String>>,
    watch: Mutex<Option<(Arc<MemoryVolumeStore>, String, String)>>,
    seen: Mutex<Vec<bool>>,
}

impl MemoryQueue {
    pub fn push(&self, payload: String) {
        self.items.lock().unwrap().push_back(payload);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Record on every pop whether `(volume, path)` is present in `store`
    pub fn watch(&self, store: Arc<MemoryVolumeStore>, volume: &str, path: &str) {
        *self.watch.lock().unwrap() = Some((store, volume.to_string(), path.to_string()));
    }

    /// Presence of the watched path at each pop since `watch`
    pub fn seen_at_pop(&self) -> Vec<bool> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn pop(&self) -> Result<Option<String>, QueueError> {
        if let Some((store, volume, path)) = self.watch.lock().unwrap().as_ref() {
            self.seen.lock().unwrap().push(store.contains(volume, path));
        }
        Ok(self.items.lock().unwrap().pop_front())
    }
}

/// Instruction source replaying fixed payloads, then reporting silence
pub struct ScriptedSource {
    messages: VecDeque<String>,
}

impl ScriptedSource {
    pub fn new(messages: &[&str]) -> Self {
        Self {
            messages: messages.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[async_trait]
impl InstructionSource for ScriptedSource {
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<String>, QueueError> {
        match self.messages.pop_front() {
            Some(msg) => Ok(Some(msg)),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }
}

/// Subscriber handing out one scripted subscription per call
///
/// `Ok(messages)` opens a stream that yields `messages` and then ends;
/// `Err(())` fails that attempt.
pub struct ScriptedSubscriber {
    script: Mutex<VecDeque<Result<Vec<String>, ()>>>,
    attempts: AtomicUsize,
}

impl ScriptedSubscriber {
    pub fn new(script: Vec<Result<Vec<&str>, ()>>) -> Self {
        Self {
            script: Mutex::new(
                script
                    .into_iter()
                    .map(|step| step.map(|msgs| msgs.into_iter().map(String::from).collect()))
                    .collect(),
            ),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subscriber for ScriptedSubscriber {
    async fn subscribe(&self) -> Result<BoxStream<'static, String>, QueueError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(messages)) => Ok(stream::iter(messages).boxed()),
            _ => Err(QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            )))),
        }
    }
}

/// Set of `(volume, path)` directories
#[derive(Default)]
pub struct MemoryVolumeStore {
    paths: Mutex<HashSet<(String, String)>>,
    removals: AtomicUsize,
}

impl MemoryVolumeStore {
    pub fn with_paths(paths: &[(&str, &str)]) -> Self {
        let store = Self::default();
        for (volume, path) in paths {
            store.insert(volume, path);
        }
        store
    }

    pub fn insert(&self, volume: &str, path: &str) {
        self.paths
            .lock()
            .unwrap()
            .insert((volume.to_string(), path.to_string()));
    }

    /// Drop a path behind the agent's back
    pub fn remove_path(&self, volume: &str, path: &str) {
        self.paths
            .lock()
            .unwrap()
            .remove(&(volume.to_string(), path.to_string()));
    }

    pub fn contains(&self, volume: &str, path: &str) -> bool {
        self.paths
            .lock()
            .unwrap()
            .contains(&(volume.to_string(), path.to_string()))
    }

    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VolumeStore for MemoryVolumeStore {
    async fn exists(&self, volume: &str, path: &str) -> Result<bool, StorageError> {
        Ok(self.contains(volume, path))
    }

    async fn remove_all(&self, volume: &str, path: &str) -> Result<(), StorageError> {
        let prefix = format!("{}/", path);
        let mut paths = self.paths.lock().unwrap();
        let before = paths.len();
        paths.retain(|(v, p)| !(v == volume && (p == path || p.starts_with(&prefix))));
        if paths.len() == before {
            return Err(StorageError::Io(io::Error::new(io::ErrorKind::NotFound, path.to_string())));
        }
        self.removals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct HypervisorState {
    /// uuid -> descriptor
    domains: BTreeMap<String, String>,
    calls: Vec<String>,
    failing: HashSet<String>,
    stopped: HashSet<String>,
}

/// Hypervisor recording every domain operation as `"<op> <uuid>"`
///
/// `list` is not recorded.
#[derive(Default)]
pub struct MockHypervisor {
    state: Mutex<HypervisorState>,
}

impl MockHypervisor {
    pub fn with_domains(uuids: &[&str]) -> Self {
        let hv = Self::default();
        for uuid in uuids {
            hv.add_domain(uuid, "<domain/>");
        }
        hv
    }

    pub fn add_domain(&self, uuid: &str, xml: &str) {
        self.state
            .lock()
            .unwrap()
            .domains
            .insert(uuid.to_string(), xml.to_string());
    }

    pub fn remove_domain(&self, uuid: &str) {
        self.state.lock().unwrap().domains.remove(uuid);
    }

    /// Make every later `op` call fail
    pub fn fail(&self, op: &str) {
        self.state.lock().unwrap().failing.insert(op.to_string());
    }

    /// Make `destroy` report the domain as not running
    pub fn set_not_running(&self, uuid: &str) {
        self.state.lock().unwrap().stopped.insert(uuid.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn check(&self, op: &str) -> Result<(), HypervisorError> {
        if self.state.lock().unwrap().failing.contains(op) {
            return Err(HypervisorError::Command {
                command: format!("virsh {}", op),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn record(&self, op: &str, domain: &Domain) -> Result<(), HypervisorError> {
        self.check(op)?;
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("{} {}", op, domain.uuid));
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn list_all_domains(&self) -> Result<Vec<Domain>, HypervisorError> {
        self.check("list")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .domains
            .keys()
            .map(Domain::new)
            .collect())
    }

    async fn define_xml(&self, xml: &str) -> Result<Domain, HypervisorError> {
        self.check("define")?;
        let uuid = descriptor::domain_uuid(xml)?
            .ok_or_else(|| HypervisorError::Descriptor("no uuid".to_string()))?;
        let domain = Domain::new(&uuid);
        self.add_domain(&uuid, xml);
        self.record("define", &domain)?;
        Ok(domain)
    }

    async fn create(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.record("create", domain)
    }

    async fn destroy(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.record("destroy", domain)?;
        if self.state.lock().unwrap().stopped.contains(&domain.uuid) {
            return Err(HypervisorError::NotRunning(domain.uuid.clone()));
        }
        Ok(())
    }

    async fn undefine(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.record("undefine", domain)?;
        self.remove_domain(&domain.uuid);
        Ok(())
    }

    async fn reboot(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.record("reboot", domain)
    }

    async fn shutdown(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.record("shutdown", domain)
    }

    async fn suspend(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.record("suspend", domain)
    }

    async fn resume(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.record("resume", domain)
    }

    async fn xml_desc(&self, domain: &Domain) -> Result<String, HypervisorError> {
        self.record("xml_desc", domain)?;
        self.state
            .lock()
            .unwrap()
            .domains
            .get(&domain.uuid)
            .cloned()
            .ok_or_else(|| HypervisorError::Descriptor(format!("no domain {}", domain.uuid)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionStep {
    GuestDir,
    SystemImage,
    Config,
    DiskImage,
}

/// Provisioner that only records the guest directory in a `MemoryVolumeStore`
pub struct ScriptedProvisioner {
    store: Arc<MemoryVolumeStore>,
    failing: Mutex<Option<ProvisionStep>>,
    calls: Mutex<Vec<ProvisionStep>>,
}

impl ScriptedProvisioner {
    pub fn new(store: Arc<MemoryVolumeStore>) -> Self {
        Self {
            store,
            failing: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail at `step` from now on (replaces any earlier choice)
    pub fn fail_at(&self, step: ProvisionStep) {
        *self.failing.lock().unwrap() = Some(step);
    }

    pub fn calls(&self) -> Vec<ProvisionStep> {
        self.calls.lock().unwrap().clone()
    }

    fn step(&self, step: ProvisionStep) -> Result<(), ProvisionError> {
        self.calls.lock().unwrap().push(step);
        if *self.failing.lock().unwrap() == Some(step) {
            return Err(ProvisionError::Command {
                command: format!("{:?}", step),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GuestProvisioner for ScriptedProvisioner {
    async fn generate_guest_dir(&self, guest: &GuestContext) -> Result<(), ProvisionError> {
        self.step(ProvisionStep::GuestDir)?;
        self.store.insert(guest.volume(), &guest.guest_dir);
        Ok(())
    }

    async fn generate_system_image(&self, _guest: &GuestContext) -> Result<(), ProvisionError> {
        self.step(ProvisionStep::SystemImage)
    }

    async fn init_config(&self, _guest: &GuestContext) -> Result<(), ProvisionError> {
        self.step(ProvisionStep::Config)
    }

    async fn generate_disk_image(&self, _guest: &GuestContext) -> Result<(), ProvisionError> {
        self.step(ProvisionStep::DiskImage)
    }
}

#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<(EmitLevel, String)>>,
}

impl RecordingEmitter {
    pub fn events(&self) -> Vec<(EmitLevel, String)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Emitter for RecordingEmitter {
    async fn emit(&self, level: EmitLevel, message: &str) {
        self.events.lock().unwrap().push((level, message.to_string()));
    }
}
