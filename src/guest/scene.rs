//! Scene cleanup
//!
//! From the moment a guest's working directory is created until its domain is
//! defined, the scene is "dirty": an aborted attempt leaves artifacts on the
//! volume that nothing else references. The creation engine reclaims them at
//! the start of its next cycle.
//!
//! The state is held in memory by the engine loop only. A killed process
//! forgets it and the directory stays on the volume until an operator removes
//! it.

use tracing::{info, warn};

use super::GuestContext;
use crate::diagnostics::{EmitLevel, Emitter};
use crate::metrics::SCENE_CLEANUPS;
use crate::storage::VolumeStore;

/// Artifacts of an attempt that did not reach domain definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyScene {
    pub guest_id: String,
    pub volume: String,
    pub guest_dir: String,
}

/// Result of a cleanup pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Nothing was dirty
    Clean,
    Removed(DirtyScene),
    /// The directory was already gone
    Missing(DirtyScene),
    /// Removal failed; the scene is forgotten anyway
    Failed(DirtyScene),
}

/// Dirty-scene tracking for one creation engine
#[derive(Debug, Default)]
pub struct SceneState {
    dirty: Option<DirtyScene>,
}

impl SceneState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.is_some()
    }

    pub fn dirty(&self) -> Option<&DirtyScene> {
        self.dirty.as_ref()
    }

    /// Record that `guest`'s working directory now exists
    pub fn mark_dirty(&mut self, guest: &GuestContext) {
        self.dirty = Some(DirtyScene {
            guest_id: guest.guest_id().to_string(),
            volume: guest.volume().to_string(),
            guest_dir: guest.guest_dir.clone(),
        });
    }

    /// Record that the domain was defined; its artifacts are no longer orphaned
    pub fn mark_clean(&mut self) {
        self.dirty = None;
    }

    /// Reclaim the dirty scene, if any
    ///
    /// Best effort: a missing directory is reported as a warning, a failed
    /// removal is logged, and the scene is cleared in every case.
    pub async fn cleanup(&mut self, store: &dyn VolumeStore, emitter: &dyn Emitter) -> CleanupOutcome {
        let Some(scene) = self.dirty.take() else {
            return CleanupOutcome::Clean;
        };

        match store.exists(&scene.volume, &scene.guest_dir).await {
            Ok(true) => match store.remove_all(&scene.volume, &scene.guest_dir).await {
                Ok(()) => {
                    info!(guest_id = %scene.guest_id, dir = %scene.guest_dir, "dirty scene removed");
                    SCENE_CLEANUPS.with_label_values(&["removed"]).inc();
                    CleanupOutcome::Removed(scene)
                }
                Err(e) => {
                    let msg = format!("failed to clean scene {}/{}: {}", scene.volume, scene.guest_dir, e);
                    warn!(guest_id = %scene.guest_id, "{}", msg);
                    emitter.emit(EmitLevel::Error, &msg).await;
                    SCENE_CLEANUPS.with_label_values(&["failed"]).inc();
                    CleanupOutcome::Failed(scene)
                }
            },
            Ok(false) => {
                let msg = format!("scene cleanup skipped, path does not exist: {}/{}", scene.volume, scene.guest_dir);
                warn!(guest_id = %scene.guest_id, "{}", msg);
                emitter.emit(EmitLevel::Warn, &msg).await;
                SCENE_CLEANUPS.with_label_values(&["missing"]).inc();
                CleanupOutcome::Missing(scene)
            }
            Err(e) => {
                let msg = format!("failed to inspect scene {}/{}: {}", scene.volume, scene.guest_dir, e);
                warn!(guest_id = %scene.guest_id, "{}", msg);
                emitter.emit(EmitLevel::Error, &msg).await;
                SCENE_CLEANUPS.with_label_values(&["failed"]).inc();
                CleanupOutcome::Failed(scene)
            }
        }
    }
}
