//! Entry actions backed by the on-disk artifacts.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use handoff_protocol::{Recommendations, StatusUpdate};

use crate::artifacts::{merge_status, read_heartbeat, write_routing_flag};
use crate::machine::{EntryAction, SessionTransition, StateActions};
use crate::persistence::{WorkStatePersistence, WorkStateSource};
use crate::reconcile::status_update_for;
use crate::storage::StorageConfig;

pub struct ArtifactActions {
    status_path: PathBuf,
    routing_path: PathBuf,
    heartbeat_path: PathBuf,
    persistence: WorkStatePersistence,
    source: Box<dyn WorkStateSource>,
    /// Used when no heartbeat names the session.
    fallback_session_id: String,
    last_snapshot: Option<PathBuf>,
    /// Last routing value written, used for states that leave routing alone.
    local_only: Option<bool>,
}

impl ArtifactActions {
    pub fn new(
        storage: &StorageConfig,
        source: Box<dyn WorkStateSource>,
        fallback_session_id: String,
    ) -> Self {
        Self {
            status_path: storage.status_file(),
            routing_path: storage.routing_file(),
            heartbeat_path: storage.heartbeat_file(),
            persistence: WorkStatePersistence::new(storage.backups_dir()),
            source,
            fallback_session_id,
            last_snapshot: None,
            local_only: None,
        }
    }

    pub fn persistence(&self) -> &WorkStatePersistence {
        &self.persistence
    }

    pub fn last_snapshot(&self) -> Option<&PathBuf> {
        self.last_snapshot.as_ref()
    }

    pub fn session_id(&self) -> String {
        match read_heartbeat(&self.heartbeat_path) {
            Ok(Some(heartbeat)) if !heartbeat.session_id.is_empty() => heartbeat.session_id,
            _ => self.fallback_session_id.clone(),
        }
    }

    /// Captures and saves a snapshot. Failures are logged, never raised.
    pub fn save_snapshot(&mut self, now: DateTime<Utc>, reason: &str) -> Option<PathBuf> {
        let snapshot = self.source.capture(&self.session_id(), now);
        match self.persistence.save(&snapshot) {
            Ok(path) => {
                info!(path = %path.display(), reason, "Work state saved");
                self.last_snapshot = Some(path.clone());
                Some(path)
            }
            Err(err) => {
                warn!(error = %err, reason, "Failed to save work state");
                None
            }
        }
    }

    pub fn merge_status(&self, update: &StatusUpdate, now: DateTime<Utc>) {
        if let Err(err) = merge_status(&self.status_path, update, now) {
            warn!(error = %err, path = %self.status_path.display(), "Failed to update status");
        }
    }

    fn set_local_only(&mut self, local_only: bool, now: DateTime<Utc>) {
        self.local_only = Some(local_only);
        if let Err(err) = write_routing_flag(&self.routing_path, local_only, now) {
            warn!(error = %err, path = %self.routing_path.display(), "Failed to update routing flag");
        }
    }
}

impl StateActions for ArtifactActions {
    fn run(&mut self, action: &EntryAction, transition: &SessionTransition) {
        let now = transition.timestamp;
        match action {
            EntryAction::DisableLocalOnly => self.set_local_only(false, now),
            EntryAction::EnableLocalOnly => self.set_local_only(true, now),
            EntryAction::PublishStatus => {
                let mut update = status_update_for(transition.to);
                update.reason = Some(transition.reason.clone());
                if update.fallback_mode.is_none() {
                    if let Some(local_only) = self.local_only {
                        update.fallback_mode = Some(local_only);
                        update.recommendations = Some(Recommendations::for_fallback(local_only));
                    }
                }
                self.merge_status(&update, now);
            }
            EntryAction::PublishWarning(message) => {
                warn!(message = %message, "Usage warning");
                let update = StatusUpdate {
                    warning: Some(message.clone()),
                    ..StatusUpdate::default()
                };
                self.merge_status(&update, now);
            }
            EntryAction::SaveSnapshot => {
                self.save_snapshot(now, &transition.reason);
            }
        }
    }
}
