//! Snapshot persistence for discovery sessions.
//!
//! The full session is written as one JSON blob after every reducer
//! transition, so a page reload (or process restart) can show the last
//! known progress. Restore applies the staleness rules: a `running`
//! snapshot too old to correspond to any live connection is discarded,
//! and a fresh one is force-completed because no transport is actually
//! resumed across a restart.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::session::{DiscoverySession, SessionStatus, StageStatus};

const SNAPSHOT_FILE: &str = "discovery_session.json";

/// Stores the current session under a single fixed path.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: Option<PathBuf>,
}

impl SnapshotStore {
    /// Store under the platform-local data directory.
    ///
    /// When no data directory exists (headless CI, exotic platforms) the
    /// store silently becomes a no-op; snapshotting must never take the
    /// live session down with it.
    pub fn new() -> Self {
        Self {
            path: dirs::data_local_dir().map(|d| d.join("campuslink").join(SNAPSHOT_FILE)),
        }
    }

    /// Store under an explicit file path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Persist the session. Failures are logged and swallowed.
    pub fn save(&self, session: &DiscoverySession) {
        let Some(path) = &self.path else { return };
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(session) {
            Ok(data) => {
                if let Err(e) = fs::write(path, data) {
                    warn!(path = %path.display(), error = %e, "failed to write session snapshot");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize session snapshot"),
        }
    }

    /// Remove the persisted snapshot, if any.
    pub fn clear(&self) {
        if let Some(path) = &self.path {
            let _ = fs::remove_file(path);
        }
    }

    /// Restore a session on cold start.
    ///
    /// - No file, unreadable file, or unparsable JSON → `None` (any old or
    ///   foreign blob is simply "no snapshot").
    /// - `complete` → restored verbatim, display only.
    /// - `running` older than `staleness` → discarded entirely.
    /// - `running` within `staleness` → force-completed with `ended_at =
    ///   now`, so the UI never shows a live spinner with no connection
    ///   behind it.
    pub fn restore(&self, staleness: Duration, now: DateTime<Utc>) -> Option<DiscoverySession> {
        let path = self.path.as_ref()?;
        let data = fs::read_to_string(path).ok()?;
        let mut session: DiscoverySession = match serde_json::from_str(&data) {
            Ok(session) => session,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "ignoring unreadable snapshot");
                return None;
            }
        };

        match session.status {
            SessionStatus::Complete => Some(session),
            SessionStatus::Idle => None,
            SessionStatus::Running => {
                let age = (now - session.started_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if age > staleness {
                    debug!(age_secs = age.as_secs(), "discarding stale running snapshot");
                    self.clear();
                    return None;
                }

                // No transport is resumed across a restart; settle the
                // session so nothing is left running.
                for stage in session.stages.iter_mut() {
                    if stage.status == StageStatus::Running {
                        stage.status = StageStatus::Complete;
                    }
                    stage.expanded = false;
                }
                session.status = SessionStatus::Complete;
                session.ended_at = Some(now);
                session.recompute_progress();
                Some(session)
            }
        }
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StartOptions;
    use crate::session::StageId;
    use uuid::Uuid;

    fn temp_store() -> SnapshotStore {
        let path = std::env::temp_dir()
            .join(format!("discovery-snapshot-{}", Uuid::new_v4()))
            .join(SNAPSHOT_FILE);
        SnapshotStore::at(path)
    }

    fn running_session(started_at: DateTime<Utc>) -> DiscoverySession {
        let mut session =
            DiscoverySession::new("robotics camps", &StartOptions::default(), started_at);
        session.stage_mut(StageId::WebSearch).unwrap().status = StageStatus::Running;
        session
    }

    #[test]
    fn save_restore_roundtrips_completed_session() {
        let store = temp_store();
        let now = Utc::now();
        let mut session = running_session(now);
        session.status = SessionStatus::Complete;
        session.ended_at = Some(now);

        store.save(&session);
        let restored = store
            .restore(Duration::from_secs(600), now)
            .expect("snapshot should restore");

        assert_eq!(restored.id, session.id);
        assert_eq!(restored.status, SessionStatus::Complete);
        store.clear();
    }

    #[test]
    fn fresh_running_snapshot_is_force_completed() {
        let store = temp_store();
        let now = Utc::now();
        let session = running_session(now - chrono::Duration::seconds(30));

        store.save(&session);
        let restored = store
            .restore(Duration::from_secs(600), now)
            .expect("snapshot should restore");

        assert_eq!(restored.status, SessionStatus::Complete);
        assert_eq!(restored.ended_at, Some(now));
        assert!(restored
            .stages
            .iter()
            .all(|s| s.status != StageStatus::Running));
        store.clear();
    }

    #[test]
    fn stale_running_snapshot_is_discarded() {
        let store = temp_store();
        let now = Utc::now();
        let session = running_session(now - chrono::Duration::seconds(3600));

        store.save(&session);
        assert!(store.restore(Duration::from_secs(600), now).is_none());
        // And the file itself is gone.
        assert!(store.restore(Duration::from_secs(1_000_000), now).is_none());
    }

    #[test]
    fn garbage_snapshot_is_no_snapshot() {
        let store = temp_store();
        let SnapshotStore { path: Some(path) } = &store else {
            panic!("temp store must have a path");
        };
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "{ definitely not a session").unwrap();

        assert!(store.restore(Duration::from_secs(600), Utc::now()).is_none());
        store.clear();
    }

    #[test]
    fn missing_file_is_no_snapshot() {
        let store = temp_store();
        assert!(store.restore(Duration::from_secs(600), Utc::now()).is_none());
    }

    #[test]
    fn clear_removes_the_file() {
        let store = temp_store();
        let now = Utc::now();
        let mut session = running_session(now);
        session.status = SessionStatus::Complete;

        store.save(&session);
        store.clear();
        assert!(store.restore(Duration::from_secs(600), now).is_none());
    }
}
