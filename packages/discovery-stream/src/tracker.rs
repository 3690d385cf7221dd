//! Public facade for discovery progress tracking.
//!
//! A [`DiscoveryTracker`] owns everything for one session: the connector,
//! the cancellation token, the run-loop task, the session slot, and the
//! snapshot store. There is deliberately no module-level state; dropping
//! the tracker tears the whole thing down.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use chrono::Utc;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{StartOptions, TrackerConfig};
use crate::events::InboundEvent;
use crate::normalize::{normalize, StageOp};
use crate::reducer::{apply, Effect};
use crate::session::{DiscoverySession, SessionStatus, StageId, StageItem};
use crate::snapshot::SnapshotStore;
use crate::transport::{
    ConnectionPhase, DiscoveryEventStream, EventStreamConnector, HttpConnector, RetryState,
};

type ItemCallback = Box<dyn Fn(&StageItem) + Send + Sync>;
type CompleteCallback = Box<dyn Fn(u32) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    item_found: Option<ItemCallback>,
    complete: Option<CompleteCallback>,
}

struct SessionSlot {
    session: Option<DiscoverySession>,
    /// Set once `on_complete` has fired for the current session.
    complete_notified: bool,
}

/// State shared between the facade and the run-loop task.
struct Shared {
    slot: Mutex<SessionSlot>,
    callbacks: RwLock<Callbacks>,
    snapshots: SnapshotStore,
}

/// Lock helper that shrugs off poisoning: the session state is plain data
/// and stays usable even if a callback panicked mid-update.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

/// Tracks one discovery pipeline run end to end.
///
/// ```rust,ignore
/// use discovery_stream::{DiscoveryTracker, TrackerConfig, StartOptions};
///
/// let tracker = DiscoveryTracker::new(
///     TrackerConfig::new("https://api.campuslink.dev/streams/discovery"),
/// );
/// tracker.on_item_found(|item| println!("found: {}", item.label));
/// tracker.on_complete(|count| println!("done, {} opportunities", count));
/// tracker.start("robotics summer camps", StartOptions::default());
/// ```
pub struct DiscoveryTracker {
    config: TrackerConfig,
    connector: Arc<dyn EventStreamConnector>,
    shared: Arc<Shared>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryTracker {
    /// Create a tracker talking to the configured HTTP endpoint.
    pub fn new(config: TrackerConfig) -> Self {
        let connector = Arc::new(HttpConnector::new(
            config.endpoint.clone(),
            config.auth_token.clone(),
        ));
        Self::with_connector(config, connector)
    }

    /// Create a tracker with a custom connector (tests, alternate
    /// transports).
    pub fn with_connector(config: TrackerConfig, connector: Arc<dyn EventStreamConnector>) -> Self {
        let snapshots = match &config.snapshot_path {
            Some(path) => SnapshotStore::at(path.clone()),
            None => SnapshotStore::new(),
        };

        // A restored session is display-only; its completion was either
        // already announced or belongs to a previous process.
        let restored = snapshots.restore(config.staleness_threshold, Utc::now());
        if restored.is_some() {
            debug!("restored persisted discovery session");
        }

        let shared = Arc::new(Shared {
            slot: Mutex::new(SessionSlot {
                session: restored,
                complete_notified: true,
            }),
            callbacks: RwLock::new(Callbacks::default()),
            snapshots,
        });

        Self {
            config,
            connector,
            shared,
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Register the opportunity callback. Fires once per deduplicated
    /// opportunity.
    pub fn on_item_found(&self, callback: impl Fn(&StageItem) + Send + Sync + 'static) {
        self.shared
            .callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .item_found = Some(Box::new(callback));
    }

    /// Register the completion callback. Fires exactly once per session,
    /// whether completion was genuine, timeout-driven, retry-exhaustion
    /// driven, or forced by `stop()`.
    pub fn on_complete(&self, callback: impl Fn(u32) + Send + Sync + 'static) {
        self.shared
            .callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .complete = Some(Box::new(callback));
    }

    /// Start a new discovery session, discarding any existing one.
    ///
    /// Returns immediately; progress arrives through [`Self::session`]
    /// reads and the registered callbacks. Must be called within a tokio
    /// runtime.
    pub fn start(&self, query: impl Into<String>, options: StartOptions) {
        let query = query.into();

        // Tear down the previous run before its session is replaced.
        if let Some(token) = lock(&self.cancel).take() {
            token.cancel();
        }
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }

        let session = DiscoverySession::new(query.clone(), &options, Utc::now());
        {
            let mut slot = lock(&self.shared.slot);
            self.shared.snapshots.save(&session);
            slot.session = Some(session);
            slot.complete_notified = false;
        }

        info!(query = %query, "starting discovery session");

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_session(
            self.shared.clone(),
            self.connector.clone(),
            self.config.clone(),
            query,
            options,
            token.clone(),
        ));
        *lock(&self.cancel) = Some(token);
        *lock(&self.task) = Some(handle);
    }

    /// Close the transport without waiting for a terminal event and
    /// finalize the session as complete.
    ///
    /// When this returns, no timer or connection from the session is
    /// still alive.
    pub async fn stop(&self) {
        if let Some(token) = lock(&self.cancel).take() {
            token.cancel();
        }
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let mut effects = Vec::new();
        {
            let mut slot = lock(&self.shared.slot);
            if let Some(session) = slot.session.as_mut() {
                if session.status == SessionStatus::Running {
                    effects = apply(session, StageOp::SessionCompleted { count: None }, Utc::now());
                    self.shared.snapshots.save(session);
                }
            }
        }
        dispatch(&self.shared, effects);
    }

    /// `stop()` plus removal of all in-memory and persisted state.
    pub async fn clear(&self) {
        self.stop().await;

        let mut slot = lock(&self.shared.slot);
        slot.session = None;
        slot.complete_notified = false;
        self.shared.snapshots.clear();
    }

    /// Flip a stage's expanded flag. UI-only; no pipeline effect.
    pub fn toggle_stage_expanded(&self, stage: StageId) {
        let mut slot = lock(&self.shared.slot);
        if let Some(session) = slot.session.as_mut() {
            if let Some(record) = session.stage_mut(stage) {
                record.expanded = !record.expanded;
            }
            self.shared.snapshots.save(session);
        }
    }

    /// Snapshot of the current session state, for rendering.
    pub fn session(&self) -> Option<DiscoverySession> {
        lock(&self.shared.slot).session.clone()
    }

    /// Whether a session is currently running.
    pub fn is_active(&self) -> bool {
        lock(&self.shared.slot)
            .session
            .as_ref()
            .is_some_and(|s| s.is_active())
    }

    /// First stage in fixed order currently running, if any.
    pub fn active_stage_id(&self) -> Option<StageId> {
        lock(&self.shared.slot)
            .session
            .as_ref()
            .and_then(|s| s.active_stage())
    }
}

impl Drop for DiscoveryTracker {
    fn drop(&mut self) {
        if let Some(token) = lock(&self.cancel).take() {
            token.cancel();
        }
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

enum RunOutcome {
    /// Terminal event observed; the reducer already completed the session.
    Terminal,
    /// Retry budget spent without a terminal event.
    RetriesExhausted,
}

/// Drive one session: connect, read, reduce, and always terminate.
///
/// The hard timeout is armed when the loop starts, so even a transport
/// that connects and then goes silent forever cannot keep the session
/// running past the deadline.
async fn run_session(
    shared: Arc<Shared>,
    connector: Arc<dyn EventStreamConnector>,
    config: TrackerConfig,
    query: String,
    options: StartOptions,
    cancel: CancellationToken,
) {
    let deadline = tokio::time::Instant::now() + config.session_timeout;

    tokio::select! {
        _ = cancel.cancelled() => {
            // stop()/clear() finalize the session on their side.
            debug!("discovery session cancelled");
        }
        _ = tokio::time::sleep_until(deadline) => {
            warn!(
                timeout_secs = config.session_timeout.as_secs(),
                "discovery session hit hard timeout; forcing completion"
            );
            inject_failure(&shared, "discovery stream timed out");
        }
        outcome = drive(&shared, connector.as_ref(), &config, &query, &options) => {
            match outcome {
                RunOutcome::Terminal => {
                    info!("discovery session completed");
                }
                RunOutcome::RetriesExhausted => {
                    warn!(
                        max_retries = config.max_retries,
                        "discovery stream retries exhausted; forcing completion"
                    );
                    inject_failure(&shared, "connection to discovery stream lost");
                }
            }
        }
    }
}

/// Connect/read/reconnect until a terminal event or an exhausted retry
/// budget. Reconnects only after a definitive close; while a connect is
/// pending there is nothing to retry on top of.
async fn drive(
    shared: &Shared,
    connector: &dyn EventStreamConnector,
    config: &TrackerConfig,
    query: &str,
    options: &StartOptions,
) -> RunOutcome {
    let mut retry = RetryState::new(config.max_retries, config.retry_base_delay);

    loop {
        debug!(phase = ?ConnectionPhase::Connecting, attempt = retry.attempt(), "transport phase");

        match connector.connect(query, options).await {
            Ok(bytes) => {
                debug!(phase = ?ConnectionPhase::Open, "transport phase");
                let mut stream = DiscoveryEventStream::new(bytes);

                loop {
                    match stream.next().await {
                        Some(Ok(event)) => {
                            if apply_event(shared, &event) {
                                debug!(phase = ?ConnectionPhase::ClosedClean, "transport phase");
                                return RunOutcome::Terminal;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "discovery stream errored");
                            break;
                        }
                        None => {
                            // EOF without a terminal event is a drop, not a
                            // completion.
                            debug!("discovery stream ended without terminal event");
                            break;
                        }
                    }
                }
                debug!(phase = ?ConnectionPhase::ClosedError, "transport phase");
            }
            Err(e) => {
                warn!(error = %e, attempt = retry.attempt(), "discovery stream connect failed");
            }
        }

        match retry.next_delay() {
            Some(delay) => {
                debug!(delay_ms = delay.as_millis() as u64, "reconnecting discovery stream");
                tokio::time::sleep(delay).await;
            }
            None => return RunOutcome::RetriesExhausted,
        }
    }
}

/// Normalize and fold one event; returns whether the session completed.
fn apply_event(shared: &Shared, event: &InboundEvent) -> bool {
    let ops = normalize(event);
    if ops.is_empty() {
        return false;
    }

    let mut effects = Vec::new();
    let completed;
    {
        let mut slot = lock(&shared.slot);
        let Some(session) = slot.session.as_mut() else {
            return false;
        };
        let now = Utc::now();
        for op in ops {
            effects.extend(apply(session, op, now));
        }
        completed = session.status == SessionStatus::Complete;
        shared.snapshots.save(session);
    }

    // Callbacks run outside the session lock.
    dispatch(shared, effects);
    completed
}

/// Synthetic error + completion through the normal event path, so forced
/// termination looks exactly like a server-driven one.
fn inject_failure(shared: &Shared, message: &str) {
    apply_event(
        shared,
        &InboundEvent::Error {
            message: Some(message.to_string()),
            layer: None,
            diagnostic: false,
        },
    );
    apply_event(
        shared,
        &InboundEvent::Complete {
            count: None,
            message: None,
        },
    );
}

fn dispatch(shared: &Shared, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::ItemFound(item) => {
                let callbacks = read(&shared.callbacks);
                if let Some(callback) = &callbacks.item_found {
                    callback(&item);
                }
            }
            Effect::Completed(count) => {
                let should_fire = {
                    let mut slot = lock(&shared.slot);
                    if slot.complete_notified {
                        false
                    } else {
                        slot.complete_notified = true;
                        true
                    }
                };
                if should_fire {
                    let callbacks = read(&shared.callbacks);
                    if let Some(callback) = &callbacks.complete {
                        callback(count);
                    }
                }
            }
        }
    }
}
