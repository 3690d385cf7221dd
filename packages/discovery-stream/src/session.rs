//! Session, stage, and item state for one discovery run.
//!
//! A [`DiscoverySession`] tracks a single end-to-end pipeline run for one
//! query. It is created by the tracker, mutated only by the reducer, and
//! replaced wholesale on `clear()` or a new `start()`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StartOptions;

/// The six fixed pipeline stages, in execution order.
///
/// Stage ids and order never change within a session; the reducer assumes
/// stages advance monotonically and are never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    QueryGeneration,
    WebSearch,
    SemanticFiltering,
    ParallelCrawl,
    AiExtraction,
    DatabaseSync,
}

impl StageId {
    /// All stages in fixed pipeline order.
    pub const ALL: [StageId; 6] = [
        StageId::QueryGeneration,
        StageId::WebSearch,
        StageId::SemanticFiltering,
        StageId::ParallelCrawl,
        StageId::AiExtraction,
        StageId::DatabaseSync,
    ];

    /// Position in the fixed pipeline order.
    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or(0)
    }

    /// The stage immediately before this one, if any.
    pub fn preceding(&self) -> Option<StageId> {
        let idx = self.index();
        (idx > 0).then(|| Self::ALL[idx - 1])
    }

    /// Wire identifier used by structured layer events.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::QueryGeneration => "query_generation",
            StageId::WebSearch => "web_search",
            StageId::SemanticFiltering => "semantic_filtering",
            StageId::ParallelCrawl => "parallel_crawl",
            StageId::AiExtraction => "ai_extraction",
            StageId::DatabaseSync => "database_sync",
        }
    }

    /// Parse an explicit layer id from the wire.
    ///
    /// Accepts the canonical ids plus the short aliases older backends
    /// emitted. Unknown ids return `None` so callers can drop the event
    /// instead of failing (schema-drift guard).
    pub fn from_wire(value: &str) -> Option<StageId> {
        match value {
            "query_generation" | "queries" => Some(StageId::QueryGeneration),
            "web_search" | "search" => Some(StageId::WebSearch),
            "semantic_filtering" | "filtering" => Some(StageId::SemanticFiltering),
            "parallel_crawl" | "crawl" => Some(StageId::ParallelCrawl),
            "ai_extraction" | "extraction" => Some(StageId::AiExtraction),
            "database_sync" | "sync" => Some(StageId::DatabaseSync),
            _ => None,
        }
    }

    /// Human-readable stage label.
    pub fn label(&self) -> &'static str {
        match self {
            StageId::QueryGeneration => "Generating search queries",
            StageId::WebSearch => "Searching the web",
            StageId::SemanticFiltering => "Filtering for relevance",
            StageId::ParallelCrawl => "Reading pages",
            StageId::AiExtraction => "Extracting opportunities",
            StageId::DatabaseSync => "Saving results",
        }
    }
}

/// Lifecycle of a whole session.
///
/// Only ever moves `Idle → Running → Complete`; back to `Idle` only by
/// replacing the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Complete,
}

/// Lifecycle of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Complete,
    Error,
}

/// Lifecycle of a single item within a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    #[default]
    Running,
    Success,
    Failed,
}

impl ItemStatus {
    /// Parse a status string from the wire. Unknown values return `None`.
    pub fn from_wire(value: &str) -> Option<ItemStatus> {
        match value {
            "pending" => Some(ItemStatus::Pending),
            "running" | "in_progress" => Some(ItemStatus::Running),
            "success" | "complete" | "done" => Some(ItemStatus::Success),
            "failed" | "error" => Some(ItemStatus::Failed),
            _ => None,
        }
    }

    /// Whether this status is final for an item.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Success | ItemStatus::Failed)
    }
}

/// Per-stage counters reported by the pipeline.
///
/// Fields are merged `Some`-over-`None`: a later event only overwrites
/// counters it actually carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    /// Units of work finished (searches run, pages crawled, ...).
    pub completed: Option<u32>,

    /// Total units of work, when the pipeline knows it up front.
    pub total: Option<u32>,

    /// Items that passed the stage's filter, where that applies.
    pub matched: Option<u32>,
}

impl StageStats {
    /// Merge counters from a later event into this one.
    pub fn merge(&mut self, other: StageStats) {
        if other.completed.is_some() {
            self.completed = other.completed;
        }
        if other.total.is_some() {
            self.total = other.total;
        }
        if other.matched.is_some() {
            self.matched = other.matched;
        }
    }
}

/// One logical unit of work inside a stage (a query, a URL, an extracted
/// opportunity).
///
/// The id stays stable across repeated updates to the same logical item.
/// Identity is matched by URL when both sides carry one, else by label;
/// this is what keeps the same page from showing up twice when it is
/// reported under different event types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageItem {
    pub id: Uuid,
    pub label: String,
    pub status: ItemStatus,

    /// Pipeline confidence in this item, clamped to [0, 1].
    pub confidence: Option<f32>,

    /// Source URL, when the item corresponds to a page.
    pub url: Option<String>,

    /// Failure detail for items that ended `Failed`.
    pub error: Option<String>,
}

impl StageItem {
    /// Create a new item with a fresh id.
    pub fn new(label: impl Into<String>, status: ItemStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            status,
            confidence: None,
            url: None,
            error: None,
        }
    }

    /// Set the source URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the confidence, clamped to [0, 1].
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    /// Whether this item is the same logical item as `(url, label)`.
    pub fn matches(&self, url: Option<&str>, label: Option<&str>) -> bool {
        if let (Some(own), Some(other)) = (self.url.as_deref(), url) {
            return own == other;
        }
        match (url, label) {
            // One side has a URL and the other does not: fall back to label
            // so a `found(url)` row and a later label-only report converge.
            (_, Some(label)) => self.label == label,
            (Some(url), None) => self.url.as_deref() == Some(url),
            (None, None) => false,
        }
    }
}

/// Progress record for one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: StageId,
    pub status: StageStatus,

    /// Whether the UI shows this stage's item list.
    pub expanded: bool,

    /// Latest free-text status line from the pipeline.
    pub message: Option<String>,

    /// Model reasoning annotation, when the backend streams one.
    pub reasoning: Option<String>,

    pub stats: StageStats,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub items: Vec<StageItem>,
}

impl StageRecord {
    /// Create a pending record for a stage.
    pub fn new(id: StageId) -> Self {
        Self {
            id,
            status: StageStatus::Pending,
            expanded: false,
            message: None,
            reasoning: None,
            stats: StageStats::default(),
            started_at: None,
            duration_ms: None,
            items: Vec::new(),
        }
    }

    /// Find the item matching `(url, label)` under the identity rule.
    pub fn find_item_mut(
        &mut self,
        url: Option<&str>,
        label: Option<&str>,
    ) -> Option<&mut StageItem> {
        self.items.iter_mut().find(|item| item.matches(url, label))
    }

    /// Find an item by exact URL.
    pub fn find_item_by_url_mut(&mut self, url: &str) -> Option<&mut StageItem> {
        self.items
            .iter_mut()
            .find(|item| item.url.as_deref() == Some(url))
    }
}

/// One end-to-end discovery run for a single query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySession {
    pub id: Uuid,
    pub query: String,
    pub status: SessionStatus,

    /// Whether the run is ranked against a profile.
    pub personalized: bool,
    pub profile_id: Option<Uuid>,

    /// Derived 0–100 percentage, recomputed from stage statuses after every
    /// operation. Never taken from an event.
    pub overall_progress: f32,

    /// Opportunities found so far. Only increases, except for one
    /// authoritative overwrite on completion.
    pub found_count: u32,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Exactly six records, in fixed pipeline order.
    pub stages: Vec<StageRecord>,
}

impl DiscoverySession {
    /// Create a fresh running session for a query.
    pub fn new(query: impl Into<String>, options: &StartOptions, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            query: query.into(),
            status: SessionStatus::Running,
            personalized: options.personalized,
            profile_id: options.profile_id,
            overall_progress: 0.0,
            found_count: 0,
            started_at: now,
            ended_at: None,
            stages: StageId::ALL.iter().map(|id| StageRecord::new(*id)).collect(),
        }
    }

    /// Stage record by id.
    pub fn stage(&self, id: StageId) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Mutable stage record by id.
    pub fn stage_mut(&mut self, id: StageId) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| s.id == id)
    }

    /// First stage in fixed order that is currently running.
    pub fn active_stage(&self) -> Option<StageId> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::Running)
            .map(|s| s.id)
    }

    /// Whether the pipeline is still producing events.
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Running
    }

    /// Recompute `overall_progress` from stage statuses.
    ///
    /// Clamped to never decrease within a session: a running stage that
    /// drops to `Error` must not pull the bar backwards.
    pub fn recompute_progress(&mut self) {
        let complete = self
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Complete)
            .count() as f32;
        let running = self
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Running)
            .count() as f32;
        let progress = 100.0 * (complete + 0.5 * running) / StageId::ALL.len() as f32;
        if progress > self.overall_progress {
            self.overall_progress = progress;
        }
    }
}
