//! Discovery progress stream client
//!
//! Subscribes to the platform's multi-stage web-discovery pipeline (query
//! generation → web search → semantic filtering → parallel crawl → AI
//! extraction → database sync) over a single long-lived SSE stream and
//! reconstructs a consistent, deduplicated, resumable view of per-stage
//! progress.
//!
//! The transport is assumed unreliable: events may arrive duplicated or
//! out of order, two backend vocabularies coexist on the same stream, and
//! connections drop. Every event is normalized into a canonical operation
//! and folded through a pure reducer, so replays are idempotent and the
//! session always reaches a terminal state — via a real completion event,
//! the hard timeout, or an exhausted retry budget.
//!
//! # Example
//!
//! ```rust,ignore
//! use discovery_stream::{DiscoveryTracker, StartOptions, TrackerConfig};
//!
//! let tracker = DiscoveryTracker::new(
//!     TrackerConfig::new("https://api.campuslink.dev/streams/discovery"),
//! );
//! tracker.on_item_found(|item| println!("found: {}", item.label));
//! tracker.on_complete(|count| println!("done, {count} opportunities"));
//! tracker.start("robotics summer camps near minneapolis", StartOptions::default());
//! ```
//!
//! # Modules
//!
//! - [`events`] - Wire contract (the two inbound event vocabularies)
//! - [`normalize`] - Event → canonical operation mapping and stage inference
//! - [`reducer`] - Pure fold owning every session invariant
//! - [`session`] - Session, stage, and item state
//! - [`snapshot`] - Persistence with staleness-aware restore
//! - [`transport`] - SSE decoding, connection seam, retry state
//! - [`tracker`] - The public facade

pub mod config;
pub mod error;
pub mod events;
pub mod normalize;
pub mod reducer;
pub mod session;
pub mod snapshot;
pub mod tracker;
pub mod transport;

// Re-export core types at crate root
pub use config::{StartOptions, TrackerConfig};
pub use error::{DiscoveryError, Result};
pub use events::InboundEvent;
pub use normalize::{ItemUpdate, StageOp};
pub use reducer::Effect;
pub use session::{
    DiscoverySession, ItemStatus, SessionStatus, StageId, StageItem, StageRecord, StageStats,
    StageStatus,
};
pub use snapshot::SnapshotStore;
pub use tracker::DiscoveryTracker;
pub use transport::{
    ByteStream, ConnectionPhase, DiscoveryEventStream, EventStreamConnector, HttpConnector,
    RetryState,
};
