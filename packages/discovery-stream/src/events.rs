//! Wire contract for inbound discovery events.
//!
//! The server publishes a unidirectional stream of JSON objects, each with
//! a `type` discriminator. Two vocabularies coexist: legacy free-text
//! events (`plan`, `search`, `found`, ...) from older backends, and
//! structured layer events (`layer_start`, `layer_progress`, ...) that
//! carry an explicit stage id. Both families interleave within a session.
//!
//! Events are immutable and never retained beyond one normalization pass.
//! Unknown `type` values and unknown fields are ignored rather than
//! rejected, so a newer backend cannot break an older client.

use serde::{Deserialize, Serialize};

/// One parsed event from the discovery stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    // ============================================================================
    // Legacy free-text vocabulary
    // ============================================================================
    /// Query plan produced; `queries` lists the generated search queries.
    Plan {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        queries: Option<Vec<String>>,
    },

    /// A web search is being executed.
    Search {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        query: Option<String>,
    },

    /// A candidate result surfaced from search.
    Found {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        count: Option<u32>,
    },

    /// A page is being read by the crawler.
    Analyzing {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },

    /// Structured data came out of a page.
    Extracted {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        count: Option<u32>,
    },

    // ============================================================================
    // Structured layer vocabulary
    // ============================================================================
    /// A pipeline layer began.
    LayerStart {
        layer: String,
        #[serde(default)]
        message: Option<String>,
    },

    /// Progress on one item within a layer.
    LayerProgress {
        layer: String,
        #[serde(default)]
        url: Option<String>,
        #[serde(default, alias = "item")]
        label: Option<String>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        confidence: Option<f32>,
        #[serde(default)]
        error: Option<String>,
    },

    /// A pipeline layer finished.
    LayerComplete {
        layer: String,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        completed: Option<u32>,
        #[serde(default)]
        total: Option<u32>,
        #[serde(default)]
        matched: Option<u32>,
        /// Finalized item labels; replaces the incremental item list.
        #[serde(default)]
        items: Option<Vec<String>>,
    },

    /// Fan-out counters for the parallel crawl workers.
    ParallelStatus {
        #[serde(default)]
        layer: Option<String>,
        completed: u32,
        total: u32,
    },

    /// Model reasoning annotation for a layer.
    Reasoning {
        #[serde(default)]
        layer: Option<String>,
        #[serde(default, alias = "message")]
        text: Option<String>,
    },

    // ============================================================================
    // Cross-era terminals and signals
    // ============================================================================
    /// An opportunity cleared extraction and matching.
    OpportunityFound {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        confidence: Option<f32>,
    },

    /// Pipeline finished; `count` is the authoritative total.
    Complete {
        #[serde(default)]
        count: Option<u32>,
        #[serde(default)]
        message: Option<String>,
    },

    /// Older spelling of `complete`.
    Done {
        #[serde(default)]
        count: Option<u32>,
    },

    /// Pipeline error. `diagnostic` errors are informational only.
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        layer: Option<String>,
        #[serde(default)]
        diagnostic: bool,
    },
}

/// Decode one stream payload.
///
/// Distinguishes a malformed payload (`Err`) from a well-formed event of a
/// type this client does not know (`Ok(None)`); the latter is dropped
/// silently for forward compatibility.
pub fn decode_payload(payload: &str) -> Result<Option<InboundEvent>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(payload)?;
    Ok(serde_json::from_value(value).ok())
}
