//! Event normalizer: one inbound event in, canonical operations out.
//!
//! The reducer only ever sees [`StageOp`]s, so every quirk of the two wire
//! vocabularies is absorbed here. Legacy free-text events are mapped onto
//! the six fixed stages by keyword inference over the event name and
//! message; structured layer events carry an explicit stage id and bypass
//! the heuristics entirely. Once the backend finishes migrating to layer
//! events this module shrinks to the structured arm without the reducer
//! changing at all.

use crate::events::InboundEvent;
use crate::session::{ItemStatus, StageId, StageStats};

/// A canonical, stage-addressed update derived from one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOp {
    /// A stage began running.
    StageStarted {
        stage: StageId,
        message: Option<String>,
    },

    /// Progress on one logical item within a stage.
    ItemProgress { stage: StageId, update: ItemUpdate },

    /// A stage finished.
    StageCompleted {
        stage: StageId,
        message: Option<String>,
        stats: StageStats,
        /// When present, replaces the stage's incremental items with a
        /// finalized label-only list.
        final_labels: Option<Vec<String>>,
    },

    /// An opportunity cleared the full pipeline.
    OpportunityFound {
        url: Option<String>,
        title: String,
        confidence: Option<f32>,
    },

    /// The whole session finished.
    SessionCompleted { count: Option<u32> },

    /// A stage-level error. `stage: None` targets the active stage.
    StageError {
        stage: Option<StageId>,
        message: String,
        diagnostic: bool,
    },

    /// Reasoning annotation. `stage: None` targets the active stage.
    Reasoning {
        stage: Option<StageId>,
        text: String,
    },

    /// Fan-out counters for a stage.
    ParallelStatus {
        stage: StageId,
        completed: u32,
        total: u32,
    },
}

/// Field-wise update for one stage item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    pub url: Option<String>,
    pub label: Option<String>,
    pub status: ItemStatus,
    pub confidence: Option<f32>,
    pub error: Option<String>,
}

/// Infer a stage from free text (an event name or a status message).
///
/// The keyword table is ordered: earlier stages win ties, and the crawl
/// vocabulary deliberately claims "analyz" because the legacy backend
/// described page reads as "Analyzing <url>".
pub fn infer_stage(text: &str) -> Option<StageId> {
    let lower = text.to_lowercase();
    const KEYWORDS: [(&str, StageId); 18] = [
        ("plan", StageId::QueryGeneration),
        ("query", StageId::QueryGeneration),
        ("queries", StageId::QueryGeneration),
        ("generat", StageId::QueryGeneration),
        ("search", StageId::WebSearch),
        ("found", StageId::WebSearch),
        ("filter", StageId::SemanticFiltering),
        ("relevan", StageId::SemanticFiltering),
        ("semantic", StageId::SemanticFiltering),
        ("crawl", StageId::ParallelCrawl),
        ("analyz", StageId::ParallelCrawl),
        ("visit", StageId::ParallelCrawl),
        ("fetch", StageId::ParallelCrawl),
        ("extract", StageId::AiExtraction),
        ("sync", StageId::DatabaseSync),
        ("database", StageId::DatabaseSync),
        ("saving", StageId::DatabaseSync),
        ("stor", StageId::DatabaseSync),
    ];
    KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, stage)| *stage)
}

/// Resolve an explicit layer id from a structured event.
///
/// Structured events are trusted over heuristics; an id this client does
/// not recognize yields `None` and the caller drops the operation.
fn explicit_stage(layer: &str) -> Option<StageId> {
    StageId::from_wire(layer)
}

/// Map one inbound event to zero or more canonical operations.
///
/// Total: unknown shapes and unknown stage ids produce an empty vec, never
/// an error.
pub fn normalize(event: &InboundEvent) -> Vec<StageOp> {
    match event {
        // -------- legacy free-text era --------
        InboundEvent::Plan { message, queries } => {
            let mut ops = vec![StageOp::StageStarted {
                stage: StageId::QueryGeneration,
                message: message.clone(),
            }];
            if let Some(queries) = queries {
                ops.extend(queries.iter().map(|query| StageOp::ItemProgress {
                    stage: StageId::QueryGeneration,
                    update: ItemUpdate {
                        label: Some(query.clone()),
                        status: ItemStatus::Success,
                        ..Default::default()
                    },
                }));
            }
            ops
        }

        InboundEvent::Search { message, query } => {
            let stage = legacy_stage("search", message.as_deref());
            let mut ops = vec![StageOp::StageStarted {
                stage,
                message: message.clone(),
            }];
            if let Some(query) = query {
                ops.push(StageOp::ItemProgress {
                    stage,
                    update: ItemUpdate {
                        label: Some(query.clone()),
                        status: ItemStatus::Running,
                        ..Default::default()
                    },
                });
            }
            ops
        }

        InboundEvent::Found { url, title, message, .. } => {
            let stage = legacy_stage("found", message.as_deref());
            vec![StageOp::ItemProgress {
                stage,
                update: ItemUpdate {
                    url: url.clone(),
                    label: title.clone().or_else(|| url.clone()),
                    status: ItemStatus::Success,
                    ..Default::default()
                },
            }]
        }

        InboundEvent::Analyzing { url, message } => {
            let stage = legacy_stage("analyzing", message.as_deref());
            vec![StageOp::ItemProgress {
                stage,
                update: ItemUpdate {
                    url: url.clone(),
                    label: url.clone().or_else(|| message.clone()),
                    status: ItemStatus::Running,
                    ..Default::default()
                },
            }]
        }

        InboundEvent::Extracted { url, title, message, .. } => {
            let stage = legacy_stage("extracted", message.as_deref());
            vec![StageOp::ItemProgress {
                stage,
                update: ItemUpdate {
                    url: url.clone(),
                    label: title.clone().or_else(|| url.clone()),
                    status: ItemStatus::Success,
                    ..Default::default()
                },
            }]
        }

        // -------- structured layer era --------
        InboundEvent::LayerStart { layer, message } => match explicit_stage(layer) {
            Some(stage) => vec![StageOp::StageStarted {
                stage,
                message: message.clone(),
            }],
            None => Vec::new(),
        },

        InboundEvent::LayerProgress {
            layer,
            url,
            label,
            status,
            confidence,
            error,
        } => match explicit_stage(layer) {
            Some(stage) => {
                let status = match (error, status.as_deref()) {
                    (Some(_), _) => ItemStatus::Failed,
                    (None, Some(s)) => ItemStatus::from_wire(s).unwrap_or(ItemStatus::Running),
                    (None, None) => ItemStatus::Running,
                };
                vec![StageOp::ItemProgress {
                    stage,
                    update: ItemUpdate {
                        url: url.clone(),
                        label: label.clone(),
                        status,
                        confidence: *confidence,
                        error: error.clone(),
                    },
                }]
            }
            None => Vec::new(),
        },

        InboundEvent::LayerComplete {
            layer,
            message,
            completed,
            total,
            matched,
            items,
        } => match explicit_stage(layer) {
            Some(stage) => vec![StageOp::StageCompleted {
                stage,
                message: message.clone(),
                stats: StageStats {
                    completed: *completed,
                    total: *total,
                    matched: *matched,
                },
                final_labels: items.clone(),
            }],
            None => Vec::new(),
        },

        InboundEvent::ParallelStatus {
            layer,
            completed,
            total,
        } => {
            // Fan-out counters come from the crawl workers unless the
            // backend says otherwise.
            let stage = layer
                .as_deref()
                .and_then(explicit_stage)
                .unwrap_or(StageId::ParallelCrawl);
            vec![StageOp::ParallelStatus {
                stage,
                completed: *completed,
                total: *total,
            }]
        }

        InboundEvent::Reasoning { layer, text } => match text {
            Some(text) if !text.is_empty() => vec![StageOp::Reasoning {
                stage: layer.as_deref().and_then(resolve_stage_hint),
                text: text.clone(),
            }],
            _ => Vec::new(),
        },

        // -------- cross-era --------
        InboundEvent::OpportunityFound {
            url,
            title,
            confidence,
        } => {
            let title = title
                .clone()
                .or_else(|| url.clone())
                .unwrap_or_else(|| "Opportunity".to_string());
            vec![StageOp::OpportunityFound {
                url: url.clone(),
                title,
                confidence: *confidence,
            }]
        }

        InboundEvent::Complete { count, .. } | InboundEvent::Done { count } => {
            vec![StageOp::SessionCompleted { count: *count }]
        }

        InboundEvent::Error {
            message,
            layer,
            diagnostic,
        } => vec![StageOp::StageError {
            stage: layer.as_deref().and_then(resolve_stage_hint),
            message: message
                .clone()
                .unwrap_or_else(|| "discovery pipeline error".to_string()),
            diagnostic: *diagnostic,
        }],
    }
}

/// Stage for a legacy event: the event name decides, a message keyword can
/// only fill in when the name resolves nothing.
fn legacy_stage(event_name: &str, message: Option<&str>) -> StageId {
    infer_stage(event_name)
        .or_else(|| message.and_then(infer_stage))
        .unwrap_or(StageId::WebSearch)
}

/// Stage for a free-text layer hint: exact wire id first, keywords second.
fn resolve_stage_hint(layer: &str) -> Option<StageId> {
    StageId::from_wire(layer).or_else(|| infer_stage(layer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_targets_query_generation_with_items() {
        let ops = normalize(&InboundEvent::Plan {
            message: Some("Planning searches".into()),
            queries: Some(vec!["robotics camps mn".into(), "stem summer programs".into()]),
        });
        assert_eq!(ops.len(), 3);
        assert!(matches!(
            ops[0],
            StageOp::StageStarted {
                stage: StageId::QueryGeneration,
                ..
            }
        ));
        assert!(matches!(
            &ops[1],
            StageOp::ItemProgress {
                stage: StageId::QueryGeneration,
                update
            } if update.status == ItemStatus::Success
        ));
    }

    #[test]
    fn analyzing_targets_parallel_crawl_not_extraction() {
        // The legacy backend says "Analyzing <url>" while crawling; the
        // event name must win over any other reading.
        let ops = normalize(&InboundEvent::Analyzing {
            url: Some("https://x.com".into()),
            message: Some("Analyzing https://x.com".into()),
        });
        assert!(matches!(
            &ops[0],
            StageOp::ItemProgress {
                stage: StageId::ParallelCrawl,
                ..
            }
        ));
    }

    #[test]
    fn found_becomes_web_search_success_item() {
        let ops = normalize(&InboundEvent::Found {
            url: Some("https://x.com".into()),
            title: None,
            message: None,
            count: None,
        });
        match &ops[0] {
            StageOp::ItemProgress { stage, update } => {
                assert_eq!(*stage, StageId::WebSearch);
                assert_eq!(update.status, ItemStatus::Success);
                assert_eq!(update.label.as_deref(), Some("https://x.com"));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn layer_events_bypass_heuristics() {
        // "searching" text would map to WebSearch, but the explicit layer
        // id wins.
        let ops = normalize(&InboundEvent::LayerStart {
            layer: "database_sync".into(),
            message: Some("searching for rows to update".into()),
        });
        assert!(matches!(
            ops[0],
            StageOp::StageStarted {
                stage: StageId::DatabaseSync,
                ..
            }
        ));
    }

    #[test]
    fn unknown_layer_is_dropped() {
        let ops = normalize(&InboundEvent::LayerStart {
            layer: "vector_index".into(),
            message: None,
        });
        assert!(ops.is_empty());
    }

    #[test]
    fn layer_progress_error_implies_failed() {
        let ops = normalize(&InboundEvent::LayerProgress {
            layer: "parallel_crawl".into(),
            url: Some("https://x.com".into()),
            label: None,
            status: Some("running".into()),
            confidence: None,
            error: Some("403".into()),
        });
        match &ops[0] {
            StageOp::ItemProgress { update, .. } => {
                assert_eq!(update.status, ItemStatus::Failed);
                assert_eq!(update.error.as_deref(), Some("403"));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn done_and_complete_both_terminate() {
        assert_eq!(
            normalize(&InboundEvent::Done { count: Some(4) }),
            vec![StageOp::SessionCompleted { count: Some(4) }]
        );
        assert_eq!(
            normalize(&InboundEvent::Complete {
                count: None,
                message: None
            }),
            vec![StageOp::SessionCompleted { count: None }]
        );
    }

    #[test]
    fn error_layer_hint_uses_keywords() {
        let ops = normalize(&InboundEvent::Error {
            message: Some("worker crashed".into()),
            layer: Some("crawling pages".into()),
            diagnostic: false,
        });
        assert!(matches!(
            ops[0],
            StageOp::StageError {
                stage: Some(StageId::ParallelCrawl),
                diagnostic: false,
                ..
            }
        ));
    }

    #[test]
    fn stage_inference_keyword_table() {
        assert_eq!(infer_stage("Generating queries"), Some(StageId::QueryGeneration));
        assert_eq!(infer_stage("Searching the web"), Some(StageId::WebSearch));
        assert_eq!(
            infer_stage("Filtering results for relevance"),
            Some(StageId::SemanticFiltering)
        );
        assert_eq!(infer_stage("Crawling 12 pages"), Some(StageId::ParallelCrawl));
        assert_eq!(infer_stage("Extracting details"), Some(StageId::AiExtraction));
        assert_eq!(infer_stage("Saving to database"), Some(StageId::DatabaseSync));
        assert_eq!(infer_stage("warming up"), None);
    }
}
