//! Pure fold from canonical operations into session state.
//!
//! The reducer owns every invariant: fixed stage order, item identity,
//! progress calculation, and counter monotonicity. It is deterministic for
//! a fixed `(session, op, now)` and performs no IO; `now` is injected so
//! tests control the clock.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::normalize::{ItemUpdate, StageOp};
use crate::session::{
    DiscoverySession, ItemStatus, SessionStatus, StageId, StageItem, StageStats, StageStatus,
};

/// Side effects the caller must dispatch after an apply.
///
/// Keeping callbacks out of the reducer keeps the fold pure; the run loop
/// fires them after releasing the session lock.
#[derive(Debug, Clone)]
pub enum Effect {
    /// A new opportunity item landed (deduplicated by item identity).
    ItemFound(StageItem),

    /// The session reached its terminal state, with the final count.
    Completed(u32),
}

/// Fold one operation into the session.
///
/// A session that already completed ignores every further operation; the
/// terminal state is immutable until the session is replaced.
pub fn apply(session: &mut DiscoverySession, op: StageOp, now: DateTime<Utc>) -> Vec<Effect> {
    if session.status == SessionStatus::Complete {
        debug!(?op, "dropping operation for completed session");
        return Vec::new();
    }

    let mut effects = Vec::new();

    match op {
        StageOp::StageStarted { stage, message } => {
            advance_to(session, stage, now);
            if let Some(record) = session.stage_mut(stage) {
                if let Some(message) = message {
                    record.message = Some(message);
                }
            }
        }

        StageOp::ItemProgress { stage, update } => {
            if let Some(record) = session.stage_mut(stage) {
                upsert_item(&mut record.items, update);
            }
        }

        StageOp::StageCompleted {
            stage,
            message,
            stats,
            final_labels,
        } => {
            if let Some(record) = session.stage_mut(stage) {
                record.status = StageStatus::Complete;
                record.expanded = false;
                if let Some(started) = record.started_at {
                    let elapsed = (now - started).num_milliseconds().max(0);
                    record.duration_ms = Some(elapsed as u64);
                }
                record.stats.merge(stats);
                if let Some(message) = message {
                    record.message = Some(message);
                }
                if let Some(labels) = final_labels {
                    record.items = labels
                        .into_iter()
                        .map(|label| StageItem::new(label, ItemStatus::Success))
                        .collect();
                }
            }
        }

        StageOp::OpportunityFound {
            url,
            title,
            confidence,
        } => {
            effects.extend(record_opportunity(session, url, title, confidence));
        }

        StageOp::SessionCompleted { count } => {
            finalize(session, now);
            if let Some(count) = count {
                // The terminal event carries the authoritative total.
                session.found_count = count;
            }
            effects.push(Effect::Completed(session.found_count));
        }

        StageOp::StageError {
            stage,
            message,
            diagnostic,
        } => {
            let target = stage.or_else(|| session.active_stage());
            match target {
                Some(stage) => {
                    if let Some(record) = session.stage_mut(stage) {
                        if diagnostic {
                            record.message = Some(message);
                        } else {
                            record.status = StageStatus::Error;
                            record.message = Some(message);
                        }
                    }
                }
                None => debug!(%message, "stage error with no stage to attach to"),
            }
        }

        StageOp::Reasoning { stage, text } => {
            if let Some(stage) = stage.or_else(|| session.active_stage()) {
                if let Some(record) = session.stage_mut(stage) {
                    record.reasoning = Some(text);
                }
            }
        }

        StageOp::ParallelStatus {
            stage,
            completed,
            total,
        } => {
            if let Some(record) = session.stage_mut(stage) {
                record.stats.merge(StageStats {
                    completed: Some(completed),
                    total: Some(total),
                    matched: None,
                });
            }
        }
    }

    session.recompute_progress();
    effects
}

/// Mark `stage` running and close out everything before it.
///
/// Stages advance monotonically: a start for stage N completes any earlier
/// stage still pending or running, and a stage that already completed is
/// never reopened.
fn advance_to(session: &mut DiscoverySession, stage: StageId, now: DateTime<Utc>) {
    let target_idx = stage.index();

    for record in session.stages.iter_mut() {
        let idx = record.id.index();
        if idx < target_idx {
            if matches!(record.status, StageStatus::Pending | StageStatus::Running) {
                record.status = StageStatus::Complete;
                record.expanded = false;
                if let (Some(started), None) = (record.started_at, record.duration_ms) {
                    let elapsed = (now - started).num_milliseconds().max(0);
                    record.duration_ms = Some(elapsed as u64);
                }
            }
        } else if idx == target_idx && record.status != StageStatus::Complete {
            record.status = StageStatus::Running;
            record.expanded = true;
            if record.started_at.is_none() {
                record.started_at = Some(now);
            }
        }
    }
}

/// Insert or update an item under the identity rule (URL first, label
/// second). Re-applying the same event is a no-op-shaped update, never a
/// duplicate row.
fn upsert_item(items: &mut Vec<StageItem>, update: ItemUpdate) {
    // An update with no identity cannot be deduplicated later; drop it.
    if update.url.is_none() && update.label.is_none() {
        return;
    }

    let existing = items
        .iter_mut()
        .find(|item| item.matches(update.url.as_deref(), update.label.as_deref()));

    match existing {
        Some(item) => {
            // A terminal status never regresses to a live one, so replayed
            // or late "running" updates cannot flicker a finished row.
            if update.status.is_terminal() || !item.status.is_terminal() {
                item.status = update.status;
            }
            if let Some(url) = update.url {
                item.url.get_or_insert(url);
            }
            if let Some(label) = update.label {
                item.label = label;
            }
            if let Some(confidence) = update.confidence {
                item.confidence = Some(confidence.clamp(0.0, 1.0));
            }
            if update.error.is_some() {
                item.error = update.error;
            }
        }
        None => {
            let label = update
                .label
                .or_else(|| update.url.clone())
                .unwrap_or_default();
            let mut item = StageItem::new(label, update.status);
            item.url = update.url;
            item.confidence = update.confidence.map(|c| c.clamp(0.0, 1.0));
            item.error = update.error;
            items.push(item);
        }
    }
}

/// Apply an `opportunity_found`: count it once, reflect it in the crawl
/// stage, and surface it as an extraction item.
fn record_opportunity(
    session: &mut DiscoverySession,
    url: Option<String>,
    title: String,
    confidence: Option<f32>,
) -> Option<Effect> {
    // The crawl row for this URL succeeded, whatever its previous state.
    if let Some(url) = url.as_deref() {
        if let Some(crawl) = session.stage_mut(StageId::ParallelCrawl) {
            if let Some(item) = crawl.find_item_by_url_mut(url) {
                item.status = ItemStatus::Success;
            }
        }
    }

    let extraction = session.stage_mut(StageId::AiExtraction)?;
    if let Some(existing) = extraction.find_item_mut(url.as_deref(), Some(&title)) {
        // The item is already on the board. Count it only if it had not
        // reached success yet; a replayed opportunity_found recounts
        // nothing.
        let newly_found = existing.status != ItemStatus::Success;
        existing.status = ItemStatus::Success;
        existing.label = title;
        if let Some(confidence) = confidence {
            existing.confidence = Some(confidence.clamp(0.0, 1.0));
        }
        if newly_found {
            let found = existing.clone();
            session.found_count += 1;
            return Some(Effect::ItemFound(found));
        }
        return None;
    }

    let mut item = StageItem::new(title, ItemStatus::Success);
    item.url = url;
    item.confidence = confidence.map(|c| c.clamp(0.0, 1.0));
    extraction.items.push(item.clone());
    session.found_count += 1;
    Some(Effect::ItemFound(item))
}

/// Force the session terminal: no stage left running, everything collapsed.
fn finalize(session: &mut DiscoverySession, now: DateTime<Utc>) {
    for record in session.stages.iter_mut() {
        if record.status == StageStatus::Running {
            record.status = StageStatus::Complete;
            if let (Some(started), None) = (record.started_at, record.duration_ms) {
                let elapsed = (now - started).num_milliseconds().max(0);
                record.duration_ms = Some(elapsed as u64);
            }
        }
        record.expanded = false;
    }
    session.status = SessionStatus::Complete;
    session.ended_at = Some(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StartOptions;
    use crate::session::{StageId, StageStats};

    fn session() -> DiscoverySession {
        DiscoverySession::new("robotics camps", &StartOptions::default(), Utc::now())
    }

    fn item_op(stage: StageId, url: Option<&str>, label: Option<&str>, status: ItemStatus) -> StageOp {
        StageOp::ItemProgress {
            stage,
            update: ItemUpdate {
                url: url.map(String::from),
                label: label.map(String::from),
                status,
                ..Default::default()
            },
        }
    }

    #[test]
    fn stage_start_completes_earlier_stages() {
        let mut session = session();
        let now = Utc::now();

        apply(
            &mut session,
            StageOp::StageStarted {
                stage: StageId::WebSearch,
                message: None,
            },
            now,
        );

        let query_gen = session.stage(StageId::QueryGeneration).unwrap();
        assert_eq!(query_gen.status, StageStatus::Complete);
        assert!(!query_gen.expanded);

        let search = session.stage(StageId::WebSearch).unwrap();
        assert_eq!(search.status, StageStatus::Running);
        assert!(search.expanded);
        assert_eq!(search.started_at, Some(now));
    }

    #[test]
    fn completed_stage_is_never_reopened() {
        let mut session = session();
        let now = Utc::now();

        apply(
            &mut session,
            StageOp::StageCompleted {
                stage: StageId::WebSearch,
                message: None,
                stats: StageStats::default(),
                final_labels: None,
            },
            now,
        );
        apply(
            &mut session,
            StageOp::StageStarted {
                stage: StageId::WebSearch,
                message: None,
            },
            now,
        );

        assert_eq!(
            session.stage(StageId::WebSearch).unwrap().status,
            StageStatus::Complete
        );
    }

    #[test]
    fn duplicate_item_progress_yields_one_item() {
        let mut session = session();
        let now = Utc::now();
        let op = item_op(
            StageId::ParallelCrawl,
            Some("https://x.com"),
            None,
            ItemStatus::Running,
        );

        apply(&mut session, op.clone(), now);
        apply(&mut session, op, now);

        assert_eq!(session.stage(StageId::ParallelCrawl).unwrap().items.len(), 1);
    }

    #[test]
    fn item_matched_by_label_when_no_url() {
        let mut session = session();
        let now = Utc::now();

        apply(
            &mut session,
            item_op(StageId::AiExtraction, None, Some("url1"), ItemStatus::Running),
            now,
        );
        apply(
            &mut session,
            item_op(StageId::AiExtraction, None, Some("url1"), ItemStatus::Success),
            now,
        );

        let stage = session.stage(StageId::AiExtraction).unwrap();
        assert_eq!(stage.items.len(), 1);
        assert_eq!(stage.items[0].status, ItemStatus::Success);
    }

    #[test]
    fn terminal_item_status_does_not_regress() {
        let mut session = session();
        let now = Utc::now();

        apply(
            &mut session,
            item_op(StageId::WebSearch, Some("https://x.com"), None, ItemStatus::Success),
            now,
        );
        apply(
            &mut session,
            item_op(StageId::WebSearch, Some("https://x.com"), None, ItemStatus::Running),
            now,
        );

        let stage = session.stage(StageId::WebSearch).unwrap();
        assert_eq!(stage.items[0].status, ItemStatus::Success);
    }

    #[test]
    fn opportunity_found_counts_once() {
        let mut session = session();
        let now = Utc::now();
        let op = StageOp::OpportunityFound {
            url: Some("https://x.com".into()),
            title: "Robotics Camp".into(),
            confidence: Some(0.9),
        };

        let first = apply(&mut session, op.clone(), now);
        let second = apply(&mut session, op, now);

        assert_eq!(session.found_count, 1);
        assert_eq!(first.len(), 1);
        assert!(matches!(first[0], Effect::ItemFound(_)));
        assert!(second.is_empty());
        assert_eq!(session.stage(StageId::AiExtraction).unwrap().items.len(), 1);
    }

    #[test]
    fn opportunity_flips_crawl_item_to_success() {
        let mut session = session();
        let now = Utc::now();

        apply(
            &mut session,
            item_op(
                StageId::ParallelCrawl,
                Some("https://x.com"),
                None,
                ItemStatus::Running,
            ),
            now,
        );
        apply(
            &mut session,
            StageOp::OpportunityFound {
                url: Some("https://x.com".into()),
                title: "Robotics Camp".into(),
                confidence: None,
            },
            now,
        );

        let crawl = session.stage(StageId::ParallelCrawl).unwrap();
        assert_eq!(crawl.items[0].status, ItemStatus::Success);
    }

    #[test]
    fn session_complete_uses_authoritative_count() {
        let mut session = session();
        let now = Utc::now();
        session.found_count = 2;

        let effects = apply(&mut session, StageOp::SessionCompleted { count: Some(7) }, now);

        assert_eq!(session.found_count, 7);
        assert_eq!(session.status, SessionStatus::Complete);
        assert_eq!(session.ended_at, Some(now));
        assert!(matches!(effects[0], Effect::Completed(7)));
    }

    #[test]
    fn session_complete_falls_back_to_running_tally() {
        let mut session = session();
        session.found_count = 2;

        let effects = apply(
            &mut session,
            StageOp::SessionCompleted { count: None },
            Utc::now(),
        );

        assert_eq!(session.found_count, 2);
        assert!(matches!(effects[0], Effect::Completed(2)));
    }

    #[test]
    fn no_operation_mutates_a_completed_session() {
        let mut session = session();
        let now = Utc::now();
        apply(&mut session, StageOp::SessionCompleted { count: Some(1) }, now);

        let effects = apply(
            &mut session,
            StageOp::OpportunityFound {
                url: None,
                title: "late arrival".into(),
                confidence: None,
            },
            now,
        );

        assert!(effects.is_empty());
        assert_eq!(session.found_count, 1);
    }

    #[test]
    fn diagnostic_error_keeps_stage_status() {
        let mut session = session();
        let now = Utc::now();
        apply(
            &mut session,
            StageOp::StageStarted {
                stage: StageId::ParallelCrawl,
                message: None,
            },
            now,
        );

        apply(
            &mut session,
            StageOp::StageError {
                stage: None,
                message: "slow upstream, continuing".into(),
                diagnostic: true,
            },
            now,
        );

        let crawl = session.stage(StageId::ParallelCrawl).unwrap();
        assert_eq!(crawl.status, StageStatus::Running);
        assert_eq!(crawl.message.as_deref(), Some("slow upstream, continuing"));
    }

    #[test]
    fn hard_error_marks_stage_without_terminating() {
        let mut session = session();
        let now = Utc::now();
        apply(
            &mut session,
            StageOp::StageStarted {
                stage: StageId::WebSearch,
                message: None,
            },
            now,
        );

        apply(
            &mut session,
            StageOp::StageError {
                stage: None,
                message: "search provider 500".into(),
                diagnostic: false,
            },
            now,
        );

        assert_eq!(
            session.stage(StageId::WebSearch).unwrap().status,
            StageStatus::Error
        );
        assert_eq!(session.status, SessionStatus::Running);
    }

    #[test]
    fn stage_complete_replaces_items_with_final_labels() {
        let mut session = session();
        let now = Utc::now();
        apply(
            &mut session,
            item_op(StageId::WebSearch, Some("https://a.com"), None, ItemStatus::Running),
            now,
        );

        apply(
            &mut session,
            StageOp::StageCompleted {
                stage: StageId::WebSearch,
                message: None,
                stats: StageStats {
                    completed: Some(2),
                    total: None,
                    matched: None,
                },
                final_labels: Some(vec!["a.com".into(), "b.com".into()]),
            },
            now,
        );

        let stage = session.stage(StageId::WebSearch).unwrap();
        assert_eq!(stage.items.len(), 2);
        assert!(stage.items.iter().all(|i| i.status == ItemStatus::Success));
        assert_eq!(stage.stats.completed, Some(2));
    }

    #[test]
    fn duration_is_stamped_on_completion() {
        let mut session = session();
        let start = Utc::now();
        apply(
            &mut session,
            StageOp::StageStarted {
                stage: StageId::WebSearch,
                message: None,
            },
            start,
        );

        let later = start + chrono::Duration::milliseconds(1500);
        apply(
            &mut session,
            StageOp::StageCompleted {
                stage: StageId::WebSearch,
                message: None,
                stats: StageStats::default(),
                final_labels: None,
            },
            later,
        );

        assert_eq!(
            session.stage(StageId::WebSearch).unwrap().duration_ms,
            Some(1500)
        );
    }

    #[test]
    fn found_count_is_monotonic_across_ops() {
        let mut session = session();
        let now = Utc::now();
        let mut last = 0;

        for i in 0..5 {
            apply(
                &mut session,
                StageOp::OpportunityFound {
                    url: Some(format!("https://x.com/{}", i % 3)),
                    title: format!("Opportunity {}", i % 3),
                    confidence: None,
                },
                now,
            );
            assert!(session.found_count >= last);
            last = session.found_count;
        }
        assert_eq!(session.found_count, 3);
    }
}
