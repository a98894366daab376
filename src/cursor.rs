//! Incremental sync filters derived from already-collected records.
//!
//! The watermark is never stored on its own: it is the largest "last updated"
//! value among raw records of the resource in the given scope. Filters are
//! always "at or after" the watermark; a few current records get re-fetched
//! each run and the idempotent upsert absorbs them.

use anyhow::Result;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tracing::debug;

use crate::fetch::Query;
use crate::model::ResourceType;
use crate::store::RawStore;

/// Ordering clause every Jira issue query carries, filtered or not.
pub const JIRA_ISSUE_ORDER: &str = "ORDER BY updated ASC";

/// Widest west-of-UTC offset a Jira profile timezone can have.
const JQL_ZONE_MARGIN_HOURS: i64 = 12;

/// Server-side filter for the next collection of `resource` in `scope`, or
/// `None` for a full fetch.
pub async fn compute_filter(
    store: &dyn RawStore,
    resource: ResourceType,
    scope: u64,
    force_all: bool,
) -> Result<Option<Query>> {
    if force_all {
        debug!(%resource, scope, "full resync requested");
        return Ok(None);
    }
    if resource.updated_pointer().is_none() {
        return Ok(None);
    }
    let Some(watermark) = store.find_max_updated(resource, Some(scope)).await? else {
        debug!(%resource, scope, "no watermark, first run");
        return Ok(None);
    };
    let filter = filter_for(resource, watermark);
    debug!(%resource, scope, %watermark, ?filter, "incremental filter");
    Ok(filter)
}

/// Query parameters selecting records updated at or after `watermark`.
pub fn filter_for(resource: ResourceType, watermark: DateTime<Utc>) -> Option<Query> {
    match resource {
        // JQL literals are minute-precision and read in the searching user's
        // profile timezone. Stepping back by the widest west offset keeps the
        // bound at or before the watermark in every zone.
        ResourceType::JiraIssue => Some(vec![(
            "jql".to_string(),
            format!(
                "updated >= '{}' {JIRA_ISSUE_ORDER}",
                (watermark - Duration::hours(JQL_ZONE_MARGIN_HOURS)).format("%Y/%m/%d %H:%M")
            ),
        )]),
        ResourceType::GitlabMergeRequest => Some(vec![(
            "updated_after".to_string(),
            watermark.to_rfc3339_opts(SecondsFormat::Secs, true),
        )]),
        ResourceType::GitlabCommit => Some(vec![(
            "since".to_string(),
            watermark.to_rfc3339_opts(SecondsFormat::Secs, true),
        )]),
        // Boards have no watermark; changelogs are gated per parent issue.
        ResourceType::JiraBoard | ResourceType::JiraChangelog => None,
    }
}
