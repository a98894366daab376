//! Raw to canonical field mapping.
//!
//! `enrich` is a pure projection: each output field reads one JSON pointer from
//! the raw payload. A missing path segment or a `null` leaf leaves the output
//! field out; it is never an error.

use chrono::SecondsFormat;
use futures::TryStreamExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, instrument};

use crate::model::{parse_timestamp, CanonicalRecord, RawRecord, ResourceType, UpsertOutcome};
use crate::store::{EnrichedStore, RawStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Copy,
    /// Any accepted remote timestamp, re-emitted as RFC3339 UTC.
    Timestamp,
    /// Integer seconds to whole minutes.
    SecondsToMinutes,
    /// Array whose elements are each projected through the nested mapping.
    Each(&'static [FieldSpec]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    /// JSON pointer into the raw payload.
    pub path: &'static str,
    pub transform: Transform,
}

const fn copy(name: &'static str, path: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        path,
        transform: Transform::Copy,
    }
}

const fn ts(name: &'static str, path: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        path,
        transform: Transform::Timestamp,
    }
}

const fn minutes(name: &'static str, path: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        path,
        transform: Transform::SecondsToMinutes,
    }
}

const fn each(name: &'static str, path: &'static str, item: &'static [FieldSpec]) -> FieldSpec {
    FieldSpec {
        name,
        path,
        transform: Transform::Each(item),
    }
}

const JIRA_BOARD: &[FieldSpec] = &[
    copy("name", "/name"),
    copy("type", "/type"),
    copy("project_key", "/location/projectKey"),
];

const JIRA_ISSUE: &[FieldSpec] = &[
    copy("key", "/key"),
    copy("title", "/fields/summary"),
    copy("type", "/fields/issuetype/name"),
    copy("status", "/fields/status/name"),
    copy("status_category", "/fields/status/statusCategory/key"),
    copy("priority", "/fields/priority/name"),
    copy("assignee", "/fields/assignee/displayName"),
    copy("creator", "/fields/creator/displayName"),
    copy("parent_key", "/fields/parent/key"),
    ts("created_date", "/fields/created"),
    ts("updated_date", "/fields/updated"),
    ts("resolution_date", "/fields/resolutiondate"),
    minutes("original_estimate_minutes", "/fields/timeoriginalestimate"),
    minutes("time_spent_minutes", "/fields/timespent"),
    minutes("time_remaining_minutes", "/fields/timeestimate"),
];

const JIRA_CHANGELOG_ITEM: &[FieldSpec] = &[
    copy("field", "/field"),
    copy("field_type", "/fieldtype"),
    copy("field_id", "/fieldId"),
    copy("from_id", "/from"),
    copy("from_value", "/fromString"),
    copy("to_id", "/to"),
    copy("to_value", "/toString"),
];

const JIRA_CHANGELOG: &[FieldSpec] = &[
    copy("author_id", "/author/accountId"),
    copy("author_name", "/author/displayName"),
    ts("created_date", "/created"),
    each("items", "/items", JIRA_CHANGELOG_ITEM),
];

const GITLAB_COMMIT: &[FieldSpec] = &[
    copy("sha", "/id"),
    copy("title", "/title"),
    copy("message", "/message"),
    copy("author_name", "/author_name"),
    copy("author_email", "/author_email"),
    ts("authored_date", "/authored_date"),
    copy("committer_name", "/committer_name"),
    ts("committed_date", "/committed_date"),
    copy("additions", "/stats/additions"),
    copy("deletions", "/stats/deletions"),
];

const GITLAB_MERGE_REQUEST: &[FieldSpec] = &[
    copy("iid", "/iid"),
    copy("project_id", "/project_id"),
    copy("title", "/title"),
    copy("description", "/description"),
    copy("state", "/state"),
    copy("source_branch", "/source_branch"),
    copy("target_branch", "/target_branch"),
    copy("author", "/author/username"),
    copy("merge_commit_sha", "/merge_commit_sha"),
    copy("url", "/web_url"),
    ts("created_date", "/created_at"),
    ts("updated_date", "/updated_at"),
    ts("merged_date", "/merged_at"),
    ts("closed_date", "/closed_at"),
];

/// Output fields produced for `resource`.
pub fn mapping(resource: ResourceType) -> &'static [FieldSpec] {
    match resource {
        ResourceType::JiraBoard => JIRA_BOARD,
        ResourceType::JiraIssue => JIRA_ISSUE,
        ResourceType::JiraChangelog => JIRA_CHANGELOG,
        ResourceType::GitlabCommit => GITLAB_COMMIT,
        ResourceType::GitlabMergeRequest => GITLAB_MERGE_REQUEST,
    }
}

/// Stable id of the canonical entity, unique across sources.
pub fn domain_id(resource: ResourceType, natural_id: &str) -> String {
    format!("{}:{}:{}", resource.source(), resource, natural_id)
}

/// Project a raw record into its canonical shape.
pub fn enrich(raw: &RawRecord) -> CanonicalRecord {
    CanonicalRecord {
        resource: raw.resource,
        natural_id: raw.natural_id.clone(),
        domain_id: domain_id(raw.resource, &raw.natural_id),
        fields: project(&raw.payload, mapping(raw.resource)),
    }
}

fn project(value: &Value, specs: &[FieldSpec]) -> Map<String, Value> {
    let mut fields = Map::new();
    for spec in specs {
        if let Some(value) = extract(value, spec) {
            fields.insert(spec.name.to_string(), value);
        }
    }
    fields
}

fn extract(payload: &Value, spec: &FieldSpec) -> Option<Value> {
    let value = payload.pointer(spec.path).filter(|v| !v.is_null())?;
    match spec.transform {
        Transform::Copy => Some(value.clone()),
        Transform::Timestamp => value
            .as_str()
            .and_then(parse_timestamp)
            .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
        Transform::SecondsToMinutes => value.as_i64().map(|secs| Value::from(secs / 60)),
        Transform::Each(item) => value.as_array().map(|elements| {
            elements
                .iter()
                .map(|element| Value::Object(project(element, item)))
                .collect()
        }),
    }
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("raw store error: {0:#}")]
    RawStore(anyhow::Error),
    #[error("enriched store error: {0:#}")]
    EnrichedStore(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichReport {
    pub resource: ResourceType,
    pub scanned: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

/// Map every raw record of `resource` into the enriched store. A fresh call
/// always rescans from the first record.
#[instrument(skip_all, fields(resource = %resource))]
pub async fn run_enrichment(
    raw: &dyn RawStore,
    enriched: &dyn EnrichedStore,
    resource: ResourceType,
) -> Result<EnrichReport, EnrichError> {
    let mut report = EnrichReport {
        resource,
        scanned: 0,
        inserted: 0,
        updated: 0,
        unchanged: 0,
    };
    let mut records = raw.stream_all(resource, None);
    while let Some(record) = records.try_next().await.map_err(EnrichError::RawStore)? {
        let canonical = enrich(&record);
        let outcome = enriched
            .upsert(&canonical)
            .await
            .map_err(EnrichError::EnrichedStore)?;
        report.scanned += 1;
        match outcome {
            UpsertOutcome::Inserted => report.inserted += 1,
            UpsertOutcome::Updated => report.updated += 1,
            UpsertOutcome::Unchanged => report.unchanged += 1,
        }
    }
    info!(
        scanned = report.scanned,
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        "enrichment finished"
    );
    Ok(report)
}
