use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Remote system a resource is collected from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Jira,
    Gitlab,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Jira => "jira",
            Source::Gitlab => "gitlab",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    JiraBoard,
    JiraIssue,
    JiraChangelog,
    GitlabCommit,
    GitlabMergeRequest,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::JiraBoard,
        ResourceType::JiraIssue,
        ResourceType::JiraChangelog,
        ResourceType::GitlabCommit,
        ResourceType::GitlabMergeRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::JiraBoard => "jira_board",
            ResourceType::JiraIssue => "jira_issue",
            ResourceType::JiraChangelog => "jira_changelog",
            ResourceType::GitlabCommit => "gitlab_commit",
            ResourceType::GitlabMergeRequest => "gitlab_merge_request",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }

    pub fn source(&self) -> Source {
        match self {
            ResourceType::JiraBoard | ResourceType::JiraIssue | ResourceType::JiraChangelog => {
                Source::Jira
            }
            ResourceType::GitlabCommit | ResourceType::GitlabMergeRequest => Source::Gitlab,
        }
    }

    /// JSON pointer to the remote identifier inside a raw payload.
    pub fn id_pointer(&self) -> &'static str {
        "/id"
    }

    /// JSON pointer to the "last updated" timestamp used as the sync watermark.
    pub fn updated_pointer(&self) -> Option<&'static str> {
        match self {
            ResourceType::JiraBoard => None,
            ResourceType::JiraIssue => Some("/fields/updated"),
            ResourceType::JiraChangelog => Some("/created"),
            ResourceType::GitlabCommit => Some("/committed_date"),
            ResourceType::GitlabMergeRequest => Some("/updated_at"),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown resource type: {s}"))
    }
}

/// A source document as stored in the raw store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub resource: ResourceType,
    pub natural_id: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub payload: Value,
    /// Parent scopes this record was seen under. Merged on upsert, never replaced.
    pub scopes: BTreeSet<u64>,
}

impl RawRecord {
    /// Build a record from a remote payload, reading its natural id and
    /// watermark timestamp. Returns `None` when the payload carries no id.
    pub fn from_payload(resource: ResourceType, payload: Value, scope: u64) -> Option<Self> {
        let natural_id = natural_id(payload.pointer(resource.id_pointer())?)?;
        let updated_at = resource
            .updated_pointer()
            .and_then(|p| payload.pointer(p))
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
        Some(Self {
            resource,
            natural_id,
            updated_at,
            payload,
            scopes: BTreeSet::from([scope]),
        })
    }
}

/// Remote ids arrive as JSON strings (Jira, commit SHAs) or numbers (GitLab).
fn natural_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Flat projection of a raw record. Absent source fields are simply missing
/// from `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub resource: ResourceType,
    pub natural_id: String,
    pub domain_id: String,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Parse the timestamp shapes the remote APIs emit: RFC3339 (GitLab) and
/// Jira's `2021-05-06T10:11:12.000+0800`.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Fixed-width text form used for storage so that lexical order matches time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
