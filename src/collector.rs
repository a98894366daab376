//! Per-resource collection: watermark, pagination, raw upserts.
//!
//! A run for one `(resource, scope)` pages through the remote list strictly in
//! order and upserts every item as it arrives. Detail resources (changelogs)
//! fan out over the parents already stored for the scope, with a bounded
//! number of parents in flight; one parent failing never cancels the others.

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::cursor::{self, JIRA_ISSUE_ORDER};
use crate::enrich::{self, EnrichError, EnrichReport};
use crate::fetch::{FetchClient, FetchError, Query};
use crate::model::{RawRecord, ResourceType, Source, UpsertOutcome};
use crate::paginate::{paginate, PageSpec};
use crate::store::{EnrichedStore, RawStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectOptions {
    pub page_size: u32,
    /// Parents whose detail fetches may run at the same time.
    pub fan_out_concurrency: usize,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            fan_out_concurrency: 8,
        }
    }
}

/// Counters for one collection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectReport {
    pub resource: ResourceType,
    pub scope: u64,
    pub fetched: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub parents_visited: u64,
    pub parents_skipped: u64,
}

impl CollectReport {
    pub fn new(resource: ResourceType, scope: u64) -> Self {
        Self {
            resource,
            scope,
            fetched: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            parents_visited: 0,
            parents_skipped: 0,
        }
    }

    fn record(&mut self, outcome: UpsertOutcome) {
        self.fetched += 1;
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    fn absorb(&mut self, child: &CollectReport) {
        self.fetched += child.fetched;
        self.inserted += child.inserted;
        self.updated += child.updated;
        self.unchanged += child.unchanged;
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("collecting {0} requires a non-zero scope id")]
    MissingScope(ResourceType),
    #[error("no {0} connection is configured")]
    SourceNotConfigured(Source),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("raw store error: {0:#}")]
    Store(anyhow::Error),
    #[error("{resource} item in scope {scope} has no usable id")]
    MissingId { resource: ResourceType, scope: u64 },
    #[error("{0} has no paged list endpoint")]
    NotListed(ResourceType),
    #[error("parent id {0:?} is not a numeric scope id")]
    InvalidParentId(String),
    #[error("{} parent fetch(es) failed while collecting {} for scope {}", .failures.len(), .report.resource, .report.scope)]
    PartialFanOut {
        report: CollectReport,
        failures: Vec<FanOutFailure>,
    },
}

/// One parent whose detail collection failed.
#[derive(Debug)]
pub struct FanOutFailure {
    pub parent_id: String,
    pub error: CollectError,
}

/// Parent projection carried through the fan-out.
#[derive(Debug, Clone)]
struct ParentRef {
    id: String,
    updated_at: Option<DateTime<Utc>>,
}

enum ParentVisit {
    Skipped,
    Collected(CollectReport),
}

pub struct Collector<'a> {
    client: &'a FetchClient,
    store: &'a dyn RawStore,
    options: CollectOptions,
}

impl<'a> Collector<'a> {
    pub fn new(client: &'a FetchClient, store: &'a dyn RawStore, options: CollectOptions) -> Self {
        Self {
            client,
            store,
            options,
        }
    }

    /// Collect `resource` for `scope` into the raw store.
    #[instrument(skip_all, fields(run_id = %Uuid::new_v4(), resource = %resource, scope = ?scope, force_all = force_all))]
    pub async fn collect(
        &self,
        resource: ResourceType,
        scope: Option<u64>,
        force_all: bool,
    ) -> Result<CollectReport, CollectError> {
        let scope = match scope {
            Some(scope) if scope != 0 => scope,
            _ => return Err(CollectError::MissingScope(resource)),
        };

        let result = match fan_out_parent(resource) {
            Some(parent) => self.collect_fan_out(parent, resource, scope, force_all).await,
            None if resource == ResourceType::JiraBoard => self.collect_board(scope).await,
            None => self.collect_paged(resource, scope, force_all).await,
        };

        match &result {
            Ok(report) => info!(
                fetched = report.fetched,
                inserted = report.inserted,
                updated = report.updated,
                unchanged = report.unchanged,
                parents_visited = report.parents_visited,
                parents_skipped = report.parents_skipped,
                "collection finished"
            ),
            Err(err) => warn!(error = %err, "collection failed"),
        }
        result
    }

    async fn collect_board(&self, scope: u64) -> Result<CollectReport, CollectError> {
        let resource = ResourceType::JiraBoard;
        let mut report = CollectReport::new(resource, scope);
        let path = format!("agile/1.0/board/{scope}");
        let (board, _): (Value, _) = self.client.fetch_json(&path, &[]).await?;
        let outcome = self.upsert_item(resource, scope, board).await?;
        report.record(outcome);
        Ok(report)
    }

    async fn collect_paged(
        &self,
        resource: ResourceType,
        scope: u64,
        force_all: bool,
    ) -> Result<CollectReport, CollectError> {
        let filter = cursor::compute_filter(self.store, resource, scope, force_all)
            .await
            .map_err(CollectError::Store)?;
        let spec = list_page_spec(resource, scope, filter, self.options.page_size)
            .ok_or(CollectError::NotListed(resource))?;
        let mut report = CollectReport::new(resource, scope);
        self.store_items(resource, scope, paginate(self.client, spec), &mut report)
            .await?;
        Ok(report)
    }

    async fn collect_fan_out(
        &self,
        parent: ResourceType,
        child: ResourceType,
        scope: u64,
        force_all: bool,
    ) -> Result<CollectReport, CollectError> {
        let mut report = CollectReport::new(child, scope);
        let parents = self
            .store
            .stream_all(parent, Some(scope))
            .map_ok(|record| ParentRef {
                id: record.natural_id,
                updated_at: record.updated_at,
            });

        let mut visits = parents
            .map(|parent| async move {
                match parent {
                    Ok(parent) => {
                        let result = self.visit_parent(child, &parent, force_all).await;
                        (Some(parent.id), result)
                    }
                    Err(err) => (None, Err(CollectError::Store(err))),
                }
            })
            .buffer_unordered(self.options.fan_out_concurrency.max(1));

        let mut failures = Vec::new();
        while let Some((parent_id, result)) = visits.next().await {
            match (parent_id, result) {
                (_, Ok(ParentVisit::Skipped)) => report.parents_skipped += 1,
                (_, Ok(ParentVisit::Collected(child_report))) => {
                    report.parents_visited += 1;
                    report.absorb(&child_report);
                }
                (Some(parent_id), Err(error)) => {
                    warn!(parent = %parent_id, error = %error, "detail fetch failed");
                    report.parents_visited += 1;
                    failures.push(FanOutFailure { parent_id, error });
                }
                // The parent listing itself broke; nothing left to fan out over.
                (None, Err(error)) => return Err(error),
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(CollectError::PartialFanOut { report, failures })
        }
    }

    async fn visit_parent(
        &self,
        child: ResourceType,
        parent: &ParentRef,
        force_all: bool,
    ) -> Result<ParentVisit, CollectError> {
        if !force_all {
            let mark = self
                .store
                .fan_out_mark(child, &parent.id)
                .await
                .map_err(CollectError::Store)?;
            if mark.is_some_and(|seen| seen >= parent.updated_at) {
                return Ok(ParentVisit::Skipped);
            }
        }

        let child_scope: u64 = parent
            .id
            .parse()
            .map_err(|_| CollectError::InvalidParentId(parent.id.clone()))?;
        let spec = changelog_page_spec(&parent.id, self.options.page_size);
        let mut report = CollectReport::new(child, child_scope);
        self.store_items(child, child_scope, paginate(self.client, spec), &mut report)
            .await?;

        // Only a fully collected parent is marked; failures are retried next run.
        self.store
            .set_fan_out_mark(child, &parent.id, parent.updated_at)
            .await
            .map_err(CollectError::Store)?;
        Ok(ParentVisit::Collected(report))
    }

    async fn store_items(
        &self,
        resource: ResourceType,
        scope: u64,
        mut items: BoxStream<'_, Result<Value, FetchError>>,
        report: &mut CollectReport,
    ) -> Result<(), CollectError> {
        while let Some(item) = items.try_next().await? {
            let outcome = self.upsert_item(resource, scope, item).await?;
            report.record(outcome);
        }
        Ok(())
    }

    async fn upsert_item(
        &self,
        resource: ResourceType,
        scope: u64,
        item: Value,
    ) -> Result<UpsertOutcome, CollectError> {
        let record = RawRecord::from_payload(resource, item, scope)
            .ok_or(CollectError::MissingId { resource, scope })?;
        self.store.upsert(&record).await.map_err(CollectError::Store)
    }
}

/// Resource whose stored records drive the fan-out for `child`.
fn fan_out_parent(child: ResourceType) -> Option<ResourceType> {
    match child {
        ResourceType::JiraChangelog => Some(ResourceType::JiraIssue),
        _ => None,
    }
}

/// Paged list request for `resource`; `None` for resources fetched another way.
fn list_page_spec(
    resource: ResourceType,
    scope: u64,
    filter: Option<Query>,
    page_size: u32,
) -> Option<PageSpec> {
    let filter = filter.unwrap_or_default();
    let spec = match resource {
        ResourceType::JiraIssue => {
            let query = if filter.is_empty() {
                vec![("jql".to_string(), JIRA_ISSUE_ORDER.to_string())]
            } else {
                filter
            };
            PageSpec::jira(format!("agile/1.0/board/{scope}/issue"), query, "issues", page_size)
        }
        ResourceType::GitlabCommit => {
            let mut query = vec![("with_stats".to_string(), "true".to_string())];
            query.extend(filter);
            PageSpec::gitlab(format!("projects/{scope}/repository/commits"), query, page_size)
        }
        ResourceType::GitlabMergeRequest => {
            let mut query: Query = [
                ("order_by", "updated_at"),
                ("sort", "asc"),
                ("scope", "all"),
                ("state", "all"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
            query.extend(filter);
            PageSpec::gitlab(format!("projects/{scope}/merge_requests"), query, page_size)
        }
        ResourceType::JiraBoard | ResourceType::JiraChangelog => return None,
    };
    Some(spec)
}

fn changelog_page_spec(parent_id: &str, page_size: u32) -> PageSpec {
    PageSpec::jira(
        format!("api/3/issue/{parent_id}/changelog"),
        Vec::new(),
        "values",
        page_size,
    )
}

/// Entry points for one configured deployment: `collect` and `enrich`.
pub struct Pipeline {
    jira: Option<FetchClient>,
    gitlab: Option<FetchClient>,
    raw: Arc<dyn RawStore>,
    enriched: Arc<dyn EnrichedStore>,
    options: CollectOptions,
}

impl Pipeline {
    pub fn new(
        raw: Arc<dyn RawStore>,
        enriched: Arc<dyn EnrichedStore>,
        options: CollectOptions,
    ) -> Self {
        Self {
            jira: None,
            gitlab: None,
            raw,
            enriched,
            options,
        }
    }

    /// Build clients for every configured source.
    pub fn from_config(
        cfg: &Config,
        raw: Arc<dyn RawStore>,
        enriched: Arc<dyn EnrichedStore>,
    ) -> Result<Self, FetchError> {
        let mut pipeline = Self::new(raw, enriched, cfg.collect_options());
        for source in [Source::Jira, Source::Gitlab] {
            if let Some(src) = cfg.source(source) {
                pipeline = pipeline.with_client(source, FetchClient::new(src.fetch_config())?);
            }
        }
        Ok(pipeline)
    }

    pub fn with_client(mut self, source: Source, client: FetchClient) -> Self {
        match source {
            Source::Jira => self.jira = Some(client),
            Source::Gitlab => self.gitlab = Some(client),
        }
        self
    }

    fn client(&self, source: Source) -> Option<&FetchClient> {
        match source {
            Source::Jira => self.jira.as_ref(),
            Source::Gitlab => self.gitlab.as_ref(),
        }
    }

    pub async fn collect(
        &self,
        resource: ResourceType,
        scope: Option<u64>,
        force_all: bool,
    ) -> Result<CollectReport, CollectError> {
        let source = resource.source();
        let client = self
            .client(source)
            .ok_or(CollectError::SourceNotConfigured(source))?;
        Collector::new(client, self.raw.as_ref(), self.options)
            .collect(resource, scope, force_all)
            .await
    }

    pub async fn enrich(&self, resource: ResourceType) -> Result<EnrichReport, EnrichError> {
        enrich::run_enrichment(self.raw.as_ref(), self.enriched.as_ref(), resource).await
    }
}
