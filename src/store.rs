//! Storage contracts for raw and canonical records.
//!
//! Both stores are keyed by `(resource, natural_id)` and only ever upsert:
//! applying the same record twice leaves the same stored state. Each upsert
//! must be atomic on its own; callers never need cross-record locking.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::model::{CanonicalRecord, RawRecord, ResourceType, UpsertOutcome};

#[async_trait]
pub trait RawStore: Send + Sync {
    /// Largest "last updated" value among records of `resource`, optionally
    /// restricted to records associated with `scope`.
    async fn find_max_updated(
        &self,
        resource: ResourceType,
        scope: Option<u64>,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Insert or update by natural id. `record.scopes` are merged into the
    /// stored association set, never replacing it.
    async fn upsert(&self, record: &RawRecord) -> Result<UpsertOutcome>;

    /// Forward-only cursor over every record of `resource` (optionally within
    /// `scope`), ordered by natural id. Pages through the store lazily.
    fn stream_all(
        &self,
        resource: ResourceType,
        scope: Option<u64>,
    ) -> BoxStream<'_, Result<RawRecord>>;

    async fn get(&self, resource: ResourceType, natural_id: &str) -> Result<Option<RawRecord>>;

    async fn count(&self, resource: ResourceType) -> Result<i64>;

    /// Parent `updated_at` recorded when the `child` fan-out for `parent_id` last completed.
    async fn fan_out_mark(
        &self,
        child: ResourceType,
        parent_id: &str,
    ) -> Result<Option<Option<DateTime<Utc>>>>;

    async fn set_fan_out_mark(
        &self,
        child: ResourceType,
        parent_id: &str,
        parent_updated_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

#[async_trait]
pub trait EnrichedStore: Send + Sync {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<UpsertOutcome>;

    async fn get(&self, resource: ResourceType, natural_id: &str)
        -> Result<Option<CanonicalRecord>>;

    async fn count(&self, resource: ResourceType) -> Result<i64>;
}
