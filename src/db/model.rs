//! Row shapes returned by the SQLite repository.
//!
//! Rows keep the stored text columns as-is; conversion into domain records
//! happens in `into_record` so that decoding failures surface as errors.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::model::{parse_timestamp, CanonicalRecord, RawRecord, ResourceType};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawRow {
    pub natural_id: String,
    pub updated_at: Option<String>,
    pub payload: String,
    /// Comma-separated scope ids from `GROUP_CONCAT`.
    pub scopes: Option<String>,
}

impl RawRow {
    pub fn into_record(self, resource: ResourceType) -> Result<RawRecord> {
        let updated_at = self
            .updated_at
            .as_deref()
            .map(|s| {
                parse_timestamp(s)
                    .with_context(|| format!("bad updated_at {s:?} on {resource}/{}", self.natural_id))
            })
            .transpose()?;
        let payload: Value = serde_json::from_str(&self.payload)
            .with_context(|| format!("bad payload on {resource}/{}", self.natural_id))?;
        let scopes = parse_scope_list(self.scopes.as_deref())?;
        Ok(RawRecord {
            resource,
            natural_id: self.natural_id,
            updated_at,
            payload,
            scopes,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CanonicalRow {
    pub natural_id: String,
    pub domain_id: String,
    pub fields: String,
}

impl CanonicalRow {
    pub fn into_record(self, resource: ResourceType) -> Result<CanonicalRecord> {
        let fields: Map<String, Value> = serde_json::from_str(&self.fields)
            .with_context(|| format!("bad fields on {resource}/{}", self.natural_id))?;
        Ok(CanonicalRecord {
            resource,
            natural_id: self.natural_id,
            domain_id: self.domain_id,
            fields,
        })
    }
}

fn parse_scope_list(list: Option<&str>) -> Result<BTreeSet<u64>> {
    let Some(list) = list else {
        return Ok(BTreeSet::new());
    };
    list.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.trim()
                .parse::<u64>()
                .with_context(|| format!("bad scope id {s:?}"))
        })
        .collect()
}
