//! Lazy item streams over paged list endpoints.
//!
//! Pages are requested one at a time and only after the consumer has drained
//! the previous page, so at most one request is in flight per stream.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use tracing::debug;

use crate::fetch::{FetchClient, FetchError, Query};

/// How a remote API expresses paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStyle {
    /// Zero-based item offset; total count read from a body field.
    Offset {
        offset_param: &'static str,
        limit_param: &'static str,
        total_field: &'static str,
    },
    /// One-based page number; total count read from a response header.
    PageNumber {
        page_param: &'static str,
        per_page_param: &'static str,
        total_header: &'static str,
    },
}

impl PageStyle {
    pub const JIRA: PageStyle = PageStyle::Offset {
        offset_param: "startAt",
        limit_param: "maxResults",
        total_field: "total",
    };

    pub const GITLAB: PageStyle = PageStyle::PageNumber {
        page_param: "page",
        per_page_param: "per_page",
        total_header: "X-Total",
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSpec {
    pub path: String,
    /// Extra query parameters sent with every page (filters, ordering).
    pub query: Query,
    /// Body field holding the items; `None` when the body is the item array.
    pub items_field: Option<&'static str>,
    pub page_size: u32,
    /// First offset (or page number) to request.
    pub start: u64,
    pub style: PageStyle,
}

impl PageSpec {
    pub fn jira(
        path: impl Into<String>,
        query: Query,
        items_field: &'static str,
        page_size: u32,
    ) -> Self {
        Self {
            path: path.into(),
            query,
            items_field: Some(items_field),
            page_size,
            start: 0,
            style: PageStyle::JIRA,
        }
    }

    pub fn gitlab(path: impl Into<String>, query: Query, page_size: u32) -> Self {
        Self {
            path: path.into(),
            query,
            items_field: None,
            page_size,
            start: 1,
            style: PageStyle::GITLAB,
        }
    }
}

struct Cursor {
    /// Offset or page number of the next request.
    position: u64,
    /// Items consumed so far, counted from the start of the collection.
    offset: u64,
    done: bool,
}

/// Stream every item of a paged endpoint, in page order.
pub fn paginate<'a>(
    client: &'a FetchClient,
    spec: PageSpec,
) -> BoxStream<'a, Result<Value, FetchError>> {
    let offset = match spec.style {
        PageStyle::Offset { .. } => spec.start,
        PageStyle::PageNumber { .. } => spec.start.saturating_sub(1) * u64::from(spec.page_size),
    };
    let cursor = Cursor {
        position: spec.start,
        offset,
        done: false,
    };
    stream::try_unfold((spec, cursor), move |(spec, cursor)| async move {
        if cursor.done {
            return Ok::<_, FetchError>(None);
        }
        let (items, cursor) = next_page(client, &spec, cursor).await?;
        Ok::<_, FetchError>(Some((items, (spec, cursor))))
    })
    .map_ok(|items| stream::iter(items.into_iter().map(Ok::<_, FetchError>)))
    .try_flatten()
    .boxed()
}

async fn next_page(
    client: &FetchClient,
    spec: &PageSpec,
    cursor: Cursor,
) -> Result<(Vec<Value>, Cursor), FetchError> {
    let mut query = spec.query.clone();
    let (position_param, size_param) = match spec.style {
        PageStyle::Offset {
            offset_param,
            limit_param,
            ..
        } => (offset_param, limit_param),
        PageStyle::PageNumber {
            page_param,
            per_page_param,
            ..
        } => (page_param, per_page_param),
    };
    query.push((position_param.to_string(), cursor.position.to_string()));
    query.push((size_param.to_string(), spec.page_size.to_string()));

    let (mut body, res): (Value, _) = client.fetch_json(&spec.path, &query).await?;
    let total = match spec.style {
        PageStyle::Offset { total_field, .. } => body.get(total_field).and_then(Value::as_u64),
        PageStyle::PageNumber { total_header, .. } => res
            .header(total_header)
            .and_then(|v| v.trim().parse::<u64>().ok()),
    };
    let items = match spec.items_field {
        Some(field) => body.get_mut(field).map(Value::take).unwrap_or(Value::Null),
        None => body,
    };
    let items: Vec<Value> = serde_json::from_value(items).map_err(|source| FetchError::Decode {
        path: spec.path.clone(),
        source,
    })?;

    let returned = items.len() as u64;
    let offset = cursor.offset + returned;
    let position = match spec.style {
        PageStyle::Offset { .. } => cursor.position + returned,
        PageStyle::PageNumber { .. } => cursor.position + 1,
    };
    let done = is_last_page(&spec.style, offset, returned, spec.page_size, total);
    debug!(path = %spec.path, offset, returned, total = ?total, done, "page fetched");
    Ok((
        items,
        Cursor {
            position,
            offset,
            done,
        },
    ))
}

/// Stop on an empty page, once `offset` reaches the reported total, or, for
/// page-number endpoints that report no total, on a short page.
fn is_last_page(
    style: &PageStyle,
    offset: u64,
    returned: u64,
    page_size: u32,
    total: Option<u64>,
) -> bool {
    if returned == 0 {
        return true;
    }
    match (total, style) {
        (Some(total), _) => offset >= total,
        (None, PageStyle::PageNumber { .. }) => returned < u64::from(page_size),
        (None, PageStyle::Offset { .. }) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_pages_stop_at_total() {
        let style = PageStyle::JIRA;
        assert!(!is_last_page(&style, 100, 100, 100, Some(250)));
        assert!(!is_last_page(&style, 200, 100, 100, Some(250)));
        assert!(is_last_page(&style, 250, 50, 100, Some(250)));
        // Server capped the page below the requested size; keep going.
        assert!(!is_last_page(&style, 50, 50, 100, Some(250)));
    }

    #[test]
    fn empty_page_always_stops() {
        assert!(is_last_page(&PageStyle::JIRA, 100, 0, 100, Some(250)));
        assert!(is_last_page(&PageStyle::GITLAB, 0, 0, 20, None));
    }

    #[test]
    fn page_number_without_total_stops_on_short_page() {
        let style = PageStyle::GITLAB;
        assert!(!is_last_page(&style, 20, 20, 20, None));
        assert!(is_last_page(&style, 27, 7, 20, None));
        assert!(!is_last_page(&PageStyle::JIRA, 27, 7, 20, None));
    }
}
