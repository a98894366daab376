mod common;

use common::{client, json_response, query_param, with_header, FakeRemote, GITLAB_HOST, JIRA_HOST};
use futures::{StreamExt, TryStreamExt};
use lakesync::fetch::FetchError;
use lakesync::paginate::{paginate, PageSpec};
use serde_json::{json, Value};

/// Offset endpoint over `total` numbered items that never returns more than `cap` per page.
fn offset_remote(total: u64, reported_total: u64, cap: u64) -> FakeRemote {
    FakeRemote::new(move |req| {
        let start: u64 = query_param(req, "startAt").unwrap().parse().unwrap();
        let max: u64 = query_param(req, "maxResults").unwrap().parse().unwrap();
        let end = total.min(start + max.min(cap));
        let items: Vec<Value> = (start..end).map(|i| json!({"id": i})).collect();
        Ok(json_response(200, json!({"total": reported_total, "issues": items})))
    })
}

fn offsets(remote: &FakeRemote) -> Vec<String> {
    remote
        .requests()
        .iter()
        .map(|r| query_param(r, "startAt").unwrap())
        .collect()
}

#[tokio::test]
async fn yields_every_item_across_pages() {
    let remote = offset_remote(250, 250, 1000);
    let client = client(&remote, JIRA_HOST, 1);
    let spec = PageSpec::jira("agile/1.0/board/42/issue", Vec::new(), "issues", 100);

    let items: Vec<Value> = paginate(&client, spec).try_collect().await.unwrap();
    assert_eq!(items.len(), 250);
    assert_eq!(items[0]["id"], 0);
    assert_eq!(items[249]["id"], 249);
    assert_eq!(offsets(&remote), vec!["0", "100", "200"]);
}

#[tokio::test]
async fn offset_advances_by_items_returned() {
    // Server silently caps pages at 50 even though 100 were requested.
    let remote = offset_remote(120, 120, 50);
    let client = client(&remote, JIRA_HOST, 1);
    let spec = PageSpec::jira("agile/1.0/board/42/issue", Vec::new(), "issues", 100);

    let items: Vec<Value> = paginate(&client, spec).try_collect().await.unwrap();
    assert_eq!(items.len(), 120);
    assert_eq!(offsets(&remote), vec!["0", "50", "100"]);
}

#[tokio::test]
async fn empty_page_stops_despite_larger_total() {
    let remote = offset_remote(30, 1000, 1000);
    let client = client(&remote, JIRA_HOST, 1);
    let spec = PageSpec::jira("agile/1.0/board/42/issue", Vec::new(), "issues", 20);

    let items: Vec<Value> = paginate(&client, spec).try_collect().await.unwrap();
    assert_eq!(items.len(), 30);
    assert_eq!(offsets(&remote), vec!["0", "20", "30"]);
}

#[tokio::test]
async fn pages_are_fetched_only_as_items_are_consumed() {
    let remote = offset_remote(250, 250, 1000);
    let client = client(&remote, JIRA_HOST, 1);
    let spec = PageSpec::jira("agile/1.0/board/42/issue", Vec::new(), "issues", 100);

    let first: Vec<Result<Value, FetchError>> = paginate(&client, spec).take(5).collect().await;
    assert_eq!(first.len(), 5);
    assert_eq!(remote.request_count(), 1);
}

#[tokio::test]
async fn extra_query_is_sent_with_every_page() {
    let remote = offset_remote(150, 150, 1000);
    let client = client(&remote, JIRA_HOST, 1);
    let query = vec![("jql".to_string(), "ORDER BY updated ASC".to_string())];
    let spec = PageSpec::jira("agile/1.0/board/42/issue", query, "issues", 100);

    let _: Vec<Value> = paginate(&client, spec).try_collect().await.unwrap();
    for req in remote.requests() {
        assert_eq!(query_param(&req, "jql").as_deref(), Some("ORDER BY updated ASC"));
        assert_eq!(query_param(&req, "maxResults").as_deref(), Some("100"));
    }
}

#[tokio::test]
async fn failure_after_first_page_surfaces_after_its_items() {
    let remote = FakeRemote::new(|req| {
        let start: u64 = query_param(req, "startAt").unwrap().parse().unwrap();
        if start == 0 {
            let items: Vec<Value> = (0..10).map(|i| json!({"id": i})).collect();
            Ok(json_response(200, json!({"total": 20, "issues": items})))
        } else {
            Ok(json_response(403, json!({"errorMessages": ["forbidden"]})))
        }
    });
    let client = client(&remote, JIRA_HOST, 3);
    let spec = PageSpec::jira("agile/1.0/board/42/issue", Vec::new(), "issues", 10);

    let results: Vec<Result<Value, FetchError>> = paginate(&client, spec).collect().await;
    assert_eq!(results.len(), 11);
    assert!(results[..10].iter().all(Result::is_ok));
    assert!(matches!(results[10], Err(FetchError::Terminal { status: 403, .. })));
}

#[tokio::test]
async fn missing_items_field_is_a_decode_error() {
    let remote = FakeRemote::new(|_| Ok(json_response(200, json!({"total": 3}))));
    let client = client(&remote, JIRA_HOST, 1);
    let spec = PageSpec::jira("agile/1.0/board/42/issue", Vec::new(), "issues", 10);

    let err = paginate(&client, spec)
        .try_collect::<Vec<Value>>()
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Decode { .. }));
}

fn gitlab_remote(total: usize, send_total: bool) -> FakeRemote {
    FakeRemote::new(move |req| {
        let page: usize = query_param(req, "page").unwrap().parse().unwrap();
        let per_page: usize = query_param(req, "per_page").unwrap().parse().unwrap();
        let items: Vec<Value> = ((page - 1) * per_page..total.min(page * per_page))
            .map(|i| json!({"id": i}))
            .collect();
        let res = json_response(200, Value::Array(items));
        Ok(if send_total {
            with_header(res, "x-total", total)
        } else {
            res
        })
    })
}

#[tokio::test]
async fn page_number_dialect_uses_total_header() {
    let remote = gitlab_remote(45, true);
    let client = client(&remote, GITLAB_HOST, 1);
    let spec = PageSpec::gitlab("projects/3/merge_requests", Vec::new(), 20);

    let items: Vec<Value> = paginate(&client, spec).try_collect().await.unwrap();
    assert_eq!(items.len(), 45);
    let pages: Vec<String> = remote
        .requests()
        .iter()
        .map(|r| query_param(r, "page").unwrap())
        .collect();
    assert_eq!(pages, vec!["1", "2", "3"]);
}

#[tokio::test]
async fn page_number_dialect_without_total_stops_on_short_page() {
    let remote = gitlab_remote(40, false);
    let client = client(&remote, GITLAB_HOST, 1);
    let spec = PageSpec::gitlab("projects/3/repository/commits", Vec::new(), 20);

    let items: Vec<Value> = paginate(&client, spec).try_collect().await.unwrap();
    assert_eq!(items.len(), 40);
    // Two full pages, then an empty third page ends the stream.
    assert_eq!(remote.request_count(), 3);
}
