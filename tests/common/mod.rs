#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use lakesync::db::{self, SqliteStore};
use lakesync::fetch::{FetchClient, FetchConfig, HttpError, HttpRequest, HttpResponse, HttpTransport};
use lakesync::model::parse_timestamp;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, HttpError> + Send + Sync;

/// Transport that records every request and answers through a handler.
#[derive(Clone)]
pub struct FakeRemote {
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
    delay: Duration,
    slow_calls: usize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FakeRemote {
    pub fn new(
        handler: impl Fn(&HttpRequest) -> Result<HttpResponse, HttpError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            requests: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
            slow_calls: 0,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer requests in order; once the script runs out every call gets `200 {}`.
    pub fn scripted(responses: Vec<Result<HttpResponse, HttpError>>) -> Self {
        let script = Mutex::new(VecDeque::from(responses));
        Self::new(move |_| {
            script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json_response(200, json!({}))))
        })
    }

    /// Delay the first `calls` requests by `delay`.
    pub fn slow_first(mut self, calls: usize, delay: Duration) -> Self {
        self.slow_calls = calls;
        self.delay = delay;
        self
    }

    /// Delay every request by `delay`.
    pub fn slow_all(self, delay: Duration) -> Self {
        self.slow_first(usize::MAX, delay)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for FakeRemote {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let index = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() - 1
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if index < self.slow_calls && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = (self.handler)(&request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn json_response(status: u16, body: Value) -> HttpResponse {
    HttpResponse {
        status,
        headers: vec![("Content-Type".into(), "application/json".into())],
        body: serde_json::to_vec(&body).unwrap(),
    }
}

pub fn with_header(mut res: HttpResponse, name: &str, value: impl ToString) -> HttpResponse {
    res.headers.push((name.to_string(), value.to_string()));
    res
}

pub fn query_param(req: &HttpRequest, name: &str) -> Option<String> {
    req.url
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

pub fn fetch_config(host: &str, max_retry: u32) -> FetchConfig {
    FetchConfig {
        host: host.to_string(),
        auth: "Bearer test-token".to_string(),
        proxy: None,
        timeout: Duration::from_secs(1),
        max_retry,
        retry_delay: Duration::from_millis(1),
    }
}

pub fn client(remote: &FakeRemote, host: &str, max_retry: u32) -> FetchClient {
    FetchClient::with_transport(fetch_config(host, max_retry), Arc::new(remote.clone())).unwrap()
}

pub async fn memory_store() -> SqliteStore {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    SqliteStore::new(pool)
}

pub const JIRA_HOST: &str = "https://jira.example/rest/";
pub const GITLAB_HOST: &str = "https://gitlab.example/api/v4/";

pub fn jira_issue(id: u64, updated: &str, summary: &str) -> Value {
    json!({
        "id": id.to_string(),
        "key": format!("LAKE-{id}"),
        "fields": {
            "summary": summary,
            "updated": updated,
            "status": {"name": "In Progress"}
        }
    })
}

/// In-memory Jira board: issue search with JQL watermark filtering, board
/// lookup and per-issue changelogs.
#[derive(Clone, Default)]
pub struct JiraBoard {
    pub issues: Arc<Mutex<Vec<Value>>>,
    pub changelogs: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    /// Issue ids whose changelog endpoint answers with this status.
    pub failing_changelogs: Arc<Mutex<HashMap<String, u16>>>,
    /// `startAt` values that answer with this status.
    pub failing_offsets: Arc<Mutex<HashMap<u64, u16>>>,
    pub issue_status: Arc<Mutex<Option<u16>>>,
    pub seen_changelogs: Arc<Mutex<HashSet<String>>>,
    /// Profile timezone JQL date literals are read in, as seconds east of UTC.
    pub user_utc_offset_secs: Arc<Mutex<i32>>,
}

impl JiraBoard {
    pub fn with_issues(issues: Vec<Value>) -> Self {
        let board = Self::default();
        *board.issues.lock().unwrap() = issues;
        board
    }

    pub fn set_issue(&self, issue: Value) {
        let mut issues = self.issues.lock().unwrap();
        let id = issue["id"].clone();
        match issues.iter_mut().find(|i| i["id"] == id) {
            Some(existing) => *existing = issue,
            None => issues.push(issue),
        }
    }

    pub fn remote(&self, board_id: u64) -> FakeRemote {
        let board = self.clone();
        FakeRemote::new(move |req| Ok(board.handle(board_id, req)))
    }

    fn handle(&self, board_id: u64, req: &HttpRequest) -> HttpResponse {
        let path = req.url.path().to_string();
        if path == format!("/rest/agile/1.0/board/{board_id}") {
            return json_response(200, json!({"id": board_id, "name": "Lake board", "type": "scrum"}));
        }
        if path == format!("/rest/agile/1.0/board/{board_id}/issue") {
            return self.issue_page(req);
        }
        if let Some(issue_id) = path
            .strip_prefix("/rest/api/3/issue/")
            .and_then(|rest| rest.strip_suffix("/changelog"))
        {
            return self.changelog_page(issue_id, req);
        }
        json_response(404, json!({"errorMessages": ["not found"]}))
    }

    fn issue_page(&self, req: &HttpRequest) -> HttpResponse {
        if let Some(status) = *self.issue_status.lock().unwrap() {
            return json_response(status, json!({"errorMessages": ["denied"]}));
        }
        let start: u64 = query_param(req, "startAt").unwrap().parse().unwrap();
        if let Some(status) = self.failing_offsets.lock().unwrap().get(&start) {
            return json_response(*status, json!({"errorMessages": ["boom"]}));
        }
        let max: usize = query_param(req, "maxResults").unwrap().parse().unwrap();
        let offset = *self.user_utc_offset_secs.lock().unwrap();
        let since = query_param(req, "jql").and_then(|jql| jql_since(&jql, offset));

        let mut matching: Vec<Value> = self
            .issues
            .lock()
            .unwrap()
            .iter()
            .filter(|issue| match since {
                Some(since) => updated(issue) >= since,
                None => true,
            })
            .cloned()
            .collect();
        matching.sort_by_key(updated);
        let total = matching.len();
        let page: Vec<Value> = matching.into_iter().skip(start as usize).take(max).collect();
        json_response(
            200,
            json!({"startAt": start, "maxResults": max, "total": total, "issues": page}),
        )
    }

    fn changelog_page(&self, issue_id: &str, req: &HttpRequest) -> HttpResponse {
        self.seen_changelogs.lock().unwrap().insert(issue_id.to_string());
        if let Some(status) = self.failing_changelogs.lock().unwrap().get(issue_id) {
            return json_response(*status, json!({"errorMessages": ["changelog failed"]}));
        }
        let start: usize = query_param(req, "startAt").unwrap().parse().unwrap();
        let max: usize = query_param(req, "maxResults").unwrap().parse().unwrap();
        let values = self
            .changelogs
            .lock()
            .unwrap()
            .get(issue_id)
            .cloned()
            .unwrap_or_default();
        let total = values.len();
        let page: Vec<Value> = values.into_iter().skip(start).take(max).collect();
        json_response(
            200,
            json!({"startAt": start, "maxResults": max, "total": total, "isLast": true, "values": page}),
        )
    }
}

fn updated(issue: &Value) -> DateTime<Utc> {
    issue["fields"]["updated"]
        .as_str()
        .and_then(parse_timestamp)
        .unwrap()
}

/// Parse `updated >= 'YYYY/MM/DD HH:MM' ...` into the bound it expresses for
/// a user `offset_secs` east of UTC.
fn jql_since(jql: &str, offset_secs: i32) -> Option<DateTime<Utc>> {
    let rest = jql.strip_prefix("updated >= '")?;
    let (stamp, _) = rest.split_once('\'')?;
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y/%m/%d %H:%M").ok()?;
    FixedOffset::east_opt(offset_secs)?
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

pub fn changelog_entry(id: u64, created: &str) -> Value {
    json!({
        "id": id.to_string(),
        "author": {"accountId": "acc-1", "displayName": "Ada"},
        "created": created,
        "items": [{"field": "status", "fromString": "To Do", "toString": "Done"}]
    })
}
