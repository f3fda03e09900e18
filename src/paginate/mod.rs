//! Pagination adapters over the HTTP core.
//!
//! Three interchangeable walk styles: offset/limit, cursor/next-link and
//! WebEnv history (PubMed). Each yields pages of record-shaped JSON values
//! until the upstream is exhausted or a configured cap is reached. Paginators
//! are forward-only; restarting means constructing a new instance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::net::client::items_array_key;
use crate::net::{ApiClient, ApiError};

/// Pick the items array out of a response envelope. The `items_key` hint wins;
/// otherwise the first array-valued key that is not `page_meta` is used.
pub fn extract_items(payload: &Value, items_key: Option<&str>) -> Vec<Value> {
    let key = match items_key {
        Some(key) => Some(key.to_string()),
        None => items_array_key(payload),
    };
    match key {
        Some(key) => payload
            .get(&key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        None => Vec::new(),
    }
}

/// Offset/limit walk: stops on a short page or at `page_limit`.
pub struct OffsetPaginator {
    client: Arc<ApiClient>,
    endpoint: String,
    params: Vec<(String, String)>,
    page_size: usize,
    page_limit: Option<usize>,
    items_key: Option<String>,
    offset: usize,
    pages: usize,
    done: bool,
}

impl OffsetPaginator {
    pub fn new(
        client: Arc<ApiClient>,
        endpoint: impl Into<String>,
        params: Vec<(String, String)>,
        page_size: usize,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            params,
            page_size: page_size.max(1),
            page_limit: None,
            items_key: None,
            offset: 0,
            pages: 0,
            done: false,
        }
    }

    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = Some(page_limit);
        self
    }

    pub fn with_items_key(mut self, items_key: impl Into<String>) -> Self {
        self.items_key = Some(items_key.into());
        self
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, ApiError> {
        if self.done || self.page_limit.is_some_and(|cap| self.pages >= cap) {
            return Ok(None);
        }
        let mut params = self.params.clone();
        params.push(("offset".to_string(), self.offset.to_string()));
        params.push(("limit".to_string(), self.page_size.to_string()));

        let payload = self.client.get(&self.endpoint, &params).await?;
        let items = extract_items(&payload, self.items_key.as_deref());
        self.pages += 1;
        self.offset += self.page_size;
        if items.len() < self.page_size {
            self.done = true;
        }
        if items.is_empty() && self.done {
            return Ok(None);
        }
        Ok(Some(items))
    }

    pub async fn collect(mut self, limit: Option<usize>) -> Result<Vec<Value>, ApiError> {
        let mut out: Vec<Value> = Vec::new();
        while let Some(page) = self.next_page().await? {
            out.extend(page);
            if let Some(cap) = limit {
                if out.len() >= cap {
                    out.truncate(cap);
                    break;
                }
            }
        }
        Ok(out)
    }
}

/// Cursor walk following the server-provided `page_meta.next` link. The first
/// request carries the initial params; follow-ups send none because the next
/// URL already embeds them.
pub struct CursorPaginator {
    client: Arc<ApiClient>,
    next: Option<String>,
    initial_params: Vec<(String, String)>,
    first: bool,
    page_limit: Option<usize>,
    items_key: Option<String>,
    pages: usize,
}

impl CursorPaginator {
    pub fn new(
        client: Arc<ApiClient>,
        endpoint: impl Into<String>,
        params: Vec<(String, String)>,
    ) -> Self {
        Self {
            client,
            next: Some(endpoint.into()),
            initial_params: params,
            first: true,
            page_limit: None,
            items_key: None,
            pages: 0,
        }
    }

    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = Some(page_limit);
        self
    }

    pub fn with_items_key(mut self, items_key: impl Into<String>) -> Self {
        self.items_key = Some(items_key.into());
        self
    }

    fn next_link(payload: &Value) -> Option<String> {
        payload
            .get("page_meta")
            .and_then(|meta| meta.get("next"))
            .and_then(Value::as_str)
            .filter(|link| !link.is_empty())
            .map(|link| link.to_string())
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, ApiError> {
        let Some(target) = self.next.clone() else {
            return Ok(None);
        };
        if self.page_limit.is_some_and(|cap| self.pages >= cap) {
            return Ok(None);
        }
        let params = if self.first {
            self.initial_params.clone()
        } else {
            Vec::new()
        };
        let payload = self.client.get(&target, &params).await?;
        self.first = false;
        self.pages += 1;
        self.next = Self::next_link(&payload);
        let items = extract_items(&payload, self.items_key.as_deref());
        if items.is_empty() && self.next.is_none() {
            return Ok(None);
        }
        Ok(Some(items))
    }

    pub async fn collect(mut self, limit: Option<usize>) -> Result<Vec<Value>, ApiError> {
        let mut out: Vec<Value> = Vec::new();
        while let Some(page) = self.next_page().await? {
            out.extend(page);
            if let Some(cap) = limit {
                if out.len() >= cap {
                    out.truncate(cap);
                    break;
                }
            }
        }
        Ok(out)
    }
}

/// Parser applied to each WebEnv history page body (PubMed XML).
pub type PageParser = Arc<dyn Fn(&str) -> Result<Vec<Value>, ApiError> + Send + Sync>;

/// History state captured by the initial `esearch` call.
#[derive(Debug, Clone)]
pub struct WebEnvSession {
    pub webenv: String,
    pub query_key: String,
    pub total_count: usize,
    pub id_list: Vec<String>,
}

/// PubMed-style WebEnv history walk: one `esearch` stores the server-side
/// result set, then `retstart` advances in `retmax` steps. Transient errors
/// retry the page range as one unit inside the HTTP core.
pub struct WebEnvPaginator {
    client: Arc<ApiClient>,
    search_endpoint: String,
    fetch_endpoint: String,
    search_params: Vec<(String, String)>,
    fetch_params: Vec<(String, String)>,
    batch_size: usize,
    parser: PageParser,
    session: Option<WebEnvSession>,
    retstart: usize,
    deadline: Option<Instant>,
    wall_clock_cap: Duration,
}

impl WebEnvPaginator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<ApiClient>,
        search_endpoint: impl Into<String>,
        fetch_endpoint: impl Into<String>,
        search_params: Vec<(String, String)>,
        fetch_params: Vec<(String, String)>,
        batch_size: usize,
        wall_clock_cap: Duration,
        parser: PageParser,
    ) -> Self {
        Self {
            client,
            search_endpoint: search_endpoint.into(),
            fetch_endpoint: fetch_endpoint.into(),
            search_params,
            fetch_params,
            batch_size: batch_size.max(1),
            parser,
            session: None,
            retstart: 0,
            deadline: None,
            wall_clock_cap,
        }
    }

    /// Issue the `esearch` call and capture the history session.
    pub async fn start(&mut self) -> Result<&WebEnvSession, ApiError> {
        if self.session.is_none() {
            let mut params = self.search_params.clone();
            params.push(("usehistory".to_string(), "y".to_string()));
            params.push(("retmode".to_string(), "json".to_string()));
            let payload = self.client.get(&self.search_endpoint, &params).await?;
            let result = payload
                .get("esearchresult")
                .ok_or_else(|| ApiError::Decode("esearch response missing esearchresult".into()))?;
            let session = WebEnvSession {
                webenv: string_field(result, "webenv")?,
                query_key: string_field(result, "querykey")?,
                total_count: string_field(result, "count")?
                    .parse()
                    .map_err(|_| ApiError::Decode("esearch count is not numeric".into()))?,
                id_list: result
                    .get("idlist")
                    .and_then(Value::as_array)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(Value::as_str)
                            .map(|s| s.to_string())
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            debug!(
                count = session.total_count,
                webenv = %session.webenv,
                "webenv_session_started"
            );
            self.session = Some(session);
            self.deadline = Some(Instant::now() + self.wall_clock_cap);
        }
        Ok(self.session.as_ref().expect("session just set"))
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, ApiError> {
        self.start().await?;
        let session = self.session.clone().expect("session started");
        if self.retstart >= session.total_count {
            return Ok(None);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ApiError::Timeout("webenv walk exceeded wall-clock cap".into()));
            }
        }

        let mut params = self.fetch_params.clone();
        params.push(("WebEnv".to_string(), session.webenv.clone()));
        params.push(("query_key".to_string(), session.query_key.clone()));
        params.push(("retstart".to_string(), self.retstart.to_string()));
        params.push(("retmax".to_string(), self.batch_size.to_string()));

        let payload = self.client.get(&self.fetch_endpoint, &params).await?;
        self.retstart += self.batch_size;

        let body = match &payload {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let records = (self.parser)(&body)?;
        Ok(Some(records))
    }

    pub async fn collect(mut self, limit: Option<usize>) -> Result<Vec<Value>, ApiError> {
        let mut out: Vec<Value> = Vec::new();
        while let Some(page) = self.next_page().await? {
            out.extend(page);
            if let Some(cap) = limit {
                if out.len() >= cap {
                    out.truncate(cap);
                    break;
                }
            }
        }
        Ok(out)
    }
}

fn string_field(value: &Value, field: &str) -> Result<String, ApiError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError::Decode(format!("esearch response missing {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpProfile;
    use crate::net::testing::{json_ok, MockTransport};

    fn client(transport: Arc<MockTransport>) -> Arc<ApiClient> {
        let mut profile = HttpProfile::default();
        profile.max_calls = 1000;
        profile.retry.total = 0;
        Arc::new(ApiClient::new("test", "http://api", &profile, transport))
    }

    #[tokio::test]
    async fn test_offset_stops_on_short_page() {
        let transport = Arc::new(MockTransport::new(vec![
            json_ok(r#"{"items": [1, 2]}"#),
            json_ok(r#"{"items": [3]}"#),
        ]));
        let paginator =
            OffsetPaginator::new(client(transport.clone()), "/list", Vec::new(), 2);
        let items = paginator.collect(None).await.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_offset_honours_page_limit_and_row_limit() {
        let transport = Arc::new(MockTransport::new(vec![
            json_ok(r#"{"items": [1, 2]}"#),
            json_ok(r#"{"items": [3, 4]}"#),
            json_ok(r#"{"items": [5, 6]}"#),
        ]));
        let paginator = OffsetPaginator::new(client(transport.clone()), "/list", Vec::new(), 2)
            .with_page_limit(2);
        let items = paginator.collect(Some(3)).await.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_cursor_follows_next_link_without_params() {
        let transport = Arc::new(MockTransport::new(vec![
            json_ok(
                r#"{"activities": [{"activity_id": 1}], "page_meta": {"next": "http://api/activity.json?offset=1"}}"#,
            ),
            json_ok(r#"{"activities": [{"activity_id": 2}], "page_meta": {"next": null}}"#),
        ]));
        let paginator = CursorPaginator::new(
            client(transport.clone()),
            "/activity.json",
            vec![("activity_id__in".to_string(), "1,2".to_string())],
        );
        let items = paginator.collect(None).await.unwrap();
        assert_eq!(items.len(), 2);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].params.is_empty());
        assert!(requests[1].params.is_empty());
        assert_eq!(requests[1].url, "http://api/activity.json?offset=1");
    }

    #[tokio::test]
    async fn test_webenv_walks_retstart_to_count() {
        let transport = Arc::new(MockTransport::new(vec![
            json_ok(
                r#"{"esearchresult": {"webenv": "WE1", "querykey": "1", "count": "3", "idlist": ["10", "11", "12"]}}"#,
            ),
            json_ok(r#""<page>1</page>""#),
            json_ok(r#""<page>2</page>""#),
        ]));
        let parser: PageParser = Arc::new(|body: &str| {
            Ok(vec![Value::String(body.to_string())])
        });
        let paginator = WebEnvPaginator::new(
            client(transport.clone()),
            "/esearch.fcgi",
            "/efetch.fcgi",
            vec![("db".to_string(), "pubmed".to_string())],
            vec![("db".to_string(), "pubmed".to_string())],
            2,
            Duration::from_secs(30),
            parser,
        );
        let records = paginator.collect(None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(transport.calls(), 3);

        let requests = transport.requests();
        let retstarts: Vec<&str> = requests[1..]
            .iter()
            .map(|r| {
                r.params
                    .iter()
                    .find(|(k, _)| k == "retstart")
                    .map(|(_, v)| v.as_str())
                    .unwrap()
            })
            .collect();
        assert_eq!(retstarts, vec!["0", "2"]);
    }

    #[test]
    fn test_items_heuristic_skips_page_meta() {
        let payload: Value = serde_json::from_str(
            r#"{"page_meta": [1], "assays": [{"assay_chembl_id": "CHEMBL1"}]}"#,
        )
        .unwrap();
        assert_eq!(extract_items(&payload, None).len(), 1);
        assert_eq!(extract_items(&payload, Some("missing")).len(), 0);
    }
}
