//! Stateful, paginated API collection into raw tables.
//!
//! An [`ApiCollector`] is configured once per `(raw table, params)` and drives
//! the [`RateLimitedFetcher`] across pages and inputs:
//!
//! - page size 0: exactly one request per input;
//! - with a total-pages resolver: page 1 is fetched, the page count resolved,
//!   and the remaining pages join one flat job pool shared by all inputs;
//! - otherwise pages of one input are walked in order until a short page.
//!
//! Every parsed message becomes one raw row. Any error aborts the run and
//! cancels in-flight workers; rows already written stay.

pub mod state;
pub mod template;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CollectorError, FetchError};
use crate::fetcher::{ApiResponse, Headers, Query, RateLimitedFetcher};
use crate::progress::Progress;
use crate::store::{NewRawRow, RawDataArgs, Store};

pub use state::CollectionWindow;
pub use template::{TemplateContext, render_string};

/// Default ceiling on pages per input, whatever the server reports.
pub const DEFAULT_MAX_PAGES: usize = 10_000;

/// Page coordinates for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Pager {
    pub page: usize,
    pub size: usize,
    pub skip: usize,
}

impl Pager {
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            page,
            size,
            skip: page.saturating_sub(1) * size,
        }
    }
}

/// Everything a request builder can see.
#[derive(Debug, Clone)]
pub struct RequestData<I> {
    pub pager: Pager,
    pub params: Value,
    pub input: Option<I>,
    /// Lower time bound for incremental or ranged collection.
    pub since: Option<DateTime<Utc>>,
}

impl<I: Serialize> RequestData<I> {
    fn template_context(&self) -> Result<TemplateContext, CollectorError> {
        let to_value = |v: serde_json::Result<Value>| {
            v.map_err(|e| CollectorError::Template {
                message: e.to_string(),
            })
        };
        Ok(TemplateContext {
            params: self.params.clone(),
            input: match &self.input {
                Some(input) => to_value(serde_json::to_value(input))?,
                None => Value::Null,
            },
            pager: to_value(serde_json::to_value(self.pager))?,
        })
    }
}

pub type UrlFn<I> = Arc<dyn Fn(&RequestData<I>) -> Result<String, CollectorError> + Send + Sync>;
pub type QueryFn<I> = Arc<dyn Fn(&RequestData<I>) -> Result<Query, CollectorError> + Send + Sync>;
pub type HeaderFn<I> =
    Arc<dyn Fn(&RequestData<I>) -> Result<Headers, CollectorError> + Send + Sync>;
pub type ResponseParser =
    Arc<dyn Fn(&ApiResponse) -> Result<Vec<Value>, CollectorError> + Send + Sync>;
pub type TotalPagesFn<I> =
    Arc<dyn Fn(&ApiResponse, &RequestData<I>) -> Result<usize, CollectorError> + Send + Sync>;

/// Request path, relative to the connection endpoint.
pub enum UrlTemplate<I> {
    /// `{{ params.x }}` / `{{ input.y }}` / `{{ pager.page }}` pattern.
    Pattern(String),
    Func(UrlFn<I>),
}

impl<I> UrlTemplate<I> {
    pub fn pattern(pattern: impl Into<String>) -> Self {
        UrlTemplate::Pattern(pattern.into())
    }

    pub fn func(
        f: impl Fn(&RequestData<I>) -> Result<String, CollectorError> + Send + Sync + 'static,
    ) -> Self {
        UrlTemplate::Func(Arc::new(f))
    }
}

impl<I> Clone for UrlTemplate<I> {
    fn clone(&self) -> Self {
        match self {
            UrlTemplate::Pattern(p) => UrlTemplate::Pattern(p.clone()),
            UrlTemplate::Func(f) => UrlTemplate::Func(Arc::clone(f)),
        }
    }
}

/// Parse a body that is a bare JSON array.
pub fn parse_json_array(response: &ApiResponse) -> Result<Vec<Value>, CollectorError> {
    parse_json_field(response, None)
}

/// Parse the array found at `field` (a JSON pointer like `/data/items`), or
/// the whole body when `field` is `None`.
pub fn parse_json_field(
    response: &ApiResponse,
    field: Option<&str>,
) -> Result<Vec<Value>, CollectorError> {
    let body: Value = response
        .json()
        .map_err(|e| CollectorError::MalformedResponse {
            url: response.url.clone(),
            message: e.to_string(),
        })?;
    let target = match field {
        Some(pointer) => body.pointer(pointer).cloned().unwrap_or(Value::Null),
        None => body,
    };
    match target {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(CollectorError::MalformedResponse {
            url: response.url.clone(),
            message: format!("expected an array, got {}", json_kind(&other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Counters reported after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    pub requests: usize,
    pub rows: usize,
    pub incremental: bool,
}

/// Paginated collector for one raw table and params combination.
pub struct ApiCollector<I> {
    raw: RawDataArgs,
    fetcher: RateLimitedFetcher,
    store: Arc<dyn Store>,
    url: UrlTemplate<I>,
    parser: ResponseParser,
    page_size: usize,
    inputs: Option<Vec<I>>,
    query: Option<QueryFn<I>>,
    header: Option<HeaderFn<I>>,
    total_pages: Option<TotalPagesFn<I>>,
    window: CollectionWindow,
    concurrency: Option<usize>,
    max_pages: usize,
    progress: Progress,
}

impl<I> ApiCollector<I>
where
    I: Serialize + Clone + Send + Sync + 'static,
{
    pub fn new(
        raw: RawDataArgs,
        fetcher: RateLimitedFetcher,
        store: Arc<dyn Store>,
        url: UrlTemplate<I>,
        parser: impl Fn(&ApiResponse) -> Result<Vec<Value>, CollectorError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            raw,
            fetcher,
            store,
            url,
            parser: Arc::new(parser),
            page_size: 0,
            inputs: None,
            query: None,
            header: None,
            total_pages: None,
            window: CollectionWindow::full(),
            concurrency: None,
            max_pages: DEFAULT_MAX_PAGES,
            progress: Progress::new(),
        }
    }

    /// Messages per page; 0 disables pagination.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Iterate the collection once per input item.
    pub fn input(mut self, inputs: Vec<I>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn query(
        mut self,
        f: impl Fn(&RequestData<I>) -> Result<Query, CollectorError> + Send + Sync + 'static,
    ) -> Self {
        self.query = Some(Arc::new(f));
        self
    }

    pub fn header(
        mut self,
        f: impl Fn(&RequestData<I>) -> Result<Headers, CollectorError> + Send + Sync + 'static,
    ) -> Self {
        self.header = Some(Arc::new(f));
        self
    }

    /// Resolve the page count from the first page's response.
    pub fn total_pages(
        mut self,
        f: impl Fn(&ApiResponse, &RequestData<I>) -> Result<usize, CollectorError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.total_pages = Some(Arc::new(f));
        self
    }

    pub fn window(mut self, window: CollectionWindow) -> Self {
        self.window = window;
        self
    }

    /// Cap concurrent jobs below the fetcher's worker limit.
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = Some(workers.max(1));
        self
    }

    /// Stop after this many pages per input.
    pub fn max_pages(mut self, pages: usize) -> Self {
        self.max_pages = pages.max(1);
        self
    }

    pub fn progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Run the collection to completion.
    pub async fn execute(self) -> Result<CollectorStats, CollectorError> {
        let raw_table = self.raw.raw_table();
        let params_key = self.raw.params_key();
        self.store.ensure_raw_table(&raw_table).await?;

        if !self.window.incremental {
            let removed = self.store.truncate_raw(&raw_table, &params_key).await?;
            debug!(table = %raw_table, removed, "Truncated raw rows for full collection");
        }
        info!(
            table = %raw_table,
            params = %params_key,
            incremental = self.window.incremental,
            since = ?self.window.since,
            "Collecting"
        );

        let cancel = self.fetcher.cancellation().child_token();
        let workers = self
            .concurrency
            .unwrap_or_else(|| self.fetcher.max_workers())
            .max(1);
        let page_size = self.page_size;
        let determined = self.total_pages.is_some() && page_size > 0;

        let inputs: Vec<Option<I>> = match self.inputs {
            Some(items) => items.into_iter().map(Some).collect(),
            None => vec![None],
        };
        let mut pending: VecDeque<Job<I>> = inputs
            .into_iter()
            .map(|input| {
                if page_size == 0 {
                    Job::Single(input)
                } else if determined {
                    Job::Discover(input)
                } else {
                    Job::Sequential(input)
                }
            })
            .collect();

        let shared = Arc::new(Shared {
            raw_table,
            params_key,
            params: self.raw.params.clone(),
            fetcher: self.fetcher.with_cancellation(cancel.clone()),
            store: self.store,
            url: self.url,
            parser: self.parser,
            query: self.query,
            header: self.header,
            total_pages: self.total_pages,
            page_size,
            max_pages: self.max_pages,
            since: self.window.since,
            cancel: cancel.clone(),
            progress: self.progress,
            requests: AtomicUsize::new(0),
            rows: AtomicUsize::new(0),
        });

        let mut set = JoinSet::new();
        loop {
            while set.len() < workers {
                let Some(job) = pending.pop_front() else {
                    break;
                };
                let shared = Arc::clone(&shared);
                set.spawn(async move { shared.run(job).await });
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            let failure = match joined {
                Ok(Ok(JobOutcome::Done)) => None,
                Ok(Ok(JobOutcome::More(jobs))) => {
                    pending.extend(jobs);
                    None
                }
                Ok(Err(e)) => Some(e),
                Err(e) => Some(CollectorError::Worker {
                    message: e.to_string(),
                }),
            };
            if let Some(err) = failure {
                cancel.cancel();
                set.abort_all();
                while set.join_next().await.is_some() {}
                tracing::error!(table = %shared.raw_table, error = %err, "Collection aborted");
                return Err(err);
            }
        }

        let stats = CollectorStats {
            requests: shared.requests.load(Ordering::Relaxed),
            rows: shared.rows.load(Ordering::Relaxed),
            incremental: self.window.incremental,
        };
        info!(
            table = %shared.raw_table,
            requests = stats.requests,
            rows = stats.rows,
            "Collection finished"
        );
        Ok(stats)
    }
}

enum Job<I> {
    /// Unpaginated: one request.
    Single(Option<I>),
    /// Sequential pages until a short page.
    Sequential(Option<I>),
    /// Page 1, then schedule the rest from the resolved total.
    Discover(Option<I>),
    Page(Option<I>, usize),
}

enum JobOutcome<I> {
    Done,
    More(Vec<Job<I>>),
}

struct Shared<I> {
    raw_table: String,
    params_key: String,
    params: Value,
    fetcher: RateLimitedFetcher,
    store: Arc<dyn Store>,
    url: UrlTemplate<I>,
    parser: ResponseParser,
    query: Option<QueryFn<I>>,
    header: Option<HeaderFn<I>>,
    total_pages: Option<TotalPagesFn<I>>,
    page_size: usize,
    max_pages: usize,
    since: Option<DateTime<Utc>>,
    cancel: CancellationToken,
    progress: Progress,
    requests: AtomicUsize,
    rows: AtomicUsize,
}

struct Fetched<I> {
    count: usize,
    response: ApiResponse,
    request: RequestData<I>,
}

impl<I> Shared<I>
where
    I: Serialize + Clone + Send + Sync + 'static,
{
    async fn run(self: Arc<Self>, job: Job<I>) -> Result<JobOutcome<I>, CollectorError> {
        match job {
            Job::Single(input) => {
                self.fetch(&input, Pager::new(1, 0)).await?;
                Ok(JobOutcome::Done)
            }
            Job::Page(input, page) => {
                self.fetch(&input, Pager::new(page, self.page_size)).await?;
                Ok(JobOutcome::Done)
            }
            Job::Sequential(input) => {
                let mut page = 1;
                loop {
                    let fetched = self.fetch(&input, Pager::new(page, self.page_size)).await?;
                    if fetched.count < self.page_size {
                        break;
                    }
                    if page >= self.max_pages {
                        warn!(table = %self.raw_table, max_pages = self.max_pages, "Page limit reached, stopping");
                        break;
                    }
                    page += 1;
                }
                Ok(JobOutcome::Done)
            }
            Job::Discover(input) => {
                let fetched = self.fetch(&input, Pager::new(1, self.page_size)).await?;
                let reported = match &self.total_pages {
                    Some(resolve) => resolve(&fetched.response, &fetched.request)?,
                    None => 1,
                };
                let total = reported.min(self.max_pages);
                if total < reported {
                    warn!(
                        table = %self.raw_table,
                        reported,
                        max_pages = self.max_pages,
                        "Server page count exceeds the limit, truncating"
                    );
                }
                self.progress.add_total(total);
                debug!(table = %self.raw_table, total_pages = total, "Resolved page count");
                Ok(JobOutcome::More(
                    (2..=total).map(|page| Job::Page(input.clone(), page)).collect(),
                ))
            }
        }
    }

    async fn fetch(&self, input: &Option<I>, pager: Pager) -> Result<Fetched<I>, CollectorError> {
        if self.cancel.is_cancelled() {
            return Err(CollectorError::Cancelled);
        }
        let request = RequestData {
            pager,
            params: self.params.clone(),
            input: input.clone(),
            since: self.since,
        };
        let path = match &self.url {
            UrlTemplate::Pattern(pattern) => render_string(pattern, &request.template_context()?)?,
            UrlTemplate::Func(f) => f(&request)?,
        };
        let query = match &self.query {
            Some(f) => f(&request)?,
            None => Vec::new(),
        };
        let headers = match &self.header {
            Some(f) => f(&request)?,
            None => Headers::new(),
        };

        let response = self
            .fetcher
            .get(&path, &query, &headers)
            .await
            .map_err(|e| match e {
                FetchError::Cancelled => CollectorError::Cancelled,
                other => CollectorError::Fetch(other),
            })?;
        self.requests.fetch_add(1, Ordering::Relaxed);

        let messages = (self.parser)(&response)?;
        let count = messages.len();
        if count > 0 {
            let input_bytes = match input {
                Some(item) => serde_json::to_vec(item).map_err(|e| CollectorError::InvalidArgs {
                    message: format!("input is not serializable: {e}"),
                })?,
                None => Vec::new(),
            };
            let rows = messages
                .iter()
                .map(|message| NewRawRow {
                    data: message.to_string().into_bytes(),
                    url: response.url.clone(),
                    input: input_bytes.clone(),
                })
                .collect();
            self.store
                .append_raw(&self.raw_table, &self.params_key, rows)
                .await?;
            self.rows.fetch_add(count, Ordering::Relaxed);
            self.progress.inc(count);
        }

        Ok(Fetched {
            count,
            response,
            request,
        })
    }
}
