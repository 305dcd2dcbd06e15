//! Lazy page-by-page iteration over large collections.
//!
//! A [`PageStream`] holds at most one page of items plus its cursor. Each
//! page is an ordinary gateway call (cache, breaker, retry) whose arguments
//! are the base arguments plus the page size and, after the first page, the
//! cursor returned by the previous one.

use cache::Arguments;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{CallOptions, Gateway};

/// Where pages keep their items and cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageLayout {
    /// Response field holding the page's items array.
    pub items_field: String,
    /// Response field holding the continuation token; absent or null on the last page.
    pub cursor_field: String,
    /// Request argument carrying the continuation token.
    pub cursor_arg: String,
    /// Request argument carrying the page size.
    pub limit_arg: String,
}

impl Default for PageLayout {
    fn default() -> Self {
        Self {
            items_field: "value".to_string(),
            cursor_field: "next_cursor".to_string(),
            cursor_arg: "cursor".to_string(),
            limit_arg: "limit".to_string(),
        }
    }
}

/// Continuation state of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCursor {
    token: Option<String>,
    has_more: bool,
}

impl StreamCursor {
    fn start() -> Self {
        Self {
            token: None,
            has_more: true,
        }
    }

    /// Token for the next page; `None` before the first page and after the last.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }
}

/// Finite, non-restartable sequence of result pages.
#[derive(Debug)]
pub struct PageStream {
    gateway: Gateway,
    operation: String,
    base_arguments: Arguments,
    page_size: usize,
    layout: PageLayout,
    options: CallOptions,
    cancel: Option<CancellationToken>,
    cursor: StreamCursor,
    finished: bool,
    pages_fetched: u64,
    items_yielded: u64,
}

impl PageStream {
    pub(crate) fn new(
        gateway: Gateway,
        operation: String,
        base_arguments: Arguments,
        page_size: usize,
        layout: PageLayout,
        options: CallOptions,
    ) -> Self {
        Self {
            gateway,
            operation,
            base_arguments,
            page_size: page_size.max(1),
            layout,
            options,
            cancel: None,
            cursor: StreamCursor::start(),
            finished: false,
            pages_fetched: 0,
            items_yielded: 0,
        }
    }

    pub fn with_layout(mut self, layout: PageLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Options used for every page request.
    pub fn with_call_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// Stop requesting pages once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Copy of the current continuation state.
    pub fn cursor(&self) -> StreamCursor {
        self.cursor.clone()
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    pub fn items_yielded(&self) -> u64 {
        self.items_yielded
    }

    /// Whether another call to [`next_page`](Self::next_page) yields anything.
    ///
    /// True right after cancellation so the consumer observes `Cancelled` once.
    pub fn has_next(&self) -> bool {
        !self.finished && self.cursor.has_more
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|token| token.is_cancelled())
    }

    fn page_arguments(&self) -> Arguments {
        let mut arguments = self.base_arguments.clone();
        arguments.insert(self.layout.limit_arg.clone(), self.page_size as u64);
        if let Some(token) = &self.cursor.token {
            arguments.insert(self.layout.cursor_arg.clone(), token.clone());
        }
        arguments
    }

    /// Fetch the next page.
    ///
    /// `None` once the remote reported no more pages, or after a failure has
    /// been returned. A failure ends the stream; pages already returned stay
    /// valid.
    pub async fn next_page(&mut self) -> Option<GatewayResult<Vec<Value>>> {
        if !self.has_next() {
            return None;
        }
        if self.is_cancelled() {
            self.finished = true;
            return Some(Err(GatewayError::Cancelled));
        }

        let arguments = self.page_arguments();
        let layout = &self.layout;
        let current = self.cursor.token.as_deref();
        let report = self
            .gateway
            .call_with(&self.operation, &arguments, &self.options, |value, attempts| {
                parse_page(layout, current, value, attempts)
            })
            .await;

        match report.result {
            Ok((items, next)) => {
                self.pages_fetched += 1;
                self.items_yielded += items.len() as u64;
                self.cursor = StreamCursor {
                    has_more: next.is_some(),
                    token: next,
                };
                if !self.cursor.has_more {
                    tracing::debug!(
                        operation = %self.operation,
                        pages = self.pages_fetched,
                        items = self.items_yielded,
                        "stream exhausted"
                    );
                }
                Some(Ok(items))
            }
            Err(error) => {
                self.finished = true;
                tracing::debug!(
                    operation = %self.operation,
                    pages = self.pages_fetched,
                    error = %error,
                    "stream terminated"
                );
                Some(Err(error))
            }
        }
    }

    /// Flatten the pages into a stream of items.
    ///
    /// A failure is yielded once as an `Err` item and ends the stream.
    pub fn into_item_stream(self) -> impl Stream<Item = GatewayResult<Value>> {
        futures::stream::unfold(
            (self, VecDeque::new()),
            |(mut pages, mut buffer)| async move {
                loop {
                    if let Some(item) = buffer.pop_front() {
                        return Some((Ok(item), (pages, buffer)));
                    }
                    match pages.next_page().await {
                        None => return None,
                        Some(Ok(items)) => buffer = VecDeque::from(items),
                        Some(Err(error)) => return Some((Err(error), (pages, buffer))),
                    }
                }
            },
        )
    }
}

/// Split a page into its items and the next cursor.
///
/// A cursor equal to `current` would loop forever and is refused.
fn parse_page(
    layout: &PageLayout,
    current: Option<&str>,
    value: Value,
    attempts: u32,
) -> GatewayResult<(Vec<Value>, Option<String>)> {
    let Value::Object(mut page) = value else {
        return Err(GatewayError::malformed("page is not a JSON object", attempts));
    };
    let items = match page.remove(&layout.items_field) {
        Some(Value::Array(items)) => items,
        _ => {
            return Err(GatewayError::malformed(
                format!("page has no `{}` array", layout.items_field),
                attempts,
            ));
        }
    };
    let next = match page.remove(&layout.cursor_field) {
        None | Some(Value::Null) => None,
        Some(Value::String(token)) if token.is_empty() => None,
        Some(Value::String(token)) => Some(token),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => {
            return Err(GatewayError::malformed(
                format!("unexpected `{}` value {other}", layout.cursor_field),
                attempts,
            ));
        }
    };
    if next.is_some() && next.as_deref() == current {
        return Err(GatewayError::malformed(
            format!("cursor did not advance past {next:?}"),
            attempts,
        ));
    }
    Ok((items, next))
}
