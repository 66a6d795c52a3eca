/*
 * request.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, a polled asynchronous HTTP client.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Request model: verb, submitted arguments, lifecycle state, and the table
//! slot the manager tracks a request in. Slots are reused: a freed slot goes
//! back to state None and is found again by the next submit.

use crate::codec::ContentEncoding;
use crate::error::HttpError;
use crate::transport::RequestHandle;
use crate::uri::UrlParts;

/// Monotonic request identifier, unique for the manager's lifetime.
pub type RequestId = u64;

/// Completion callback: invoked exactly once, synchronously inside
/// `RequestManager::update` on the owning thread. The boxed closure replaces
/// the original function-pointer-plus-opaque-context pair.
pub type CompletionCallback = Box<dyn FnOnce(&RequestOutcome) + Send>;

/// HTTP request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Put,
    Delete,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Delete => "DELETE",
        }
    }
}

/// Lifecycle of a request slot.
///
/// None (free) → NotStarted (queued) → InProgress (at most one at a time) →
/// Success | Failure | Cancelled (terminal, callback pending) → None again
/// once the callback has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    None,
    NotStarted,
    InProgress,
    Success,
    Failure,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Success | RequestState::Failure | RequestState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::None => "None",
            RequestState::NotStarted => "NotStarted",
            RequestState::InProgress => "InProgress",
            RequestState::Success => "Success",
            RequestState::Failure => "Failure",
            RequestState::Cancelled => "Cancelled",
        }
    }
}

/// Everything the caller supplies for one request. Ownership moves into the
/// manager at submit, so the caller holds no buffers afterwards.
pub struct RequestArgs {
    pub verb: Verb,
    pub url: String,
    /// Ordered header list; keys unique (later `header` calls replace).
    pub headers: Vec<(String, String)>,
    pub content_encoding: ContentEncoding,
    pub content_items: Vec<(String, String)>,
    pub callback: Option<CompletionCallback>,
}

impl RequestArgs {
    pub fn new(verb: Verb, url: impl Into<String>) -> Self {
        Self {
            verb,
            url: url.into(),
            headers: Vec::new(),
            content_encoding: ContentEncoding::FormUrlEncoded,
            content_items: Vec::new(),
            callback: None,
        }
    }

    /// Add a header, replacing any existing one with the same name
    /// (case-insensitive) so keys stay unique while order is preserved.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(existing) => existing.1 = value,
            None => self.headers.push((name, value)),
        }
        self
    }

    pub fn content_encoding(mut self, encoding: ContentEncoding) -> Self {
        self.content_encoding = encoding;
        self
    }

    /// Add a body content item; encoded per the declared content encoding.
    pub fn content_item(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.content_items.push((key.into(), value.into()));
        self
    }

    pub fn on_complete(mut self, callback: impl FnOnce(&RequestOutcome) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

/// Snapshot handed to the completion callback. `state` is Success, Failure,
/// or Cancelled; `error` is set on failure. On failure `bytes` holds
/// whatever arrived before the failure, so check `state` before trusting the
/// length as a complete body.
pub struct RequestOutcome {
    pub id: RequestId,
    pub state: RequestState,
    pub error: Option<HttpError>,
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub bytes: Vec<u8>,
}

/// One slot in the request table. Fields are manager-internal; callers see
/// only `RequestOutcome`.
pub(crate) struct Request {
    pub id: RequestId,
    pub state: RequestState,
    pub error: Option<HttpError>,
    pub verb: Verb,
    pub url_parts: UrlParts,
    /// Index into the connection pool. Valid once state is NotStarted.
    pub connection: usize,
    pub header_block: String,
    pub body: Vec<u8>,
    pub callback: Option<CompletionCallback>,
    pub handle: Option<Box<dyn RequestHandle>>,
    /// Transport has begun delivering the response body.
    pub receiving_data: bool,
    /// A data-availability query is outstanding; don't issue another.
    pub queried_data: bool,
    /// Headers arrived; parse is deferred to the owning thread.
    pub headers_pending: bool,
    /// Absolute tick time after which an in-flight request times out.
    pub deadline: Option<u64>,
    pub status_code: u16,
    pub raw_headers: String,
    pub response_headers: Vec<(String, String)>,
    /// Migrated out of the shared arena once the request is terminal.
    pub response: Vec<u8>,
}

impl Request {
    /// A free slot, reusable by the next submit.
    pub fn free() -> Self {
        Self {
            id: 0,
            state: RequestState::None,
            error: None,
            verb: Verb::Get,
            url_parts: crate::uri::parse_url(""),
            connection: 0,
            header_block: String::new(),
            body: Vec::new(),
            callback: None,
            handle: None,
            receiving_data: false,
            queried_data: false,
            headers_pending: false,
            deadline: None,
            status_code: 0,
            raw_headers: String::new(),
            response_headers: Vec::new(),
            response: Vec::new(),
        }
    }
}
