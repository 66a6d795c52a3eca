/*
 * manager.rs
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

//! Request manager: owns the request table, the connection pool, and the
//! shared response buffer, and serializes execution of one request at a
//! time. `submit` and `update` must be called from one consistent owning
//! thread; transport callbacks mutate the shared state from their own
//! threads through the bridge, under the one manager mutex.
//!
//! `update` never blocks on network I/O. It polls state the bridge has set,
//! issues non-blocking transport calls, and fires completion callbacks on
//! the owning thread, exactly once per request.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::arena::{ResponseArena, DEFAULT_RESPONSE_LIMIT};
use crate::bridge::EventSink;
use crate::codec;
use crate::error::HttpError;
use crate::pool::ConnectionPool;
use crate::request::{Request, RequestArgs, RequestId, RequestOutcome, RequestState};
use crate::transport::Transport;
use crate::uri::parse_url;

/// Tunables fixed at manager creation.
pub struct ManagerConfig {
    /// Ceiling for one response body in the shared buffer.
    pub response_limit: usize,
    /// Per-request deadline in tick time units, checked each update. None
    /// means a request may wait on the transport forever.
    pub request_timeout: Option<u64>,
    /// Synthesized User-Agent when the caller sets none.
    pub user_agent: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            response_limit: DEFAULT_RESPONSE_LIMIT,
            request_timeout: None,
            user_agent: concat!("staffetta/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Scratch storage for response header parsing. Lives on the owning thread
/// (it is a plain field of the manager, outside the mutex), so passing it
/// into the decode call enforces the "headers are parsed on the owning
/// thread" rule through the type signature rather than by convention.
pub struct HeaderScratch {
    buf: String,
}

impl HeaderScratch {
    fn new() -> Self {
        Self { buf: String::new() }
    }

    /// Unfold obs-fold continuation lines into the scratch buffer, then
    /// decode the block into ordered key/value pairs.
    pub fn decode(&mut self, raw: &str) -> Vec<(String, String)> {
        self.buf.clear();
        for line in raw.split_inclusive('\n') {
            if (line.starts_with(' ') || line.starts_with('\t')) && !self.buf.is_empty() {
                // Continuation of the previous header value.
                while self.buf.ends_with('\n') || self.buf.ends_with('\r') {
                    self.buf.pop();
                }
                self.buf.push(' ');
                self.buf.push_str(line.trim_start());
            } else {
                self.buf.push_str(line);
            }
        }
        codec::decode_header_block(&self.buf)
    }
}

/// State shared between the owning thread and transport callback threads.
/// Everything inside the mutex; the bridge and the manager both lock it.
pub(crate) struct ManagerShared {
    pub state: Mutex<ManagerState>,
}

pub(crate) struct ManagerState {
    pub requests: Vec<Request>,
    pub pool: ConnectionPool,
    pub arena: ResponseArena,
    /// Index of the single slot permitted to be in flight.
    pub current: Option<usize>,
}

fn lock(shared: &ManagerShared) -> MutexGuard<'_, ManagerState> {
    match shared.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

enum StartProgress {
    /// A request is already in flight; nothing to start this tick.
    InFlight,
    /// A queued request was handed to the transport.
    Started,
    /// Starting failed; the slot is terminal with its callback pending.
    StartFailed,
    /// No queued request remains.
    Idle,
}

/// Owns the request table, connection pool, and shared response buffer.
/// Create once, then call `submit` and `update` from the owning thread.
pub struct RequestManager {
    pub(crate) shared: Arc<ManagerShared>,
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
    scratch: HeaderScratch,
    next_id: RequestId,
}

impl RequestManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ManagerConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: ManagerConfig) -> Self {
        let shared = Arc::new(ManagerShared {
            state: Mutex::new(ManagerState {
                requests: Vec::new(),
                pool: ConnectionPool::new(),
                arena: ResponseArena::new(config.response_limit),
                current: None,
            }),
        });
        Self {
            shared,
            transport,
            config,
            scratch: HeaderScratch::new(),
            next_id: 1,
        }
    }

    /// Queue a request. Parses the URL, finds or opens the pooled
    /// connection, encodes the header block and body, and claims a table
    /// slot (reusing a freed one before growing). Touches no network I/O.
    ///
    /// A URL without a hostname or a refused connection does not fail the
    /// call: the slot is created already terminal (UrlParse / ConnectFailed)
    /// and its callback fires once on a later update tick, the same path
    /// every other failure takes.
    pub fn submit(&mut self, args: RequestArgs, now: u64) -> RequestId {
        let RequestArgs {
            verb,
            url,
            mut headers,
            content_encoding,
            content_items,
            callback,
        } = args;

        let url_parts = parse_url(&url);
        if !headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
        {
            headers.push(("User-Agent".to_string(), self.config.user_agent.clone()));
        }
        let content_type = if content_items.is_empty() {
            None
        } else {
            Some(content_encoding.mime())
        };
        let header_block = codec::encode_header_block(&headers, content_type);
        let body = codec::encode_content(&content_encoding, &content_items);

        let id = self.next_id;
        self.next_id += 1;

        let mut guard = lock(&self.shared);
        let st = &mut *guard;
        let index = match st
            .requests
            .iter()
            .position(|r| r.state == RequestState::None)
        {
            Some(index) => index,
            None => {
                st.requests.push(Request::free());
                st.requests.len() - 1
            }
        };

        let ManagerState { requests, pool, .. } = st;
        let request = &mut requests[index];
        *request = Request::free();
        request.id = id;
        request.verb = verb;
        request.url_parts = url_parts;
        request.header_block = header_block;
        request.body = body;
        request.callback = callback;

        if request.url_parts.hostname.is_empty() {
            eprintln!("[http] request {} rejected: no hostname in \"{}\"", id, url);
            request.state = RequestState::Failure;
            request.error = Some(HttpError::UrlParse);
            return id;
        }

        let hostname = request.url_parts.hostname.clone();
        let port = request.url_parts.effective_port();
        let use_tls = request.url_parts.use_tls();
        match pool.find_or_open(self.transport.as_ref(), &hostname, port, use_tls, now) {
            Ok(connection) => {
                request.connection = connection;
                request.state = RequestState::NotStarted;
            }
            Err(err) => {
                eprintln!("[http] connect to {}:{} failed: {}", hostname, port, err);
                request.state = RequestState::Failure;
                request.error = Some(HttpError::ConnectFailed);
            }
        }
        id
    }

    /// Drive the state machine one tick. Parses deferred headers, drains a
    /// finished in-flight request, polls for response data, fires pending
    /// completion callbacks, and starts the next queued request.
    pub fn update(&mut self, now: u64) {
        {
            let mut guard = lock(&self.shared);
            let ManagerState {
                requests,
                arena,
                current,
                ..
            } = &mut *guard;
            if let Some(cur) = *current {
                let request = &mut requests[cur];

                // Headers are parsed here, not in the bridge: decoding needs
                // the owning thread's scratch context.
                if request.headers_pending && request.state == RequestState::InProgress {
                    request.headers_pending = false;
                    if let Some(handle) = request.handle.as_mut() {
                        let queried = handle
                            .status_code()
                            .and_then(|code| handle.raw_headers().map(|raw| (code, raw)));
                        match queried {
                            Ok((code, raw)) => {
                                request.status_code = code;
                                request.response_headers = self.scratch.decode(&raw);
                                request.raw_headers = raw;
                            }
                            Err(err) => {
                                eprintln!(
                                    "[http] header query failed for request {}: {}",
                                    request.id, err
                                );
                                request.state = RequestState::Failure;
                                request.error = Some(HttpError::TransportError);
                            }
                        }
                    }
                }

                if request.state.is_terminal() {
                    // Migrate the body out of the shared buffer and reset it
                    // immediately; the buffer belongs to the next request.
                    if !arena.is_empty() {
                        request.response = arena.take();
                    }
                    request.handle = None;
                    *current = None;
                } else if request.state == RequestState::InProgress {
                    let expired = request.deadline.map(|d| now >= d).unwrap_or(false);
                    if expired {
                        eprintln!("[http] request {} timed out", request.id);
                        request.state = RequestState::Failure;
                        request.error = Some(HttpError::TimedOut);
                        request.receiving_data = false;
                        if !arena.is_empty() {
                            request.response = arena.take();
                        }
                        request.handle = None;
                        *current = None;
                    } else if request.receiving_data && !request.queried_data {
                        request.queried_data = true;
                        let result = match request.handle.as_mut() {
                            Some(handle) => handle.query_data_available(),
                            None => Ok(()),
                        };
                        if let Err(err) = result {
                            eprintln!(
                                "[http] data query failed for request {}: {}",
                                request.id, err
                            );
                            request.queried_data = false;
                            request.state = RequestState::Failure;
                            request.error = Some(HttpError::TransportError);
                            if !arena.is_empty() {
                                request.response = arena.take();
                            }
                            request.handle = None;
                            *current = None;
                        }
                    }
                }
            }
        }

        // Outside the lock: fire callbacks, then start the next queued
        // request while nothing is in flight.
        loop {
            while self.deliver_next_callback() {}
            match self.try_start_next(now) {
                StartProgress::StartFailed => continue,
                StartProgress::InFlight | StartProgress::Started | StartProgress::Idle => break,
            }
        }
    }

    /// Cancel a queued or in-flight request. The slot becomes terminal
    /// Cancelled and its callback fires once on the next update tick.
    /// Returns false when the id is unknown or already terminal.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        let mut guard = lock(&self.shared);
        let ManagerState {
            requests,
            arena,
            current,
            ..
        } = &mut *guard;
        let Some(index) = requests.iter().position(|r| {
            r.id == id
                && matches!(
                    r.state,
                    RequestState::NotStarted | RequestState::InProgress
                )
        }) else {
            return false;
        };
        let request = &mut requests[index];
        eprintln!("[http] request {} cancelled", id);
        request.state = RequestState::Cancelled;
        request.error = Some(HttpError::Cancelled);
        request.receiving_data = false;
        request.handle = None;
        if *current == Some(index) {
            if !arena.is_empty() {
                request.response = arena.take();
            }
            *current = None;
        }
        true
    }

    /// State of a live request, or None once its slot has been freed.
    pub fn state_of(&self, id: RequestId) -> Option<RequestState> {
        let guard = lock(&self.shared);
        guard
            .requests
            .iter()
            .find(|r| r.id == id && r.state != RequestState::None)
            .map(|r| r.state)
    }

    /// Id of the in-flight request, if any.
    pub fn in_flight(&self) -> Option<RequestId> {
        let guard = lock(&self.shared);
        guard.current.map(|i| guard.requests[i].id)
    }

    /// Number of pooled connections opened so far.
    pub fn connection_count(&self) -> usize {
        lock(&self.shared).pool.len()
    }

    /// Drain one terminal request: fire its callback (if any) and free the
    /// slot. The current slot is skipped; its response bytes may still be in
    /// the shared arena, so the next update tick migrates it first. Returns
    /// false when nothing is ready to drain.
    fn deliver_next_callback(&mut self) -> bool {
        let (callback, outcome) = {
            let mut guard = lock(&self.shared);
            let current = guard.current;
            let Some(index) = guard
                .requests
                .iter()
                .enumerate()
                .position(|(i, r)| r.state.is_terminal() && current != Some(i))
            else {
                return false;
            };
            let request = &mut guard.requests[index];
            let callback = request.callback.take();
            let outcome = RequestOutcome {
                id: request.id,
                state: request.state,
                error: request.error,
                status_code: request.status_code,
                headers: std::mem::take(&mut request.response_headers),
                bytes: std::mem::take(&mut request.response),
            };
            *request = Request::free();
            (callback, outcome)
        };
        // Invoked on the owning thread, outside the lock.
        if let Some(callback) = callback {
            callback(&outcome);
        }
        true
    }

    /// Start the next NotStarted request if nothing is in flight: open the
    /// per-request transport handle, submit the encoded request, mark it
    /// InProgress and current. Open or send failures make the slot terminal
    /// instead (OpenRequestFailed / SendFailed) so the callback still fires
    /// exactly once.
    fn try_start_next(&mut self, now: u64) -> StartProgress {
        let mut guard = lock(&self.shared);
        let st = &mut *guard;
        if st.current.is_some() {
            return StartProgress::InFlight;
        }
        let Some(index) = st
            .requests
            .iter()
            .position(|r| r.state == RequestState::NotStarted)
        else {
            return StartProgress::Idle;
        };

        let ManagerState {
            requests,
            pool,
            current,
            ..
        } = st;
        let request = &mut requests[index];
        let connection = pool.get_mut(request.connection);
        connection.last_used = now;
        eprintln!(
            "[http] starting request {} to {}{}",
            request.id,
            request.url_parts.hostname,
            request.url_parts.path_and_query()
        );

        let sink = EventSink::new(self.shared.clone(), request.id);
        let mut handle = match self.transport.open_request(
            &mut *connection.handle,
            request.verb,
            &request.url_parts.path_and_query(),
            connection.use_tls,
            sink,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                eprintln!("[http] open request {} failed: {}", request.id, err);
                request.state = RequestState::Failure;
                request.error = Some(HttpError::OpenRequestFailed);
                return StartProgress::StartFailed;
            }
        };
        if let Err(err) = handle.send(&request.header_block, &request.body) {
            eprintln!("[http] send for request {} failed: {}", request.id, err);
            request.state = RequestState::Failure;
            request.error = Some(HttpError::SendFailed);
            return StartProgress::StartFailed;
        }

        request.handle = Some(handle);
        request.state = RequestState::InProgress;
        request.deadline = self
            .config
            .request_timeout
            .map(|t| now.saturating_add(t));
        *current = Some(index);
        StartProgress::Started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ContentEncoding;
    use crate::request::{RequestArgs, Verb};
    use crate::transport::{ConnectionHandle, RequestHandle, TransportEvent};
    use std::any::Any;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MockShared {
        fail_connect: Vec<String>,
        fail_open: bool,
        fail_send: bool,
        fail_read: bool,
        connects: Vec<(String, u16, bool)>,
        opens: usize,
        sends: Vec<(String, Vec<u8>)>,
        receives: usize,
        queries: usize,
        sink: Option<EventSink>,
        read_src: VecDeque<u8>,
        /// Serve at most this many bytes per read_data call (0 = unlimited).
        max_read: usize,
        status: u16,
        raw_headers: String,
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        shared: Arc<Mutex<MockShared>>,
    }

    struct MockConnection;

    impl ConnectionHandle for MockConnection {
        fn as_any(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct MockHandle {
        shared: Arc<Mutex<MockShared>>,
    }

    impl crate::transport::Transport for MockTransport {
        fn connect(
            &self,
            hostname: &str,
            port: u16,
            use_tls: bool,
        ) -> io::Result<Box<dyn ConnectionHandle>> {
            let mut shared = self.shared.lock().unwrap();
            if shared.fail_connect.iter().any(|h| h == hostname) {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connect refused by test",
                ));
            }
            shared.connects.push((hostname.to_string(), port, use_tls));
            Ok(Box::new(MockConnection))
        }

        fn open_request(
            &self,
            _connection: &mut dyn ConnectionHandle,
            _verb: Verb,
            _path_and_query: &str,
            _use_tls: bool,
            sink: EventSink,
        ) -> io::Result<Box<dyn RequestHandle>> {
            let mut shared = self.shared.lock().unwrap();
            if shared.fail_open {
                return Err(io::Error::new(io::ErrorKind::Other, "open refused by test"));
            }
            shared.opens += 1;
            shared.sink = Some(sink);
            Ok(Box::new(MockHandle {
                shared: self.shared.clone(),
            }))
        }
    }

    impl RequestHandle for MockHandle {
        fn send(&mut self, header_block: &str, body: &[u8]) -> io::Result<()> {
            let mut shared = self.shared.lock().unwrap();
            if shared.fail_send {
                return Err(io::Error::new(io::ErrorKind::Other, "send refused by test"));
            }
            shared.sends.push((header_block.to_string(), body.to_vec()));
            Ok(())
        }

        fn receive_response(&mut self) -> io::Result<()> {
            self.shared.lock().unwrap().receives += 1;
            Ok(())
        }

        fn query_data_available(&mut self) -> io::Result<()> {
            self.shared.lock().unwrap().queries += 1;
            Ok(())
        }

        fn read_data(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut shared = self.shared.lock().unwrap();
            if shared.fail_read {
                return Err(io::Error::new(io::ErrorKind::Other, "read refused by test"));
            }
            let cap = if shared.max_read == 0 {
                buf.len()
            } else {
                buf.len().min(shared.max_read)
            };
            let count = cap.min(shared.read_src.len());
            for slot in buf.iter_mut().take(count) {
                *slot = shared.read_src.pop_front().unwrap();
            }
            Ok(count)
        }

        fn status_code(&mut self) -> io::Result<u16> {
            Ok(self.shared.lock().unwrap().status)
        }

        fn raw_headers(&mut self) -> io::Result<String> {
            Ok(self.shared.lock().unwrap().raw_headers.clone())
        }
    }

    fn fire(mock: &MockTransport, event: TransportEvent) {
        let sink = mock.shared.lock().unwrap().sink.clone();
        sink.expect("no request started").post(event);
    }

    fn manager_with(mock: &MockTransport) -> RequestManager {
        RequestManager::new(Arc::new(mock.clone()))
    }

    /// Callback that counts invocations and records the outcome fields.
    struct Capture {
        count: Arc<AtomicUsize>,
        outcomes: Arc<Mutex<Vec<(RequestState, Option<HttpError>, u16, Vec<u8>)>>>,
    }

    impl Capture {
        fn new() -> Self {
            Self {
                count: Arc::new(AtomicUsize::new(0)),
                outcomes: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn hook(&self) -> impl FnOnce(&RequestOutcome) + Send + 'static {
            let count = self.count.clone();
            let outcomes = self.outcomes.clone();
            move |outcome| {
                count.fetch_add(1, Ordering::SeqCst);
                outcomes.lock().unwrap().push((
                    outcome.state,
                    outcome.error,
                    outcome.status_code,
                    outcome.bytes.clone(),
                ));
            }
        }

        fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    fn in_progress_count(manager: &RequestManager) -> usize {
        lock(&manager.shared)
            .requests
            .iter()
            .filter(|r| r.state == RequestState::InProgress)
            .count()
    }

    #[test]
    fn same_host_shares_one_connection() {
        let mock = MockTransport::default();
        let mut manager = manager_with(&mock);
        let a = manager.submit(RequestArgs::new(Verb::Get, "https://example.com/a"), 0);
        let b = manager.submit(RequestArgs::new(Verb::Get, "https://example.com/b"), 0);
        assert_ne!(a, b);
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.state_of(a), Some(RequestState::NotStarted));
        assert_eq!(manager.state_of(b), Some(RequestState::NotStarted));
        {
            let shared = mock.shared.lock().unwrap();
            assert_eq!(shared.connects, vec![("example.com".to_string(), 443, true)]);
            // No request handle opened until update starts one.
            assert_eq!(shared.opens, 0);
        }
        manager.update(1);
        assert_eq!(mock.shared.lock().unwrap().opens, 1);
    }

    #[test]
    fn success_scenario_hello_world() {
        let mock = MockTransport::default();
        {
            let mut shared = mock.shared.lock().unwrap();
            shared.status = 200;
            shared.raw_headers = "Content-Type: text/plain\r\nServer: mock\r\n".to_string();
        }
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        let id = manager.submit(
            RequestArgs::new(Verb::Get, "https://example.com/a").on_complete(capture.hook()),
            0,
        );

        manager.update(1);
        assert_eq!(manager.state_of(id), Some(RequestState::InProgress));
        assert_eq!(mock.shared.lock().unwrap().sends.len(), 1);

        fire(&mock, TransportEvent::SendComplete);
        assert_eq!(mock.shared.lock().unwrap().receives, 1);
        fire(&mock, TransportEvent::HeadersAvailable);
        fire(&mock, TransportEvent::ReceivingResponse);

        manager.update(2);
        assert_eq!(mock.shared.lock().unwrap().queries, 1);

        mock.shared
            .lock()
            .unwrap()
            .read_src
            .extend(b"hello world\n".iter().copied());
        fire(&mock, TransportEvent::DataAvailable(12));
        fire(&mock, TransportEvent::DataAvailable(0));

        manager.update(3);
        assert_eq!(capture.count(), 1);
        let outcomes = capture.outcomes.lock().unwrap();
        let (state, error, status, bytes) = &outcomes[0];
        assert_eq!(*state, RequestState::Success);
        assert_eq!(*error, None);
        assert_eq!(*status, 200);
        assert_eq!(bytes, b"hello world\n");
        drop(outcomes);

        // Slot freed, arena reset.
        assert_eq!(manager.state_of(id), None);
        assert!(lock(&manager.shared).arena.is_empty());

        // Parsed headers were delivered before the slot was cleared.
        manager.update(4);
        assert_eq!(capture.count(), 1);
    }

    #[test]
    fn deferred_headers_are_parsed_on_update() {
        let mock = MockTransport::default();
        {
            let mut shared = mock.shared.lock().unwrap();
            shared.status = 404;
            shared.raw_headers =
                "Content-Type: text/html\r\nX-Long: part one\r\n\tpart two\r\n".to_string();
        }
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        manager.submit(
            RequestArgs::new(Verb::Get, "https://example.com/missing")
                .on_complete(capture.hook()),
            0,
        );
        manager.update(1);
        fire(&mock, TransportEvent::SendComplete);
        fire(&mock, TransportEvent::HeadersAvailable);
        fire(&mock, TransportEvent::ReceivingResponse);
        manager.update(2);
        fire(&mock, TransportEvent::DataAvailable(0));
        manager.update(3);

        let outcomes = capture.outcomes.lock().unwrap();
        assert_eq!(outcomes[0].2, 404);
        assert_eq!(outcomes[0].0, RequestState::Success);
    }

    #[test]
    fn connect_failure_fails_request_not_process() {
        let mock = MockTransport::default();
        mock.shared
            .lock()
            .unwrap()
            .fail_connect
            .push("down.example.com".to_string());
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        let id = manager.submit(
            RequestArgs::new(Verb::Get, "https://down.example.com/x").on_complete(capture.hook()),
            0,
        );
        assert_eq!(manager.state_of(id), Some(RequestState::Failure));
        manager.update(1);
        assert_eq!(capture.count(), 1);
        let outcomes = capture.outcomes.lock().unwrap();
        assert_eq!(outcomes[0].1, Some(HttpError::ConnectFailed));
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn bad_url_fails_with_url_parse() {
        let mock = MockTransport::default();
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        manager.submit(
            RequestArgs::new(Verb::Get, "https:///nohost").on_complete(capture.hook()),
            0,
        );
        manager.update(1);
        assert_eq!(capture.count(), 1);
        assert_eq!(
            capture.outcomes.lock().unwrap()[0].1,
            Some(HttpError::UrlParse)
        );
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn open_failure_surfaces_as_request_failure() {
        let mock = MockTransport::default();
        mock.shared.lock().unwrap().fail_open = true;
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        manager.submit(
            RequestArgs::new(Verb::Get, "https://example.com/").on_complete(capture.hook()),
            0,
        );
        manager.update(1);
        assert_eq!(capture.count(), 1);
        assert_eq!(
            capture.outcomes.lock().unwrap()[0].1,
            Some(HttpError::OpenRequestFailed)
        );
        assert_eq!(manager.in_flight(), None);
    }

    #[test]
    fn send_failure_surfaces_as_request_failure() {
        let mock = MockTransport::default();
        mock.shared.lock().unwrap().fail_send = true;
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        manager.submit(
            RequestArgs::new(Verb::Post, "https://example.com/upload")
                .content_item("k", "v")
                .on_complete(capture.hook()),
            0,
        );
        manager.update(1);
        assert_eq!(capture.count(), 1);
        assert_eq!(
            capture.outcomes.lock().unwrap()[0].1,
            Some(HttpError::SendFailed)
        );
    }

    #[test]
    fn chunked_delivery_accumulates_exactly_n_bytes() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        // Several chunkings of the same payload, including single-chunk.
        for chunks in [vec![1000], vec![500, 500], vec![1, 999], vec![300, 300, 300, 100]] {
            let mock = MockTransport::default();
            let mut manager = manager_with(&mock);
            let capture = Capture::new();
            manager.submit(
                RequestArgs::new(Verb::Get, "https://example.com/blob")
                    .on_complete(capture.hook()),
                0,
            );
            manager.update(1);
            fire(&mock, TransportEvent::SendComplete);
            fire(&mock, TransportEvent::ReceivingResponse);
            let mut served = 0;
            for chunk in &chunks {
                manager.update(2);
                mock.shared
                    .lock()
                    .unwrap()
                    .read_src
                    .extend(payload[served..served + chunk].iter().copied());
                served += chunk;
                fire(&mock, TransportEvent::DataAvailable(*chunk));
            }
            fire(&mock, TransportEvent::DataAvailable(0));
            manager.update(3);
            assert_eq!(capture.count(), 1);
            let outcomes = capture.outcomes.lock().unwrap();
            assert_eq!(outcomes[0].0, RequestState::Success);
            assert_eq!(outcomes[0].3, payload);
        }
    }

    #[test]
    fn short_read_truncates_logical_length() {
        let mock = MockTransport::default();
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        manager.submit(
            RequestArgs::new(Verb::Get, "https://example.com/short").on_complete(capture.hook()),
            0,
        );
        manager.update(1);
        fire(&mock, TransportEvent::SendComplete);
        fire(&mock, TransportEvent::ReceivingResponse);
        manager.update(2);
        // Announce 10 bytes but only 4 arrive.
        mock.shared
            .lock()
            .unwrap()
            .read_src
            .extend(b"abcd".iter().copied());
        fire(&mock, TransportEvent::DataAvailable(10));
        fire(&mock, TransportEvent::DataAvailable(0));
        manager.update(3);
        assert_eq!(capture.outcomes.lock().unwrap()[0].3, b"abcd");
    }

    #[test]
    fn failed_read_keeps_only_delivered_bytes() {
        let mock = MockTransport::default();
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        manager.submit(
            RequestArgs::new(Verb::Get, "https://example.com/flaky").on_complete(capture.hook()),
            0,
        );
        manager.update(1);
        fire(&mock, TransportEvent::SendComplete);
        fire(&mock, TransportEvent::ReceivingResponse);
        manager.update(2);

        // First chunk arrives intact.
        mock.shared
            .lock()
            .unwrap()
            .read_src
            .extend(b"okay".iter().copied());
        fire(&mock, TransportEvent::DataAvailable(4));
        manager.update(3);

        // The next announced chunk fails to read; its reservation must not
        // leak into the outcome.
        mock.shared.lock().unwrap().fail_read = true;
        fire(&mock, TransportEvent::DataAvailable(100));
        manager.update(4);

        assert_eq!(capture.count(), 1);
        let outcomes = capture.outcomes.lock().unwrap();
        assert_eq!(outcomes[0].0, RequestState::Failure);
        assert_eq!(outcomes[0].1, Some(HttpError::TransportError));
        assert_eq!(outcomes[0].3, b"okay");
    }

    #[test]
    fn response_ceiling_fails_cleanly() {
        let mock = MockTransport::default();
        let mut manager = RequestManager::with_config(
            Arc::new(mock.clone()),
            ManagerConfig {
                response_limit: 8,
                ..ManagerConfig::default()
            },
        );
        let capture = Capture::new();
        manager.submit(
            RequestArgs::new(Verb::Get, "https://example.com/huge").on_complete(capture.hook()),
            0,
        );
        manager.update(1);
        fire(&mock, TransportEvent::SendComplete);
        fire(&mock, TransportEvent::ReceivingResponse);
        manager.update(2);
        fire(&mock, TransportEvent::DataAvailable(32));
        manager.update(3);
        assert_eq!(capture.count(), 1);
        assert_eq!(
            capture.outcomes.lock().unwrap()[0].1,
            Some(HttpError::ResponseTooLarge)
        );
    }

    #[test]
    fn update_is_idempotent_without_new_events() {
        let mock = MockTransport::default();
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        let id = manager.submit(
            RequestArgs::new(Verb::Get, "https://example.com/idle").on_complete(capture.hook()),
            0,
        );
        manager.update(1);
        fire(&mock, TransportEvent::SendComplete);
        fire(&mock, TransportEvent::ReceivingResponse);
        manager.update(2);
        let queries = mock.shared.lock().unwrap().queries;
        for tick in 3..10 {
            manager.update(tick);
        }
        // One outstanding query, no state change, no callback.
        assert_eq!(mock.shared.lock().unwrap().queries, queries);
        assert_eq!(manager.state_of(id), Some(RequestState::InProgress));
        assert_eq!(capture.count(), 0);

        fire(&mock, TransportEvent::DataAvailable(0));
        for tick in 10..15 {
            manager.update(tick);
        }
        assert_eq!(capture.count(), 1);
    }

    #[test]
    fn two_hosts_drain_sequentially() {
        let mock = MockTransport::default();
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        let a = manager.submit(
            RequestArgs::new(Verb::Get, "https://alpha.example.com/").on_complete(capture.hook()),
            0,
        );
        let b = manager.submit(
            RequestArgs::new(Verb::Get, "https://beta.example.com/").on_complete(capture.hook()),
            0,
        );
        assert_eq!(manager.connection_count(), 2);

        manager.update(1);
        assert_eq!(manager.in_flight(), Some(a));
        assert_eq!(in_progress_count(&manager), 1);
        fire(&mock, TransportEvent::SendComplete);
        fire(&mock, TransportEvent::ReceivingResponse);
        fire(&mock, TransportEvent::DataAvailable(0));
        assert!(in_progress_count(&manager) <= 1);

        manager.update(2);
        assert_eq!(manager.in_flight(), Some(b));
        assert_eq!(in_progress_count(&manager), 1);
        fire(&mock, TransportEvent::SendComplete);
        fire(&mock, TransportEvent::ReceivingResponse);
        fire(&mock, TransportEvent::DataAvailable(0));

        manager.update(3);
        assert_eq!(capture.count(), 2);
        assert_eq!(manager.in_flight(), None);
    }

    #[test]
    fn at_most_one_in_progress_under_threaded_callbacks() {
        let mock = MockTransport::default();
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        for i in 0..3 {
            manager.submit(
                RequestArgs::new(Verb::Get, format!("https://example.com/{}", i))
                    .on_complete(capture.hook()),
                0,
            );
        }

        let firing = mock.clone();
        let done = Arc::new(AtomicUsize::new(0));
        let done_flag = done.clone();
        let firer = std::thread::spawn(move || {
            while done_flag.load(Ordering::SeqCst) == 0 {
                let sink = firing.shared.lock().unwrap().sink.clone();
                if let Some(sink) = sink {
                    // Stale events for drained requests are dropped by the
                    // bridge's id guard, so firing blindly is safe.
                    sink.post(TransportEvent::SendComplete);
                    sink.post(TransportEvent::ReceivingResponse);
                    sink.post(TransportEvent::DataAvailable(0));
                }
                std::thread::yield_now();
            }
        });

        let mut ticks = 0u64;
        while capture.count() < 3 && ticks < 100_000 {
            ticks += 1;
            manager.update(ticks);
            assert!(in_progress_count(&manager) <= 1);
        }
        done.store(1, Ordering::SeqCst);
        firer.join().unwrap();
        assert_eq!(capture.count(), 3);
    }

    #[test]
    fn cancel_queued_and_in_flight() {
        let mock = MockTransport::default();
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        let a = manager.submit(
            RequestArgs::new(Verb::Get, "https://example.com/a").on_complete(capture.hook()),
            0,
        );
        let b = manager.submit(
            RequestArgs::new(Verb::Get, "https://example.com/b").on_complete(capture.hook()),
            0,
        );
        manager.update(1);
        assert_eq!(manager.in_flight(), Some(a));

        // Cancel the in-flight request and the queued one.
        assert!(manager.cancel(a));
        assert!(manager.cancel(b));
        assert!(!manager.cancel(a));
        assert!(!manager.cancel(999));

        manager.update(2);
        assert_eq!(capture.count(), 2);
        for outcome in capture.outcomes.lock().unwrap().iter() {
            assert_eq!(outcome.0, RequestState::Cancelled);
            assert_eq!(outcome.1, Some(HttpError::Cancelled));
        }
        assert_eq!(manager.in_flight(), None);
    }

    #[test]
    fn deadline_times_out_hung_request() {
        let mock = MockTransport::default();
        let mut manager = RequestManager::with_config(
            Arc::new(mock.clone()),
            ManagerConfig {
                request_timeout: Some(100),
                ..ManagerConfig::default()
            },
        );
        let capture = Capture::new();
        let id = manager.submit(
            RequestArgs::new(Verb::Get, "https://example.com/hang").on_complete(capture.hook()),
            0,
        );
        manager.update(0);
        assert_eq!(manager.state_of(id), Some(RequestState::InProgress));
        manager.update(50);
        assert_eq!(capture.count(), 0);
        manager.update(150);
        assert_eq!(capture.count(), 1);
        assert_eq!(
            capture.outcomes.lock().unwrap()[0].1,
            Some(HttpError::TimedOut)
        );
        assert_eq!(manager.in_flight(), None);
    }

    #[test]
    fn freed_slot_is_reused_before_growing() {
        let mock = MockTransport::default();
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        manager.submit(
            RequestArgs::new(Verb::Get, "https://example.com/1").on_complete(capture.hook()),
            0,
        );
        manager.update(1);
        fire(&mock, TransportEvent::SendComplete);
        fire(&mock, TransportEvent::ReceivingResponse);
        fire(&mock, TransportEvent::DataAvailable(0));
        manager.update(2);
        assert_eq!(capture.count(), 1);

        manager.submit(RequestArgs::new(Verb::Get, "https://example.com/2"), 3);
        assert_eq!(lock(&manager.shared).requests.len(), 1);
    }

    #[test]
    fn stale_events_are_dropped() {
        let mock = MockTransport::default();
        let mut manager = manager_with(&mock);
        let capture = Capture::new();
        let a = manager.submit(
            RequestArgs::new(Verb::Get, "https://example.com/a").on_complete(capture.hook()),
            0,
        );
        manager.update(1);
        let stale = mock.shared.lock().unwrap().sink.clone().unwrap();
        fire(&mock, TransportEvent::SendComplete);
        fire(&mock, TransportEvent::ReceivingResponse);
        fire(&mock, TransportEvent::DataAvailable(0));
        manager.update(2);
        assert_eq!(capture.count(), 1);
        assert_eq!(manager.state_of(a), None);

        // Events from the drained request's sink must not disturb the next.
        let b = manager.submit(
            RequestArgs::new(Verb::Get, "https://example.com/b").on_complete(capture.hook()),
            3,
        );
        manager.update(4);
        stale.post(TransportEvent::TransportError("late".to_string()));
        assert_eq!(manager.state_of(b), Some(RequestState::InProgress));
    }

    #[test]
    fn body_and_content_type_are_encoded_at_submit() {
        let mock = MockTransport::default();
        let mut manager = manager_with(&mock);
        manager.submit(
            RequestArgs::new(Verb::Post, "https://example.com/form")
                .content_encoding(ContentEncoding::FormUrlEncoded)
                .content_item("name", "a b")
                .content_item("id", "7"),
            0,
        );
        manager.update(1);
        let shared = mock.shared.lock().unwrap();
        let (header_block, body) = &shared.sends[0];
        assert!(header_block.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
        assert!(header_block.contains("User-Agent: staffetta/"));
        assert_eq!(body, b"name=a%20b&id=7");
    }
}
