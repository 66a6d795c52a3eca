/*
 * tokio_transport.rs
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

//! Tokio-backed transport: HTTP/1.1 over TCP or rustls TLS. Each in-flight
//! request runs as one spawned task that owns the socket; the synchronous
//! trait methods talk to it over a command channel, and the task reports
//! progress through the event sink. Decoded body bytes accumulate in a
//! buffer shared with `read_data`, which only copies and therefore never
//! blocks or posts while the manager lock is held.
//!
//! `connect` is lazy: the pooled connection records the endpoint, and the
//! socket is dialed when the request is sent. Redirects on GET are followed
//! by the task itself, up to [`MAX_REDIRECTS`].

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tokio_rustls::rustls::client::ClientConfig;

use crate::bridge::EventSink;
use crate::codec::decode_header_block;
use crate::net::{self, HttpStream};
use crate::request::Verb;
use crate::transport::{ConnectionHandle, RequestHandle, Transport, TransportEvent};
use crate::uri::parse_url;

const MAX_REDIRECTS: usize = 5;
const MAX_HEADER_SECTION: usize = 64 * 1024;
const READ_CHUNK: usize = 8 * 1024;
/// Cap on decoded body bytes buffered while the owning thread has not yet
/// drained them. Reading pauses at the cap and resumes as the buffer empties.
const BODY_BUFFER_LIMIT: usize = 256 * 1024;

pub struct TokioTransport {
    handle: Handle,
    _runtime: Option<Runtime>,
    tls_config: Arc<ClientConfig>,
    connect_timeout: Duration,
}

impl TokioTransport {
    /// Create a transport with its own two-worker runtime.
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("staffetta-io")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            handle,
            _runtime: Some(runtime),
            tls_config: net::http_client_config(),
            connect_timeout: Duration::from_secs(15),
        })
    }

    /// Run request tasks on an existing runtime instead of owning one.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            _runtime: None,
            tls_config: net::http_client_config(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Pooled endpoint. The socket itself is dialed per request at send time.
struct TokioConnection {
    hostname: String,
    port: u16,
    use_tls: bool,
}

impl ConnectionHandle for TokioConnection {
    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

impl Transport for TokioTransport {
    fn connect(
        &self,
        hostname: &str,
        port: u16,
        use_tls: bool,
    ) -> io::Result<Box<dyn ConnectionHandle>> {
        Ok(Box::new(TokioConnection {
            hostname: hostname.to_string(),
            port,
            use_tls,
        }))
    }

    fn open_request(
        &self,
        connection: &mut dyn ConnectionHandle,
        verb: Verb,
        path_and_query: &str,
        _use_tls: bool,
        sink: EventSink,
    ) -> io::Result<Box<dyn RequestHandle>> {
        let endpoint = connection
            .as_any()
            .downcast_mut::<TokioConnection>()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "foreign connection handle")
            })?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(ResponseShared::default()));
        let task = RequestTask {
            hostname: endpoint.hostname.clone(),
            port: endpoint.port,
            use_tls: endpoint.use_tls,
            verb,
            path_and_query: path_and_query.to_string(),
            tls_config: self.tls_config.clone(),
            connect_timeout: self.connect_timeout,
            shared: shared.clone(),
            sink,
        };
        self.handle.spawn(task.run(command_rx));
        Ok(Box::new(TokioRequestHandle { commands, shared }))
    }
}

enum Command {
    Send { header_block: String, body: Vec<u8> },
    Receive,
    Query,
}

/// Response state shared between the request task and the owning thread.
#[derive(Default)]
struct ResponseShared {
    status: u16,
    raw_headers: String,
    body: VecDeque<u8>,
    finished: bool,
}

fn lock_shared(shared: &Mutex<ResponseShared>) -> MutexGuard<'_, ResponseShared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct TokioRequestHandle {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Mutex<ResponseShared>>,
}

impl TokioRequestHandle {
    fn command(&self, command: Command) -> io::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "request task gone"))
    }
}

impl RequestHandle for TokioRequestHandle {
    fn send(&mut self, header_block: &str, body: &[u8]) -> io::Result<()> {
        self.command(Command::Send {
            header_block: header_block.to_string(),
            body: body.to_vec(),
        })
    }

    fn receive_response(&mut self) -> io::Result<()> {
        self.command(Command::Receive)
    }

    fn query_data_available(&mut self) -> io::Result<()> {
        self.command(Command::Query)
    }

    fn read_data(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut shared = lock_shared(&self.shared);
        let count = buf.len().min(shared.body.len());
        for (slot, byte) in buf.iter_mut().zip(shared.body.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn status_code(&mut self) -> io::Result<u16> {
        let shared = lock_shared(&self.shared);
        if shared.status == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response status not yet available",
            ));
        }
        Ok(shared.status)
    }

    fn raw_headers(&mut self) -> io::Result<String> {
        let shared = lock_shared(&self.shared);
        if shared.status == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response headers not yet available",
            ));
        }
        Ok(shared.raw_headers.clone())
    }
}

struct RequestTask {
    hostname: String,
    port: u16,
    use_tls: bool,
    verb: Verb,
    path_and_query: String,
    tls_config: Arc<ClientConfig>,
    connect_timeout: Duration,
    shared: Arc<Mutex<ResponseShared>>,
    sink: EventSink,
}

impl RequestTask {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        if let Err(event) = self.drive(&mut commands).await {
            self.sink.post(event);
        }
    }

    async fn drive(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), TransportEvent> {
        // Wait for the encoded request. A closed channel means the handle
        // was dropped (cancel); just exit.
        let (header_block, body) = loop {
            match commands.recv().await {
                Some(Command::Send { header_block, body }) => break (header_block, body),
                Some(_) => continue,
                None => return Ok(()),
            }
        };

        let mut hostname = self.hostname.clone();
        let mut port = self.port;
        let mut use_tls = self.use_tls;
        let mut path = self.path_and_query.clone();
        let mut redirects = 0;
        let mut announced_send = false;

        loop {
            let mut stream =
                open_stream(&hostname, port, use_tls, &self.tls_config, self.connect_timeout)
                    .await?;
            let head = request_head(self.verb, &path, &hostname, port, use_tls, &header_block, &body);
            write_request(&mut stream, &head, &body)
                .await
                .map_err(|e| TransportEvent::TransportError(e.to_string()))?;

            if !announced_send {
                announced_send = true;
                self.sink.post(TransportEvent::SendComplete);
                loop {
                    match commands.recv().await {
                        Some(Command::Receive) => break,
                        Some(_) => continue,
                        None => return Ok(()),
                    }
                }
            }

            let (status, raw, residue) = read_header_section(&mut stream)
                .await
                .map_err(|e| TransportEvent::TransportError(e.to_string()))?;
            let headers = decode_header_block(&raw);

            if is_redirect(status) && self.verb == Verb::Get && redirects < MAX_REDIRECTS {
                if let Some(location) = header_value(&headers, "location") {
                    if let Some(target) = redirect_target(location, &hostname, port, use_tls) {
                        hostname = target.0;
                        port = target.1;
                        use_tls = target.2;
                        path = target.3;
                        redirects += 1;
                        self.sink.post(TransportEvent::RedirectFollowed);
                        continue;
                    }
                }
            }

            {
                let mut shared = lock_shared(&self.shared);
                shared.status = status;
                shared.raw_headers = raw;
            }
            self.sink.post(TransportEvent::HeadersAvailable);

            let framing = body_framing(status, &headers);
            self.sink.post(TransportEvent::ReceivingResponse);
            return self.pump_body(commands, stream, residue, framing).await;
        }
    }

    /// Read the response body into the shared buffer while answering data
    /// queries. Returns once the body is complete and a query has been
    /// answered with zero, or once the handle is dropped.
    async fn pump_body<S: AsyncRead + Unpin>(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        mut stream: S,
        residue: BytesMut,
        mut framing: BodyFraming,
    ) -> Result<(), TransportEvent> {
        let mut pending_query = false;
        self.feed(&mut framing, &residue)?;

        let mut buf = [0u8; READ_CHUNK];
        loop {
            let (buffered, finished) = {
                let shared = lock_shared(&self.shared);
                (shared.body.len(), shared.finished)
            };
            if finished {
                // Socket no longer matters; just serve queries until the
                // buffer drains.
                if pending_query {
                    pending_query = false;
                    if self.answer_query() == QueryAnswer::Complete {
                        return Ok(());
                    }
                }
                match commands.recv().await {
                    Some(Command::Query) => {
                        if self.answer_query() == QueryAnswer::Complete {
                            return Ok(());
                        }
                    }
                    Some(_) => {}
                    None => return Ok(()),
                }
                continue;
            }

            // Stop reading at the high-water mark; each query the owning
            // thread sends wakes the loop, so draining resumes the reads.
            let paused = buffered >= BODY_BUFFER_LIMIT;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Query) => match self.answer_query() {
                        QueryAnswer::Complete => return Ok(()),
                        QueryAnswer::Answered => {}
                        QueryAnswer::Deferred => pending_query = true,
                    },
                    Some(_) => {}
                    None => return Ok(()),
                },
                read = stream.read(&mut buf), if !paused => {
                    match read {
                        Ok(0) => self.end_of_stream(&mut framing)?,
                        Ok(n) => self.feed(&mut framing, &buf[..n])?,
                        Err(e) => {
                            return Err(TransportEvent::TransportError(e.to_string()));
                        }
                    }
                    if pending_query {
                        match self.answer_query() {
                            QueryAnswer::Complete => return Ok(()),
                            QueryAnswer::Answered => pending_query = false,
                            QueryAnswer::Deferred => {}
                        }
                    }
                }
            }
        }
    }

    /// Decode raw socket bytes through the framing into the shared buffer.
    fn feed(&self, framing: &mut BodyFraming, input: &[u8]) -> Result<(), TransportEvent> {
        let mut decoded = Vec::new();
        let complete = match framing {
            BodyFraming::Empty => true,
            BodyFraming::Length { remaining } => {
                let take = (*remaining).min(input.len() as u64) as usize;
                decoded.extend_from_slice(&input[..take]);
                *remaining -= take as u64;
                *remaining == 0
            }
            BodyFraming::Chunked(decoder) => decoder
                .feed(input, &mut decoded)
                .map_err(TransportEvent::TransportError)?,
            BodyFraming::UntilClose => {
                decoded.extend_from_slice(input);
                false
            }
        };
        let mut shared = lock_shared(&self.shared);
        shared.body.extend(decoded);
        if complete {
            shared.finished = true;
        }
        Ok(())
    }

    fn end_of_stream(&self, framing: &mut BodyFraming) -> Result<(), TransportEvent> {
        match framing {
            BodyFraming::UntilClose | BodyFraming::Empty => {
                lock_shared(&self.shared).finished = true;
                Ok(())
            }
            BodyFraming::Length { remaining } if *remaining == 0 => {
                lock_shared(&self.shared).finished = true;
                Ok(())
            }
            _ => Err(TransportEvent::TransportError(
                "connection closed mid-body".to_string(),
            )),
        }
    }

    /// Report buffered body bytes for one outstanding query.
    fn answer_query(&self) -> QueryAnswer {
        let (available, finished) = {
            let shared = lock_shared(&self.shared);
            (shared.body.len(), shared.finished)
        };
        // The guard is dropped before posting; the bridge reads the buffer
        // back through read_data under the manager lock.
        if available > 0 {
            self.sink.post(TransportEvent::DataAvailable(available));
            QueryAnswer::Answered
        } else if finished {
            self.sink.post(TransportEvent::DataAvailable(0));
            QueryAnswer::Complete
        } else {
            QueryAnswer::Deferred
        }
    }
}

#[derive(PartialEq, Eq)]
enum QueryAnswer {
    Answered,
    Complete,
    Deferred,
}

async fn open_stream(
    hostname: &str,
    port: u16,
    use_tls: bool,
    tls_config: &Arc<ClientConfig>,
    connect_timeout: Duration,
) -> Result<HttpStream, TransportEvent> {
    let tcp = net::connect_tcp(hostname, port, connect_timeout)
        .await
        .map_err(|e| TransportEvent::TransportError(e.to_string()))?;
    if use_tls {
        let tls = net::wrap_tls(tcp, hostname, tls_config)
            .await
            .map_err(|e| TransportEvent::SecureFailure(e.to_string()))?;
        Ok(HttpStream::Tls(tls))
    } else {
        Ok(HttpStream::Plain(tcp))
    }
}

/// Assemble the request head: request line, Host, caller headers,
/// Content-Length, Connection: close.
fn request_head(
    verb: Verb,
    path_and_query: &str,
    hostname: &str,
    port: u16,
    use_tls: bool,
    header_block: &str,
    body: &[u8],
) -> String {
    let default_port = (use_tls && port == 443) || (!use_tls && port == 80);
    let mut head = String::with_capacity(256 + header_block.len());
    head.push_str(verb.as_str());
    head.push(' ');
    head.push_str(path_and_query);
    head.push_str(" HTTP/1.1\r\nHost: ");
    head.push_str(hostname);
    if !default_port {
        head.push(':');
        head.push_str(&port.to_string());
    }
    head.push_str("\r\n");
    head.push_str(header_block);
    if !body.is_empty() || matches!(verb, Verb::Post | Verb::Put) {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("Connection: close\r\n\r\n");
    head
}

async fn write_request(stream: &mut HttpStream, head: &str, body: &[u8]) -> io::Result<()> {
    stream.write_all(head.as_bytes()).await?;
    if !body.is_empty() {
        stream.write_all(body).await?;
    }
    stream.flush().await
}

/// Read up to the header/body boundary. Returns the status code, the raw
/// header block (without the status line), and any body bytes already read.
async fn read_header_section(stream: &mut HttpStream) -> io::Result<(u16, String, BytesMut)> {
    let mut buf = BytesMut::with_capacity(4096);
    let boundary = loop {
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_HEADER_SECTION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response header section too large",
            ));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response headers",
            ));
        }
    };

    let head = String::from_utf8_lossy(&buf[..boundary]).into_owned();
    let mut residue = buf;
    residue.advance(boundary + 4);

    let (status_line, raw) = match head.split_once("\r\n") {
        Some((line, rest)) => (line, rest.to_string()),
        None => (head.as_str(), String::new()),
    };
    let status = parse_status_line(status_line)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed status line"))?;
    Ok((status, raw, residue))
}

fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Resolve a Location header against the current endpoint. Returns
/// (hostname, port, use_tls, path_and_query), or None for targets that
/// cannot be followed.
fn redirect_target(
    location: &str,
    hostname: &str,
    port: u16,
    use_tls: bool,
) -> Option<(String, u16, bool, String)> {
    if location.starts_with('/') {
        return Some((
            hostname.to_string(),
            port,
            use_tls,
            location.to_string(),
        ));
    }
    if location.starts_with("http://") || location.starts_with("https://") {
        let parts = parse_url(location);
        if parts.hostname.is_empty() {
            return None;
        }
        return Some((
            parts.hostname.clone(),
            parts.effective_port(),
            parts.use_tls(),
            parts.path_and_query(),
        ));
    }
    None
}

enum BodyFraming {
    /// No body (204, 304).
    Empty,
    Length {
        remaining: u64,
    },
    Chunked(ChunkDecoder),
    UntilClose,
}

fn body_framing(status: u16, headers: &[(String, String)]) -> BodyFraming {
    if status == 204 || status == 304 {
        return BodyFraming::Empty;
    }
    if let Some(te) = header_value(headers, "transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return BodyFraming::Chunked(ChunkDecoder::new());
        }
    }
    if let Some(len) = header_value(headers, "content-length") {
        if let Ok(remaining) = len.trim().parse::<u64>() {
            if remaining == 0 {
                return BodyFraming::Empty;
            }
            return BodyFraming::Length { remaining };
        }
    }
    BodyFraming::UntilClose
}

/// Incremental chunked-transfer decoder. Feed raw bytes in any split;
/// decoded body bytes land in `out`.
struct ChunkDecoder {
    pending: BytesMut,
    remaining: usize,
    phase: ChunkPhase,
}

#[derive(PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data,
    DataCrlf,
    Trailer,
    Done,
}

impl ChunkDecoder {
    fn new() -> Self {
        Self {
            pending: BytesMut::new(),
            remaining: 0,
            phase: ChunkPhase::Size,
        }
    }

    /// Returns true once the terminal chunk and trailers are consumed.
    fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<bool, String> {
        self.pending.extend_from_slice(input);
        loop {
            match self.phase {
                ChunkPhase::Size => {
                    let Some(eol) = find_subsequence(&self.pending, b"\r\n") else {
                        return Ok(false);
                    };
                    let line = String::from_utf8_lossy(&self.pending[..eol]).into_owned();
                    self.pending.advance(eol + 2);
                    let size_text = line.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_text, 16)
                        .map_err(|_| format!("bad chunk size \"{}\"", size_text))?;
                    if size == 0 {
                        self.phase = ChunkPhase::Trailer;
                    } else {
                        self.remaining = size;
                        self.phase = ChunkPhase::Data;
                    }
                }
                ChunkPhase::Data => {
                    if self.pending.is_empty() {
                        return Ok(false);
                    }
                    let take = self.remaining.min(self.pending.len());
                    out.extend_from_slice(&self.pending[..take]);
                    self.pending.advance(take);
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.phase = ChunkPhase::DataCrlf;
                    }
                }
                ChunkPhase::DataCrlf => {
                    if self.pending.len() < 2 {
                        return Ok(false);
                    }
                    if &self.pending[..2] != b"\r\n" {
                        return Err("missing CRLF after chunk data".to_string());
                    }
                    self.pending.advance(2);
                    self.phase = ChunkPhase::Size;
                }
                ChunkPhase::Trailer => {
                    let Some(eol) = find_subsequence(&self.pending, b"\r\n") else {
                        return Ok(false);
                    };
                    let empty = eol == 0;
                    self.pending.advance(eol + 2);
                    if empty {
                        self.phase = ChunkPhase::Done;
                        return Ok(true);
                    }
                }
                ChunkPhase::Done => return Ok(true),
            }
        }
    }
}
