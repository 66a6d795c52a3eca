/*
 * transport.rs
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

//! The transport seam: the asynchronous HTTP/TLS engine this subsystem
//! drives but never reimplements. The manager calls the trait methods from
//! the owning thread; the transport delivers [`TransportEvent`]s back
//! through the [`EventSink`](crate::bridge::EventSink) it was given at
//! `open_request`, from threads the application does not control.
//!
//! Delivery contract: events must be posted from outside any
//! manager-invoked call (never synchronously inside `send`,
//! `query_data_available`, etc.), and `read_data` must not post at all — it
//! runs while the manager lock is held. This always-async rule is what lets
//! the bridge take the manager mutex unconditionally.

use std::any::Any;
use std::io;

use crate::bridge::EventSink;
use crate::request::Verb;

/// Asynchronous event from the transport, bridged into the request state
/// machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The encoded request went out; the manager starts receiving.
    SendComplete,
    /// Response headers arrived; status/raw headers may now be queried.
    HeadersAvailable,
    /// The response body is ready to be polled for data.
    ReceivingResponse,
    /// Answer to `query_data_available`: this many bytes can be read now.
    /// Zero means the body is complete.
    DataAvailable(usize),
    /// A `read_data` round finished. Informational only.
    ReadComplete,
    /// The transport followed a redirect itself; receiving restarts.
    RedirectFollowed,
    /// Transport-level failure (connect, I/O, protocol).
    TransportError(String),
    /// TLS-level failure.
    SecureFailure(String),
}

/// Factory for connections and per-request handles.
pub trait Transport: Send + Sync {
    /// Open (or prepare) a connection to host:port. Implementations may
    /// defer actual network I/O until the first send; either way this is
    /// called only from the owning thread.
    fn connect(
        &self,
        hostname: &str,
        port: u16,
        use_tls: bool,
    ) -> io::Result<Box<dyn ConnectionHandle>>;

    /// Open a per-request handle bound to an existing connection. Events for
    /// this request are posted through `sink`.
    fn open_request(
        &self,
        connection: &mut dyn ConnectionHandle,
        verb: Verb,
        path_and_query: &str,
        use_tls: bool,
        sink: EventSink,
    ) -> io::Result<Box<dyn RequestHandle>>;
}

/// Opaque pooled connection owned by the manager for its whole lifetime.
pub trait ConnectionHandle: Send {
    /// Downcast hook so a transport can recover its concrete type.
    fn as_any(&mut self) -> &mut dyn Any;
}

/// One in-flight request on the transport. All methods are non-blocking;
/// answers arrive as [`TransportEvent`]s.
pub trait RequestHandle: Send {
    /// Submit the request asynchronously: pre-encoded header block plus
    /// body. Completion is signalled by `SendComplete`.
    fn send(&mut self, header_block: &str, body: &[u8]) -> io::Result<()>;

    /// Begin receiving the response; headers are signalled by
    /// `HeadersAvailable`.
    fn receive_response(&mut self) -> io::Result<()>;

    /// Ask how many body bytes can be read; the answer arrives as a later
    /// `DataAvailable` event.
    fn query_data_available(&mut self) -> io::Result<()>;

    /// Copy available body bytes into `buf`, returning how many were
    /// written. Valid once `DataAvailable` has fired; runs under the manager
    /// lock and must not block or post events.
    fn read_data(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Response status code. Valid once `HeadersAvailable` has fired.
    fn status_code(&mut self) -> io::Result<u16>;

    /// Raw response header block. Valid once `HeadersAvailable` has fired.
    fn raw_headers(&mut self) -> io::Result<String>;
}
