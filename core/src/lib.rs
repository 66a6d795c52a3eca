/*
 * lib.rs
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

//! Staffetta: a polled asynchronous HTTP(S) client.
//!
//! One owning thread submits requests and drives completion by calling
//! [`RequestManager::update`] periodically; network I/O runs elsewhere and
//! reports back through the callback bridge. At most one request is in
//! flight at a time, the rest queue. Completion callbacks fire exactly
//! once, on the owning thread, inside an update tick.
//!
//! ```no_run
//! use staffetta_core::{RequestArgs, RequestManager, TokioTransport, Verb};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(TokioTransport::new().unwrap());
//! let mut manager = RequestManager::new(transport);
//! manager.submit(
//!     RequestArgs::new(Verb::Get, "https://example.com/").on_complete(|outcome| {
//!         println!("{} bytes, status {}", outcome.bytes.len(), outcome.status_code);
//!     }),
//!     0,
//! );
//! loop {
//!     manager.update(now_millis());
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! # fn now_millis() -> u64 { 0 }
//! ```

pub mod arena;
pub mod bridge;
pub mod codec;
pub mod error;
pub mod manager;
pub mod net;
mod pool;
pub mod request;
pub mod tokio_transport;
pub mod transport;
pub mod uri;

pub use arena::{ResponseArena, DEFAULT_RESPONSE_LIMIT};
pub use bridge::EventSink;
pub use codec::ContentEncoding;
pub use error::HttpError;
pub use manager::{ManagerConfig, RequestManager};
pub use request::{RequestArgs, RequestId, RequestOutcome, RequestState, Verb};
pub use tokio_transport::TokioTransport;
pub use transport::{ConnectionHandle, RequestHandle, Transport, TransportEvent};
pub use uri::{parse_url, UrlParts};
