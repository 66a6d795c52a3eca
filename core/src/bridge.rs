/*
 * bridge.rs
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

//! Callback bridge: transport events arrive here on threads the application
//! does not control and are applied to the in-flight request under the
//! manager mutex. Because transports deliver events asynchronously (never
//! from inside a manager-invoked call), the bridge can always take the lock;
//! there is no owning-thread reentrancy special case.
//!
//! The bridge mutates request state only. It never clears the current index
//! and never fires callbacks; the next update tick observes the terminal
//! state, migrates the response bytes, and drains the slot on the owning
//! thread.

use std::sync::Arc;

use crate::error::HttpError;
use crate::manager::{ManagerShared, ManagerState};
use crate::request::{Request, RequestId, RequestState};
use crate::transport::TransportEvent;

/// Where a transport posts events for one request. Cloned freely; each sink
/// is bound to the request id it was created for, so events from a stale
/// handle (cancelled or already-drained request) are dropped.
#[derive(Clone)]
pub struct EventSink {
    shared: Arc<ManagerShared>,
    request_id: RequestId,
}

impl EventSink {
    pub(crate) fn new(shared: Arc<ManagerShared>, request_id: RequestId) -> Self {
        Self { shared, request_id }
    }

    /// Apply one transport event to the in-flight request. Takes the
    /// manager mutex; must never be called while the caller already holds
    /// it (see the delivery contract on [`crate::transport::Transport`]).
    pub fn post(&self, event: TransportEvent) {
        let mut guard = match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let ManagerState {
            requests, arena, current, ..
        } = &mut *guard;
        let Some(cur) = *current else {
            return;
        };
        let request = &mut requests[cur];
        if request.id != self.request_id || request.state != RequestState::InProgress {
            return;
        }

        match event {
            TransportEvent::SendComplete => {
                let result = match request.handle.as_mut() {
                    Some(handle) => handle.receive_response(),
                    None => return,
                };
                if let Err(err) = result {
                    eprintln!("[http] receive failed for request {}: {}", request.id, err);
                    fail(request, HttpError::TransportError);
                }
            }
            TransportEvent::ReceivingResponse => {
                request.receiving_data = true;
            }
            TransportEvent::HeadersAvailable => {
                // Parsing needs the owning thread's scratch context, so only
                // flag it here; update does the actual query and decode.
                request.headers_pending = true;
            }
            TransportEvent::DataAvailable(0) => {
                request.receiving_data = false;
                request.state = RequestState::Success;
            }
            TransportEvent::DataAvailable(count) => {
                match arena.append(count) {
                    Ok(dst) => {
                        let result = match request.handle.as_mut() {
                            Some(handle) => handle.read_data(dst),
                            None => return,
                        };
                        match result {
                            Ok(got) if got < count => arena.truncate_last(count - got),
                            Ok(_) => {}
                            Err(err) => {
                                eprintln!(
                                    "[http] read failed for request {}: {}",
                                    request.id, err
                                );
                                // Nothing valid was written; give the whole
                                // reservation back.
                                arena.truncate_last(count);
                                fail(request, HttpError::TransportError);
                            }
                        }
                    }
                    Err(full) => {
                        eprintln!("[http] request {}: {}", request.id, full);
                        fail(request, HttpError::ResponseTooLarge);
                    }
                }
                request.queried_data = false;
            }
            TransportEvent::ReadComplete => {
                // Sanity only; nothing to do when the sequence is healthy.
                if !request.receiving_data {
                    eprintln!(
                        "[http] read-complete for request {} while not receiving",
                        request.id
                    );
                }
            }
            TransportEvent::RedirectFollowed => {
                // The transport follows the redirect itself and will signal
                // receiving again for the new location.
                request.receiving_data = false;
            }
            TransportEvent::TransportError(message) => {
                eprintln!("[http] request {} transport error: {}", request.id, message);
                fail(request, HttpError::TransportError);
            }
            TransportEvent::SecureFailure(message) => {
                eprintln!("[http] request {} TLS failure: {}", request.id, message);
                fail(request, HttpError::SecureFailure);
            }
        }
    }
}

fn fail(request: &mut Request, error: HttpError) {
    request.state = RequestState::Failure;
    request.error = Some(error);
    request.receiving_data = false;
}
