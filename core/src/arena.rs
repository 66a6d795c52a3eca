/*
 * arena.rs
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

//! Shared response buffer: one growable, resettable byte buffer with a fixed
//! ceiling. Because at most one request is in flight, the buffer is
//! implicitly owned by whichever request is currently receiving data; the
//! manager resets it the instant the bytes are migrated out. Backing storage
//! is a lazily growing BytesMut, so an idle manager costs almost nothing.

use bytes::BytesMut;
use std::fmt;

/// Default ceiling for one response body: 64 MiB.
pub const DEFAULT_RESPONSE_LIMIT: usize = 64 * 1024 * 1024;

/// Appending would have grown the buffer past its ceiling. The request that
/// owns the bytes fails with ResponseTooLarge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaFull {
    pub requested: usize,
    pub limit: usize,
}

impl fmt::Display for ArenaFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "response buffer full: {} more bytes over the {} byte ceiling",
            self.requested, self.limit
        )
    }
}

impl std::error::Error for ArenaFull {}

/// Growable response buffer with a fixed ceiling.
pub struct ResponseArena {
    buf: BytesMut,
    limit: usize,
}

impl ResponseArena {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Reserve `count` more bytes and return the destination to write into.
    /// Fails cleanly when the ceiling would be exceeded; the buffer is left
    /// unchanged in that case.
    pub fn append(&mut self, count: usize) -> Result<&mut [u8], ArenaFull> {
        let len = self.buf.len();
        if count > self.limit || len > self.limit - count {
            return Err(ArenaFull {
                requested: count,
                limit: self.limit,
            });
        }
        self.buf.resize(len + count, 0);
        Ok(&mut self.buf[len..])
    }

    /// Give back the tail of the last append when the transport delivered
    /// fewer bytes than it announced.
    pub fn truncate_last(&mut self, unused: usize) {
        let len = self.buf.len();
        self.buf.truncate(len.saturating_sub(len.min(unused)));
    }

    /// Copy the accumulated bytes out to permanent storage and reset to
    /// empty. The arena is ready for the next request immediately.
    pub fn take(&mut self) -> Vec<u8> {
        let bytes = self.buf.to_vec();
        self.buf.clear();
        bytes
    }

    /// Discard the accumulated bytes without copying.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}
