/*
 * error.rs
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

//! Per-request error kinds. Recorded on the request (state Failure) and
//! surfaced exactly once through the completion callback; there is no
//! separate error channel.

use std::fmt;

/// Why a request failed. A request that fails always reaches a terminal
/// state and fires its callback exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    /// The URL had an empty or unparseable hostname.
    UrlParse,
    /// The transport refused to open a connection to the host.
    ConnectFailed,
    /// The transport refused to open a per-request handle on the connection.
    OpenRequestFailed,
    /// Submitting the encoded request to the transport failed.
    SendFailed,
    /// TLS-level failure reported by the transport.
    SecureFailure,
    /// Any other transport-level failure.
    TransportError,
    /// The response body would have exceeded the response buffer ceiling.
    ResponseTooLarge,
    /// No terminal transport event arrived before the request deadline.
    TimedOut,
    /// The request was cancelled via `RequestManager::cancel`.
    Cancelled,
}

impl HttpError {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpError::UrlParse => "UrlParse",
            HttpError::ConnectFailed => "ConnectFailed",
            HttpError::OpenRequestFailed => "OpenRequestFailed",
            HttpError::SendFailed => "SendFailed",
            HttpError::SecureFailure => "SecureFailure",
            HttpError::TransportError => "TransportError",
            HttpError::ResponseTooLarge => "ResponseTooLarge",
            HttpError::TimedOut => "TimedOut",
            HttpError::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::error::Error for HttpError {}
