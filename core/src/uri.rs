/*
 * uri.rs
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

//! Request URL splitting: protocol, hostname, port, path, query, fragment.
//! Pure and total over any input string; malformed input yields empty
//! components and the caller rejects them before connecting. The fragment is
//! parsed but never forwarded to the transport.

pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

/// Parsed pieces of a request URL. All owned so the caller's URL buffer can
/// be freed immediately after submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    /// Scheme without "://". Defaults to "https" when absent.
    pub protocol: String,
    /// Host without port. Empty when the URL is malformed.
    pub hostname: String,
    /// Explicit port from the authority, if any.
    pub port: Option<u16>,
    /// Absolute path. Defaults to "/".
    pub path: String,
    /// Query string without the leading '?'. Empty when absent.
    pub query: String,
    /// Fragment without the leading '#'. Split off but not sent on the wire.
    pub fragment: String,
}

impl UrlParts {
    /// True when the scheme calls for TLS.
    pub fn use_tls(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("https")
    }

    /// Effective port: explicit, else 443 for https and 80 for http.
    pub fn effective_port(&self) -> u16 {
        self.port
            .unwrap_or(if self.use_tls() { HTTPS_PORT } else { HTTP_PORT })
    }

    /// Request-target sent to the transport: path plus "?query". The
    /// fragment is deliberately excluded.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

/// Split a URL into its parts. Never fails: a URL without a scheme is
/// treated as https, a URL without a path gets "/", and a URL without a
/// hostname yields an empty hostname (rejected later with UrlParse).
pub fn parse_url(url: &str) -> UrlParts {
    let url = url.trim();

    let (protocol, rest) = match url.find("://") {
        Some(n) => (url[..n].to_ascii_lowercase(), &url[n + 3..]),
        None => ("https".to_string(), url),
    };

    // Fragment first so '?' inside the fragment is not mistaken for a query.
    let (rest, fragment) = match rest.find('#') {
        Some(n) => (&rest[..n], rest[n + 1..].to_string()),
        None => (rest, String::new()),
    };

    let (rest, query) = match rest.find('?') {
        Some(n) => (&rest[..n], rest[n + 1..].to_string()),
        None => (rest, String::new()),
    };

    let (authority, path) = match rest.find('/') {
        Some(n) => (&rest[..n], rest[n..].to_string()),
        None => (rest, "/".to_string()),
    };

    // Userinfo is not supported for HTTP requests; strip it if present.
    let authority = match authority.rfind('@') {
        Some(n) => &authority[n + 1..],
        None => authority,
    };

    let (hostname, port) = match authority.rfind(':') {
        Some(n) => match authority[n + 1..].parse::<u16>() {
            Ok(p) => (authority[..n].to_string(), Some(p)),
            Err(_) => (authority.to_string(), None),
        },
        None => (authority.to_string(), None),
    };

    UrlParts {
        protocol,
        hostname,
        port,
        path,
        query,
        fragment,
    }
}
