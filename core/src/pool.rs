/*
 * pool.rs
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

//! Connection pool: exactly one connection per distinct (hostname, port),
//! reused for the manager's lifetime. Connections are opened only from the
//! owning thread and are never closed or evicted; every pair opened during
//! the process lifetime stays open. An idle-timeout eviction pass would be
//! the fix if that ever matters (`last_used` is tracked for it).

use std::io;

use crate::transport::{ConnectionHandle, Transport};

/// One pooled transport connection. Identity key is (hostname, port).
#[allow(dead_code)]
pub(crate) struct Connection {
    pub hostname: String,
    pub port: u16,
    pub use_tls: bool,
    pub opened_at: u64,
    pub last_used: u64,
    pub handle: Box<dyn ConnectionHandle>,
}

/// Append-only pool of connections, indexed by position.
pub(crate) struct ConnectionPool {
    connections: Vec<Connection>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            connections: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Connection {
        &mut self.connections[index]
    }

    /// Look up an existing connection for (hostname, port).
    pub fn find(&self, hostname: &str, port: u16) -> Option<usize> {
        self.connections
            .iter()
            .position(|c| c.hostname == hostname && c.port == port)
    }

    /// Open a new connection through the transport and append it.
    pub fn open(
        &mut self,
        transport: &dyn Transport,
        hostname: &str,
        port: u16,
        use_tls: bool,
        now: u64,
    ) -> io::Result<usize> {
        let handle = transport.connect(hostname, port, use_tls)?;
        eprintln!(
            "[http] connection {} to {}:{}{}",
            self.connections.len(),
            hostname,
            port,
            if use_tls { " using TLS" } else { "" }
        );
        self.connections.push(Connection {
            hostname: hostname.to_string(),
            port,
            use_tls,
            opened_at: now,
            last_used: now,
            handle,
        });
        Ok(self.connections.len() - 1)
    }

    /// Find an existing connection or open one, updating `last_used`.
    pub fn find_or_open(
        &mut self,
        transport: &dyn Transport,
        hostname: &str,
        port: u16,
        use_tls: bool,
        now: u64,
    ) -> io::Result<usize> {
        let index = match self.find(hostname, port) {
            Some(index) => index,
            None => self.open(transport, hostname, port, use_tls, now)?,
        };
        self.connections[index].last_used = now;
        Ok(index)
    }
}
