// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A `TcpStream` abstraction generic over `mio::net::TcpStream` (the
//! production transport) and `std::net::TcpStream` (useful for
//! non-`mio`-driven tests and tooling).

use std::io::{Error, Result};
use std::net::{Shutdown, SocketAddr};

/// The subset of socket operations the connection state machine needs,
/// factored out so the rest of the crate never names `mio::net::TcpStream`
/// directly.
pub trait TcpStream {
    /// Open an outgoing connection (client side).
    fn connect(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized;

    /// The remote address.
    fn peer_addr(&self) -> Result<SocketAddr>;

    /// The local address.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Shut down one or both halves of the connection.
    fn shutdown(&self, how: Shutdown) -> Result<()>;

    /// Toggle Nagle's algorithm.
    fn set_nodelay(&self, nodelay: bool) -> Result<()>;

    /// Current Nagle's algorithm setting.
    fn nodelay(&self) -> Result<bool>;

    /// Set the IP time-to-live.
    fn set_ttl(&self, ttl: u32) -> Result<()>;

    /// Current IP time-to-live.
    fn ttl(&self) -> Result<u32>;

    /// Take and clear the socket's pending error, if any.
    fn take_error(&self) -> Result<Option<Error>>;

    /// Peek at incoming bytes without consuming them.
    fn peek(&self, buf: &mut [u8]) -> Result<usize>;
}

impl TcpStream for mio::net::TcpStream {
    #[inline]
    fn connect(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized,
    {
        Self::connect(addr)
    }

    #[inline]
    fn peer_addr(&self) -> Result<SocketAddr> {
        Self::peer_addr(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
    }

    #[inline]
    fn shutdown(&self, how: Shutdown) -> Result<()> {
        Self::shutdown(self, how)
    }

    #[inline]
    fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Self::set_nodelay(self, nodelay)
    }

    #[inline]
    fn nodelay(&self) -> Result<bool> {
        Self::nodelay(self)
    }

    #[inline]
    fn set_ttl(&self, ttl: u32) -> Result<()> {
        Self::set_ttl(self, ttl)
    }

    #[inline]
    fn ttl(&self) -> Result<u32> {
        Self::ttl(self)
    }

    #[inline]
    fn take_error(&self) -> Result<Option<Error>> {
        Self::take_error(self)
    }

    #[inline]
    fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        Self::peek(self, buf)
    }
}

impl TcpStream for std::net::TcpStream {
    #[inline]
    fn connect(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized,
    {
        Self::connect(addr)
    }

    #[inline]
    fn peer_addr(&self) -> Result<SocketAddr> {
        Self::peer_addr(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
    }

    #[inline]
    fn shutdown(&self, how: Shutdown) -> Result<()> {
        Self::shutdown(self, how)
    }

    #[inline]
    fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Self::set_nodelay(self, nodelay)
    }

    #[inline]
    fn nodelay(&self) -> Result<bool> {
        Self::nodelay(self)
    }

    #[inline]
    fn set_ttl(&self, ttl: u32) -> Result<()> {
        Self::set_ttl(self, ttl)
    }

    #[inline]
    fn ttl(&self) -> Result<u32> {
        Self::ttl(self)
    }

    #[inline]
    fn take_error(&self) -> Result<Option<Error>> {
        Self::take_error(self)
    }

    #[inline]
    fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        Self::peek(self, buf)
    }
}
