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

//! A `TcpListener` abstraction generic over `mio::net::TcpListener` (the
//! production transport) and `std::net::TcpListener`.

use std::io::{Error, Result};
use std::net::SocketAddr;

use super::tcp_stream::TcpStream;

/// The subset of listener operations the server acceptor needs.
pub trait TcpListener<S: TcpStream> {
    /// Bind a listening socket.
    fn bind(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized;

    /// Accept one pending connection, or `WouldBlock`.
    fn accept(&self) -> Result<(S, SocketAddr)>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Set the IP time-to-live applied to accepted sockets.
    fn set_ttl(&self, ttl: u32) -> Result<()>;

    /// Current IP time-to-live.
    fn ttl(&self) -> Result<u32>;

    /// Take and clear the socket's pending error, if any.
    fn take_error(&self) -> Result<Option<Error>>;
}

type MTcpListener = mio::net::TcpListener;
type MTcpStream = mio::net::TcpStream;

impl TcpListener<MTcpStream> for MTcpListener {
    #[inline]
    fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind(addr)
    }

    #[inline]
    fn accept(&self) -> Result<(MTcpStream, SocketAddr)> {
        Self::accept(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
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
}

type STcpListener = std::net::TcpListener;
type STcpStream = std::net::TcpStream;

impl TcpListener<STcpStream> for STcpListener {
    #[inline]
    fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind(addr)
    }

    #[inline]
    fn accept(&self) -> Result<(STcpStream, SocketAddr)> {
        Self::accept(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
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
}
