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

//! The server acceptor: owns the listening socket and a vector of
//! participating workers, and hands freshly accepted sockets to them
//! round-robin. The acceptor never touches application state, it only ever
//! sees the raw transport `S`, never a [`crate::connection::Connection`]
//! or [`crate::connection::ConnectionHandler`].
//!
//! A `mio`-polled listening socket plus a set of outbound channels to
//! workers, with the worker side driven by [`crate::worker::WorkerCommand`].

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::{event::Source, Events, Interest, Poll, Token};

use crate::net::{TcpListener, TcpStream};
use crate::worker::{ServerId, WorkerCommand, WorkerSender};

const LISTEN_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Lifecycle states for a bound server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, not yet listening.
    Initializing,
    /// Listening socket is bound; acceptor thread not yet started.
    Bound,
    /// Accepting and routing connections.
    Running,
    /// No longer accepting; in-flight connections finish on their own.
    Draining,
    /// Terminal: the listening socket has been released.
    Stopped,
}

impl ServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServerState::Initializing,
            1 => ServerState::Bound,
            2 => ServerState::Running,
            3 => ServerState::Draining,
            _ => ServerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Control messages a [`ServerRef`] sends to its acceptor thread.
pub(crate) enum AcceptorCommand {
    /// Stop accepting; let in-flight connections finish on their own workers.
    Drain,
    /// Stop immediately and release the listening socket.
    Stop,
}

/// A handle to a bound server: its name, listen address, and current
/// lifecycle state.
///
/// Cheap to clone; every clone observes the same underlying state and can
/// drive the same acceptor thread.
#[derive(Clone)]
pub struct ServerRef {
    id: ServerId,
    name: String,
    local_addr: SocketAddr,
    state: Arc<AtomicU8>,
    control: Sender<AcceptorCommand>,
}

impl ServerRef {
    pub(crate) fn new(
        id: ServerId,
        name: String,
        local_addr: SocketAddr,
        state: Arc<AtomicU8>,
        control: Sender<AcceptorCommand>,
    ) -> Self {
        Self {
            id,
            name,
            local_addr,
            state,
            control,
        }
    }

    /// This server's id within its owning [`crate::iosystem::IOSystem`].
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// The name this server was bound with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address the listening socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Stop accepting new connections but let connections already handed to
    /// workers finish on their own.
    pub fn drain(&self) {
        let _ = self.control.send(AcceptorCommand::Drain);
    }

    /// Stop immediately and release the listening socket.
    pub fn stop(&self) {
        let _ = self.control.send(AcceptorCommand::Stop);
    }
}

/// Owns the listening socket; accepts and routes to workers round-robin.
/// Runs on its own thread, independent of every worker's event loop.
pub(crate) struct Acceptor<T, S> {
    id: ServerId,
    name: String,
    listener: T,
    poll: Poll,
    events: Events,
    workers: Vec<WorkerSender<S>>,
    next_worker: usize,
    control: Receiver<AcceptorCommand>,
    state: Arc<AtomicU8>,
    draining: bool,
}

impl<T, S> Acceptor<T, S>
where
    T: TcpListener<S> + Source,
    S: TcpStream + io::Read + io::Write + Source + Send + 'static,
{
    /// Bind the listening socket and register it for readability. Returns
    /// the acceptor plus the control-channel sender a [`ServerRef`] uses to
    /// drain/stop it; the acceptor does not start accepting until
    /// [`Acceptor::run`] is called on its own thread.
    pub(crate) fn bind(
        id: ServerId,
        name: String,
        addr: SocketAddr,
        workers: Vec<WorkerSender<S>>,
        state: Arc<AtomicU8>,
    ) -> io::Result<(Self, Sender<AcceptorCommand>)> {
        assert!(!workers.is_empty(), "acceptor needs at least one worker");

        let mut listener = T::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        state.store(ServerState::Bound.as_u8(), Ordering::Release);

        let (tx, rx) = crossbeam_channel::unbounded();
        Ok((
            Self {
                id,
                name,
                listener,
                poll,
                events: Events::with_capacity(256),
                workers,
                next_worker: 0,
                control: rx,
                state,
                draining: false,
            },
            tx,
        ))
    }

    /// The address the listener actually bound to (relevant when `addr`'s
    /// port was `0`).
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Accept every socket currently pending, routing each to the next
    /// worker in round-robin order. No coordination, no locks on the hot
    /// path.
    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let worker = &self.workers[self.next_worker];
                    log::trace!(
                        "server {}: accepted {peer}, routing to worker {}",
                        self.name,
                        worker.id()
                    );
                    worker.send(WorkerCommand::NewConnection { stream, server: self.id });
                    self.next_worker = (self.next_worker + 1) % self.workers.len();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("server {}: accept failed: {e}", self.name);
                    return;
                }
            }
        }
    }

    fn drain_control(&mut self) {
        while let Ok(command) = self.control.try_recv() {
            match command {
                AcceptorCommand::Drain => {
                    if !self.draining {
                        log::info!("server {}: draining", self.name);
                    }
                    self.draining = true;
                    self.state.store(ServerState::Draining.as_u8(), Ordering::Release);
                }
                AcceptorCommand::Stop => {
                    self.draining = true;
                    self.state.store(ServerState::Stopped.as_u8(), Ordering::Release);
                }
            }
        }
    }

    /// Run until a `Stop` command is received. Accepts in a loop,
    /// round-robining to workers, until told to drain or stop. `Draining`
    /// only suppresses new accepts, it does not end the loop: the acceptor
    /// keeps polling its control channel so a subsequent `Stop` is still
    /// observed.
    pub(crate) fn run(&mut self) {
        self.state.store(ServerState::Running.as_u8(), Ordering::Release);
        log::info!("server {}: listening on {:?}", self.name, self.listener.local_addr());

        loop {
            self.drain_control();
            if self.state() == ServerState::Stopped {
                break;
            }

            if let Err(e) = self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                log::error!("server {}: poll failed: {e}", self.name);
                break;
            }

            if self.draining {
                continue;
            }

            if self.events.iter().any(|e| e.token() == LISTEN_TOKEN) {
                self.accept_all();
            }
        }

        log::info!("server {}: acceptor stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU8;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ServerState::Initializing,
            ServerState::Bound,
            ServerState::Running,
            ServerState::Draining,
            ServerState::Stopped,
        ] {
            assert_eq!(ServerState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn server_ref_reflects_shared_state() {
        let state = Arc::new(AtomicU8::new(ServerState::Initializing.as_u8()));
        let (tx, _rx) = crossbeam_channel::unbounded();
        let server_ref = ServerRef::new(
            ServerId(0),
            "test".into(),
            "127.0.0.1:0".parse().unwrap(),
            state.clone(),
            tx,
        );
        assert_eq!(server_ref.state(), ServerState::Initializing);
        state.store(ServerState::Running.as_u8(), Ordering::Release);
        assert_eq!(server_ref.state(), ServerState::Running);
    }

    #[test]
    fn drain_then_stop_transition_state() {
        let state = Arc::new(AtomicU8::new(ServerState::Running.as_u8()));
        let (tx, rx) = crossbeam_channel::unbounded();
        let server_ref = ServerRef::new(
            ServerId(0),
            "test".into(),
            "127.0.0.1:0".parse().unwrap(),
            state,
            tx,
        );
        server_ref.drain();
        assert!(matches!(rx.try_recv().unwrap(), AcceptorCommand::Drain));
        server_ref.stop();
        assert!(matches!(rx.try_recv().unwrap(), AcceptorCommand::Stop));
    }
}
