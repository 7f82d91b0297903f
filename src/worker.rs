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

//! The single-threaded event loop.
//!
//! A `Worker<S>` owns a `mio::Poll`, a table of bound items keyed by context
//! id, a [`crate::timer::TimingWheel`], and an inbox of [`WorkerCommand`]s.
//! Everything that touches a connection, its handler, or its encoder
//! pipeline happens on the worker's own thread, that is the single
//! invariant the rest of the crate is built to preserve.
//!
//! `Worker` is generic over the transport `S` because it owns and polls
//! concrete sockets. [`WorkerHandle`], by contrast, the thing a
//! [`crate::context::Context`] carries, is transport-erased: it is the
//! seam that lets a handler hold a reference back to its worker without
//! needing to name `S` anywhere in its own type.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::{event::Source, Events, Poll, Token};

use crate::callback::{AsyncPromise, Callback};
use crate::config::Config;
use crate::connection::{Connection, ConnectionItem, DisconnectReason};
use crate::context::Context;
use crate::error::CallbackError;
use crate::initializer::Initializer;
use crate::metrics::WorkerMetrics;
use crate::net::TcpStream;
use crate::timer::{TimerAction, TimingWheel};

const WAKE_TOKEN: Token = Token(usize::MAX);
/// Drain at most this many inbox commands per loop turn before polling
/// readiness, so a command flood on one worker cannot starve its
/// connections.
const INBOX_FAIRNESS_BOUND: usize = 1024;
const TICK: Duration = Duration::from_millis(100);
const WHEEL_SLOTS: usize = 512;

/// Identifies a server within a worker's table of registered
/// [`Initializer`]s: one per worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(pub(crate) u64);

/// A type-erased factory for a non-connection [`crate::context::WorkerItem`],
/// used by the `Bind`/`BindWithContext` commands.
pub type ItemFactory = Box<dyn FnOnce(Context) -> Box<dyn crate::context::WorkerItem> + Send>;

/// A type-erased factory for a [`crate::connection::ConnectionHandler`],
/// used by `BindAndConnect` to build the client side of an outgoing
/// connection once it completes.
pub type HandlerFactory = Box<dyn FnOnce() -> Box<dyn crate::connection::ConnectionHandler> + Send>;

/// Commands a worker accepts on its inbox.
///
/// Generic over `S` because `NewConnection`/`BindAndConnect` carry a
/// concrete socket; this is an internal type, callers reach the worker
/// either through the framework's own acceptor/`IOSystem` plumbing (which
/// knows `S`) or through the transport-erased [`WorkerHandle`] (which
/// doesn't, and only needs a handful of the variants below).
pub(crate) enum WorkerCommand<S> {
    /// Register a non-connection [`crate::context::WorkerItem`].
    Bind(ItemFactory),
    /// Begin an outgoing connection and bind a client handler to it once it
    /// completes.
    BindAndConnect(SocketAddr, HandlerFactory),
    /// Acceptor handoff: a freshly accepted socket plus which server it
    /// belongs to.
    NewConnection { stream: S, server: ServerId },
    /// Register a server's per-worker [`Initializer`] before its acceptor
    /// starts routing [`WorkerCommand::NewConnection`]s to this worker.
    RegisterInitializer(ServerId, Box<dyn Initializer<S>>),
    /// Run `apply` against the connection bound to `context_id`, if it is
    /// still bound. This is how a settled [`crate::callback::Callback`] gets
    /// its result back to the connection that is waiting on it, both the
    /// synchronous case (a service handler resolves inline) and the async
    /// bridge case reach the connection through this one command, since
    /// neither a handler nor a [`Callback`] is allowed to hold a direct
    /// reference back to its owning [`Connection`].
    Deliver {
        context_id: u64,
        apply: Box<dyn FnOnce(&mut dyn ConnectionItem) + Send>,
    },
    /// Delivery from the async bridge. `resume` closes over
    /// the completed [`AsyncPromise`]; invoking it completes the callback
    /// chain. Dropped without running if `context_id` is no longer bound.
    AsyncResult {
        context_id: u64,
        resume: Box<dyn FnOnce() + Send>,
    },
    /// Place a one-shot timer. `context_id` is `None` for timers with no
    /// specific target.
    Schedule {
        delay: Duration,
        context_id: Option<u64>,
        message: Box<dyn Any + Send>,
    },
    /// Ask the item bound to `context_id` to close.
    CloseContext(u64),
    /// Begin an outgoing connection immediately via `BindAndConnect`,
    /// but route through the same path a scheduled reconnect uses so
    /// `attempt` is tracked consistently.
    Connect {
        addr: SocketAddr,
        build: HandlerFactory,
    },
    /// Place a [`TimerAction::Reconnect`] on this worker's timing wheel.
    /// Reached through [`WorkerHandle`]
    /// because [`crate::service::ReconnectingClient`] only ever holds the
    /// transport-erased handle, never the `S`-typed [`WorkerSender`].
    ScheduleReconnect {
        delay: Duration,
        addr: SocketAddr,
        build: HandlerFactory,
        attempt: u32,
    },
    /// Finish in-flight work, then stop.
    Shutdown,
    /// Stop immediately, dropping whatever is in flight.
    Apocalypse,
}

/// The non-generic seam a [`Context`] carries back to its owning worker.
///
/// `WorkerHandle` erases the worker's transport type `S`: everything it
/// exposes, scheduling a timer, closing a context, bridging an
/// off-worker computation, is expressible without naming a socket type,
/// which is what lets [`Callback`], `Context`, and the handler traits in
/// [`crate::connection`] stay free of a generic parameter.
#[derive(Clone)]
pub struct WorkerHandle(Arc<dyn WorkerControl>);

impl WorkerHandle {
    pub(crate) fn new(control: Arc<dyn WorkerControl>) -> Self {
        Self(control)
    }

    /// The id of the worker this handle points to.
    pub fn id(&self) -> usize {
        self.0.id()
    }

    /// Offload `work` to its own OS thread and resolve the returned
    /// [`Callback`] with its result, back on this worker. `work` never
    /// touches framework state directly: the only thing that crosses back
    /// is the `Result` it produces.
    pub fn spawn_async<T, F>(&self, ctx: &Context, work: F) -> Callback<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, CallbackError> + Send + 'static,
    {
        let (promise, callback) = AsyncPromise::pair();
        let control = self.0.clone();
        let context_id = ctx.id();
        std::thread::spawn(move || {
            let result = work();
            let resume: Box<dyn FnOnce() + Send> = Box::new(move || promise.complete(result));
            control.send_async_result(context_id, resume);
        });
        callback
    }

    /// Schedule an out-of-band message for delivery to `context_id` (or
    /// worker-wide, if `None`) after `delay`.
    pub fn schedule(&self, delay: Duration, context_id: Option<u64>, message: Box<dyn Any + Send>) {
        self.0.send_schedule(delay, context_id, message);
    }

    /// Ask the worker to close the item bound to `context_id`.
    pub fn close_context(&self, context_id: u64) {
        self.0.send_close(context_id);
    }

    /// Run `apply` against the connection bound to `context_id`, if still
    /// bound. Crate-internal: the only callers are the
    /// [`crate::service`] handlers, which never expose the raw
    /// [`crate::connection::ConnectionItem`] trait object to user code.
    pub(crate) fn deliver(&self, context_id: u64, apply: Box<dyn FnOnce(&mut dyn crate::connection::ConnectionItem) + Send>) {
        self.0.send_deliver(context_id, apply);
    }

    /// Begin an outgoing connection to `addr`, binding `build`'s handler to
    /// it once it completes. Transport-erased
    /// so [`crate::service::client_handler_factory`] and
    /// [`crate::service::ReconnectingClient`] can reach it without naming a
    /// socket type.
    pub(crate) fn connect(&self, addr: SocketAddr, build: HandlerFactory) {
        self.0.send_connect(addr, build);
    }

    /// Place a reconnect timer for `addr`, firing `build`'s handler after
    /// `delay`.
    pub(crate) fn schedule_reconnect(&self, delay: Duration, addr: SocketAddr, build: HandlerFactory, attempt: u32) {
        self.0.send_schedule_reconnect(delay, addr, build, attempt);
    }

    #[cfg(test)]
    pub(crate) fn noop_for_tests() -> Self {
        struct Noop;
        impl WorkerControl for Noop {
            fn id(&self) -> usize {
                0
            }
            fn send_async_result(&self, _context_id: u64, _resume: Box<dyn FnOnce() + Send>) {}
            fn send_schedule(&self, _delay: Duration, _context_id: Option<u64>, _message: Box<dyn Any + Send>) {}
            fn send_close(&self, _context_id: u64) {}
            fn send_deliver(&self, _context_id: u64, _apply: Box<dyn FnOnce(&mut dyn crate::connection::ConnectionItem) + Send>) {}
            fn send_connect(&self, _addr: SocketAddr, _build: HandlerFactory) {}
            fn send_schedule_reconnect(&self, _delay: Duration, _addr: SocketAddr, _build: HandlerFactory, _attempt: u32) {}
        }
        WorkerHandle(Arc::new(Noop))
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle").field("id", &self.0.id()).finish()
    }
}

/// The trait-object side of [`WorkerHandle`]; implemented once, by
/// [`WorkerSender`], for whichever concrete transport `S` a given worker
/// was built with.
pub(crate) trait WorkerControl: Send + Sync {
    fn id(&self) -> usize;
    fn send_async_result(&self, context_id: u64, resume: Box<dyn FnOnce() + Send>);
    fn send_schedule(&self, delay: Duration, context_id: Option<u64>, message: Box<dyn Any + Send>);
    fn send_close(&self, context_id: u64);
    fn send_deliver(&self, context_id: u64, apply: Box<dyn FnOnce(&mut dyn crate::connection::ConnectionItem) + Send>);
    fn send_connect(&self, addr: SocketAddr, build: HandlerFactory);
    fn send_schedule_reconnect(&self, delay: Duration, addr: SocketAddr, build: HandlerFactory, attempt: u32);
}

/// The concrete, `S`-typed half of a worker handle: a command sender plus
/// the waker that nudges the worker's `Poll` out of its blocking wait
/// whenever a command arrives off-thread.
pub(crate) struct WorkerSender<S> {
    id: usize,
    tx: Sender<WorkerCommand<S>>,
    waker: Arc<mio::Waker>,
}

impl<S> Clone for WorkerSender<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<S> WorkerSender<S> {
    /// This sender's worker id. Exposed directly (in addition to
    /// [`WorkerControl::id`]) so transport-aware callers like
    /// [`crate::server::Acceptor`] and [`crate::iosystem::IOSystem`] don't
    /// need to import the trait just to log or round-robin by id.
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn send(&self, command: WorkerCommand<S>) {
        if self.tx.send(command).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

impl<S: Send + 'static> WorkerControl for WorkerSender<S> {
    fn id(&self) -> usize {
        self.id
    }

    fn send_async_result(&self, context_id: u64, resume: Box<dyn FnOnce() + Send>) {
        self.send(WorkerCommand::AsyncResult { context_id, resume });
    }

    fn send_schedule(&self, delay: Duration, context_id: Option<u64>, message: Box<dyn Any + Send>) {
        self.send(WorkerCommand::Schedule {
            delay,
            context_id,
            message,
        });
    }

    fn send_close(&self, context_id: u64) {
        self.send(WorkerCommand::CloseContext(context_id));
    }

    fn send_deliver(&self, context_id: u64, apply: Box<dyn FnOnce(&mut dyn crate::connection::ConnectionItem) + Send>) {
        self.send(WorkerCommand::Deliver { context_id, apply });
    }

    fn send_connect(&self, addr: SocketAddr, build: HandlerFactory) {
        self.send(WorkerCommand::Connect { addr, build });
    }

    fn send_schedule_reconnect(&self, delay: Duration, addr: SocketAddr, build: HandlerFactory, attempt: u32) {
        self.send(WorkerCommand::ScheduleReconnect {
            delay,
            addr,
            build,
            attempt,
        });
    }
}

/// A single-threaded event loop: the engine behind one entry in an
/// [`crate::iosystem::IOSystem`]'s worker vector.
pub struct Worker<S> {
    id: usize,
    poll: Poll,
    events: Events,
    inbox: Receiver<WorkerCommand<S>>,
    sender: WorkerSender<S>,
    handle: WorkerHandle,
    connections: HashMap<u64, Box<dyn ConnectionItem>>,
    items: HashMap<u64, Box<dyn crate::context::WorkerItem>>,
    initializers: HashMap<ServerId, Box<dyn Initializer<S>>>,
    timers: TimingWheel,
    next_id: Arc<AtomicU64>,
    config: Arc<Config>,
    metrics: Arc<WorkerMetrics>,
    running: bool,
    fairness_cursor: usize,
}

impl<S> Worker<S>
where
    S: TcpStream + Read + Write + Source + Send + 'static,
{
    /// Build a worker. `next_id` is the `IOSystem`-wide counter every worker
    /// shares, so context ids stay unique across the whole system.
    pub(crate) fn new(id: usize, next_id: Arc<AtomicU64>, config: Arc<Config>, metrics: Arc<WorkerMetrics>) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (tx, rx) = crossbeam_channel::unbounded();
        let sender = WorkerSender { id, tx, waker };
        let handle = WorkerHandle::new(Arc::new(sender.clone()));

        Ok(Self {
            id,
            poll,
            events: Events::with_capacity(1024),
            inbox: rx,
            sender,
            handle,
            connections: HashMap::new(),
            items: HashMap::new(),
            initializers: HashMap::new(),
            timers: TimingWheel::new(TICK, WHEEL_SLOTS),
            next_id,
            config,
            metrics,
            running: true,
            fairness_cursor: 0,
        })
    }

    /// This worker's id, stable for its lifetime within the `IOSystem`.
    pub fn id(&self) -> usize {
        self.id
    }

    /// A cloneable command sender other framework components (the acceptor,
    /// `IOSystem`) use to drive this worker. Distinct from [`WorkerHandle`]:
    /// this one still knows `S`.
    pub(crate) fn sender(&self) -> WorkerSender<S> {
        self.sender.clone()
    }

    /// Register a server's per-worker [`Initializer`] before the acceptor
    /// starts routing connections to this worker.
    pub(crate) fn register_initializer(&mut self, server: ServerId, initializer: Box<dyn Initializer<S>>) {
        self.initializers.insert(server, initializer);
    }

    fn next_context_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Bind a newly accepted or connected socket: allocate a context,
    /// construct the connection through the server's registered
    /// `Initializer`, register it for readability, and log the accept.
    fn accept_connection(&mut self, stream: S, server: ServerId) {
        if !self.initializers.contains_key(&server) {
            log::warn!("worker {}: dropping connection for unregistered server {:?}", self.id, server);
            return;
        }

        let id = self.next_context_id();
        let ctx = Context::new(id, self.handle.clone());
        let handler = self
            .initializers
            .get_mut(&server)
            .expect("presence checked above")
            .on_connect(&ctx);
        let token = Token(id as usize);
        let mut connection = Connection::new(stream, token, handler, &self.config);
        connection.bind(ctx);

        if let Err(e) = connection.sync_interest(self.poll.registry()) {
            log::warn!("worker {}: failed to register accepted connection {id}: {e}", self.id);
            return;
        }

        self.metrics.connection_opened();
        log::debug!("worker {}: bound connection {id}", self.id);
        self.connections.insert(id, Box::new(connection));
    }

    fn begin_connect(&mut self, addr: SocketAddr, build_handler: HandlerFactory) {
        match S::connect(addr) {
            Ok(stream) => {
                let id = self.next_context_id();
                let ctx = Context::new(id, self.handle.clone());
                let handler = build_handler();
                let token = Token(id as usize);
                let mut connection = Connection::new(stream, token, handler, &self.config);
                connection.bind(ctx);
                if let Err(e) = connection.sync_interest(self.poll.registry()) {
                    log::warn!("worker {}: failed to register outgoing connection {id}: {e}", self.id);
                    return;
                }
                self.metrics.connection_opened();
                self.connections.insert(id, Box::new(connection));
            }
            Err(e) => {
                log::warn!("worker {}: connect to {addr} failed: {e}", self.id);
            }
        }
    }

    fn bind_item(&mut self, factory: ItemFactory) {
        let id = self.next_context_id();
        let ctx = Context::new(id, self.handle.clone());
        let mut item = factory(ctx);
        item.on_bind();
        self.items.insert(id, item);
    }

    fn is_bound(&self, context_id: u64) -> bool {
        self.connections.contains_key(&context_id) || self.items.contains_key(&context_id)
    }

    fn close_context(&mut self, context_id: u64, reason: DisconnectReason) {
        if let Some(mut connection) = self.connections.remove(&context_id) {
            connection.close(reason);
            let _ = connection.sync_interest(self.poll.registry());
            self.metrics.connection_closed();
        } else if let Some(mut item) = self.items.remove(&context_id) {
            item.on_unbind();
        }
    }

    /// Drain up to [`INBOX_FAIRNESS_BOUND`] queued commands.
    fn drain_inbox(&mut self) {
        for _ in 0..INBOX_FAIRNESS_BOUND {
            match self.inbox.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running = false;
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, command: WorkerCommand<S>) {
        match command {
            WorkerCommand::Bind(factory) => self.bind_item(factory),
            WorkerCommand::BindAndConnect(addr, factory) => self.begin_connect(addr, factory),
            WorkerCommand::NewConnection { stream, server } => self.accept_connection(stream, server),
            WorkerCommand::RegisterInitializer(server, initializer) => {
                self.register_initializer(server, initializer);
            }
            WorkerCommand::Deliver { context_id, apply } => {
                if let Some(connection) = self.connections.get_mut(&context_id) {
                    apply(connection.as_mut());
                    let _ = connection.sync_interest(self.poll.registry());
                    if connection.is_closed() {
                        self.connections.remove(&context_id);
                        self.metrics.connection_closed();
                    }
                } else {
                    log::trace!("worker {}: dropping delivery for closed context {context_id}", self.id);
                }
            }
            WorkerCommand::AsyncResult { context_id, resume } => {
                if self.is_bound(context_id) {
                    resume();
                } else {
                    log::trace!("worker {}: dropping async result for closed context {context_id}", self.id);
                }
            }
            WorkerCommand::Schedule {
                delay,
                context_id,
                message,
            } => {
                self.timers.schedule(
                    delay,
                    TimerAction::Scheduled {
                        context_id,
                        message,
                    },
                );
            }
            WorkerCommand::CloseContext(id) => self.close_context(id, DisconnectReason::HandlerClosed),
            WorkerCommand::Connect { addr, build } => self.begin_connect(addr, build),
            WorkerCommand::ScheduleReconnect {
                delay,
                addr,
                build,
                attempt,
            } => {
                self.timers
                    .schedule(delay, TimerAction::Reconnect { addr, build, attempt });
            }
            WorkerCommand::Shutdown => {
                self.running = false;
            }
            WorkerCommand::Apocalypse => {
                self.running = false;
                self.connections.clear();
                self.items.clear();
            }
        }
    }

    fn dispatch_readiness(&mut self) {
        // Fairness: rotate the start point through the ready set so a
        // large batch of already-ready connections can't starve ones near
        // the back of the list turn after turn.
        let tokens: Vec<Token> = self
            .events
            .iter()
            .filter(|e| e.token() != WAKE_TOKEN)
            .map(|e| e.token())
            .collect();
        if tokens.is_empty() {
            return;
        }
        let start = self.rotating_start() % tokens.len();

        let read_set: std::collections::HashSet<Token> = self
            .events
            .iter()
            .filter(|e| e.is_readable())
            .map(|e| e.token())
            .collect();
        let write_set: std::collections::HashSet<Token> = self
            .events
            .iter()
            .filter(|e| e.is_writable())
            .map(|e| e.token())
            .collect();

        for i in 0..tokens.len() {
            let token = tokens[(start + i) % tokens.len()];
            let context_id = token.0 as u64;
            let Some(connection) = self.connections.get_mut(&context_id) else {
                continue;
            };

            if write_set.contains(&token) {
                if let Err(e) = connection.handle_writable() {
                    log::debug!("worker {}: write error on {context_id}: {e}", self.id);
                    connection.close(DisconnectReason::Io(e));
                }
            }
            if !connection.is_closed() && read_set.contains(&token) {
                if let Err(e) = connection.handle_readable() {
                    log::debug!("worker {}: read error on {context_id}: {e}", self.id);
                    connection.close(DisconnectReason::Io(e));
                }
            }

            let _ = connection.sync_interest(self.poll.registry());
            if connection.is_closed() {
                self.connections.remove(&context_id);
                self.metrics.connection_closed();
            }
        }
    }

    fn rotating_start(&mut self) -> usize {
        let start = self.fairness_cursor;
        self.fairness_cursor = self.fairness_cursor.wrapping_add(1);
        start
    }

    fn advance_timers(&mut self) {
        let fired = self.timers.advance(Instant::now());
        for action in fired {
            self.handle_timer_action(action);
        }
    }

    fn handle_timer_action(&mut self, action: TimerAction) {
        match action {
            TimerAction::IdleCheck { context_id } => self.check_idle(context_id),
            TimerAction::Scheduled { context_id, message } => match context_id {
                Some(id) => {
                    if let Some(connection) = self.connections.get_mut(&id) {
                        connection.on_message(message.as_ref());
                    } else if let Some(item) = self.items.get_mut(&id) {
                        item.on_message(message.as_ref());
                    }
                }
                None => log::trace!("worker {}: worker-wide scheduled message fired", self.id),
            },
            TimerAction::Reconnect { addr, build, attempt } => {
                log::debug!("worker {}: reconnect attempt {attempt} to {addr}", self.id);
                self.begin_connect(addr, build);
            }
        }
    }

    fn check_idle(&mut self, context_id: u64) {
        let Some(timeout) = self.config.connection_idle_timeout else {
            return;
        };
        let Some(connection) = self.connections.get(&context_id) else {
            return;
        };
        let idle_for = connection.last_activity().elapsed();
        if idle_for >= timeout {
            self.metrics.timeout();
            self.close_context(context_id, DisconnectReason::Timeout);
        } else {
            self.timers
                .schedule(timeout - idle_for, TimerAction::IdleCheck { context_id });
        }
    }

    /// Schedule the first idle-timeout check for a just-bound connection.
    /// Called by [`crate::server::Acceptor`]/[`crate::service`] wiring right
    /// after a connection is accepted, if idle timeouts are configured.
    pub(crate) fn arm_idle_timeout(&mut self, context_id: u64) {
        if let Some(timeout) = self.config.connection_idle_timeout {
            self.timers.schedule(timeout, TimerAction::IdleCheck { context_id });
        }
    }

    /// Run one iteration of the loop: drain commands, poll readiness,
    /// dispatch events, advance timers.
    fn turn(&mut self) -> std::io::Result<()> {
        self.drain_inbox();
        self.poll.poll(&mut self.events, Some(TICK))?;
        self.dispatch_readiness();
        self.advance_timers();
        Ok(())
    }

    /// Run until a `Shutdown`/`Apocalypse` command stops the loop or the
    /// inbox's sender half is dropped.
    pub fn run(&mut self) {
        while self.running {
            if let Err(e) = self.turn() {
                log::error!("worker {}: poll failed: {e}", self.id);
                break;
            }
        }
        log::info!("worker {}: worker stopped", self.id);
    }

    /// The worker's transport-erased handle, the one stashed inside every
    /// [`Context`] it binds.
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_handle_is_debuggable_and_cloneable() {
        let handle = WorkerHandle::noop_for_tests();
        let other = handle.clone();
        assert_eq!(handle.id(), other.id());
        assert_eq!(format!("{handle:?}"), "WorkerHandle { id: 0 }");
    }
}
