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

//! Per-connection state machine: the socket read/write pump, backpressure,
//! and idle-timeout bookkeeping.
//!
//! `Connection<S>` is deliberately ignorant of what's on the wire. It drives
//! a [`ConnectionHandler`] (the [`crate::service::Service`]/`ClientService`
//! pipelining layer) against raw bytes and a write queue of [`BoxedEncoder`]s;
//! everything protocol-shaped lives one layer up.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::time::Instant;

use mio::{Interest, Registry, Token};

use crate::buffer::{DataBuffer, FixedOutBuffer};
use crate::callback::CallbackResult;
use crate::config::Config;
use crate::context::{Context, WorkerItem};
use crate::encoder::{BoxedEncoder, WriteStatus};
use crate::net::TcpStream;

/// Why a connection stopped being driven.
#[derive(Debug)]
pub enum DisconnectReason {
    /// The peer closed its write half (a zero-length read).
    Eof,
    /// A transport-level I/O error.
    Io(io::Error),
    /// The connection idle timeout elapsed.
    Timeout,
    /// The handler asked for the connection to close, e.g. after an
    /// unrecoverable protocol error with no `error_response`.
    HandlerClosed,
}

/// What the handler wants the pump to do after decoding as much as it could
/// from the bytes just handed to it.
pub enum ConnectionSignal {
    /// Keep reading.
    Continue,
    /// Stop reading and tear the connection down once queued writes flush.
    Close,
}

/// The encoders a [`ConnectionHandler::on_response_ready`] call has decided
/// are safe to write now, in wire order, plus whether the connection should
/// close once they've drained. A poisoned client pipeline, or a server codec
/// with no `error_response`, both close after flushing whatever is already
/// ready.
pub struct ReadyOutputs {
    /// Encoders ready to enqueue, in order.
    pub encoders: Vec<BoxedEncoder>,
    /// Whether the connection should close after these drain.
    pub close_after: bool,
}

impl ReadyOutputs {
    /// Nothing is ready yet; an earlier in-flight entry is still pending.
    pub fn none() -> Self {
        ReadyOutputs {
            encoders: Vec::new(),
            close_after: false,
        }
    }

    /// Exactly one encoder is ready.
    pub fn single(encoder: BoxedEncoder) -> Self {
        ReadyOutputs {
            encoders: vec![encoder],
            close_after: false,
        }
    }
}

/// Application-level logic bound to a connection: the
/// [`crate::service::Service`]/`ClientService` pipelining layer. The pump
/// below only ever calls through this trait, never anything codec-specific.
pub trait ConnectionHandler {
    /// Called once, when the connection is bound to its worker.
    fn on_bind(&mut self, ctx: Context);

    /// Decode and dispatch as much as possible from the front of `data`.
    /// Implementations call [`DataBuffer::advance`] for every byte actually
    /// consumed; bytes left unconsumed are re-presented, prefixed with
    /// whatever arrives on the next read, on the following call.
    fn on_readable(&mut self, data: &mut DataBuffer<'_>) -> io::Result<ConnectionSignal>;

    /// A previously dispatched request/response numbered `seq` has settled.
    /// Returns whatever is now safe to emit in wire order: completion may
    /// happen out of order, but delivery onto the wire never does.
    fn on_response_ready(&mut self, seq: u64, result: CallbackResult<BoxedEncoder>) -> ReadyOutputs;

    /// Whether the in-flight depth is high enough that the pump should
    /// suppress read interest.
    fn backpressure_active(&self) -> bool {
        false
    }

    /// The connection is going away; release anything held against it.
    fn on_disconnect(&mut self, reason: &DisconnectReason);

    /// Delivery of an out-of-band message (currently: a client's idle/request
    /// timeout firing off the timing wheel). Default no-op for handlers that
    /// never schedule one.
    fn on_message(&mut self, _message: &dyn std::any::Any) {}

    /// Narrow to the concrete handler type. [`crate::service::ClientRef`]
    /// uses this to reach a specific `ClientConnectionHandler<C>` through the
    /// type-erased [`ConnectionItem`] the worker stores it behind.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Everything the worker's dispatch loop needs from a bound connection,
/// independent of its transport type `S`. The worker only knows tokens and
/// context ids, never concrete connection types.
pub trait ConnectionItem: WorkerItem {
    /// The mio registration token this connection is parked under.
    fn token(&self) -> Token;
    /// Pump readable bytes off the socket and into the handler.
    fn handle_readable(&mut self) -> io::Result<()>;
    /// Flush as much of the write queue as the socket accepts right now.
    fn handle_writable(&mut self) -> io::Result<()>;
    /// Deliver a settled callback result for request `seq`, routed through
    /// the async bridge and the reorder buffer.
    fn deliver_response(&mut self, seq: u64, result: CallbackResult<BoxedEncoder>);
    /// Whether the connection has already been torn down.
    fn is_closed(&self) -> bool;
    /// Timestamp of the connection's last observed activity, for idle-timeout
    /// comparisons.
    fn last_activity(&self) -> Instant;
    /// Tear the connection down for `reason`.
    fn close(&mut self, reason: DisconnectReason);
    /// Whether the write queue is non-empty, i.e. this connection needs
    /// writable-interest registration.
    fn wants_write(&self) -> bool;
    /// Queue an encoder for the socket to write out, attempting to flush
    /// immediately. Used by [`crate::service::ClientRef::send`] to put an
    /// outgoing request on the wire.
    fn enqueue_write(&mut self, encoder: BoxedEncoder);
    /// Reach the bound handler through its type-erased escape hatch.
    fn handler_any_mut(&mut self) -> &mut dyn std::any::Any;
    /// Bring this connection's mio registration in line with its current
    /// read-suppressed/wants-write state: register, reregister, or
    /// deregister as needed: socket read interest cleared or restored to
    /// match backpressure state. Idempotent; safe to call after every state
    /// transition.
    fn sync_interest(&mut self, registry: &Registry) -> io::Result<()>;
}

const READ_CHUNK: usize = 16 * 1024;

/// A connection driven by transport `S`: reads into a growable buffer,
/// decodes through its [`ConnectionHandler`], and writes queued encoders out
/// through a fixed scratch buffer with dynamic overflow.
pub struct Connection<S> {
    ctx: Option<Context>,
    token: Token,
    stream: S,
    handler: Box<dyn ConnectionHandler>,
    read_buf: Vec<u8>,
    write_queue: VecDeque<BoxedEncoder>,
    write_scratch: Vec<u8>,
    closed: bool,
    read_suppressed: bool,
    registered: bool,
    last_activity: Instant,
}

impl<S> Connection<S>
where
    S: TcpStream + Read + Write,
{
    /// Wrap a freshly accepted or connected stream. Not yet bound to a
    /// worker; call [`Connection::bind`] once a [`Context`] exists.
    pub fn new(stream: S, token: Token, handler: Box<dyn ConnectionHandler>, config: &Config) -> Self {
        Self {
            ctx: None,
            token,
            stream,
            handler,
            read_buf: Vec::with_capacity(config.read_buffer_kb * 1024),
            write_queue: VecDeque::new(),
            write_scratch: vec![0u8; config.write_buffer_kb * 1024],
            closed: false,
            read_suppressed: false,
            registered: false,
            last_activity: Instant::now(),
        }
    }

    /// Bind this connection to its context, invoking the handler's
    /// `on_bind` exactly once.
    pub fn bind(&mut self, ctx: Context) {
        self.handler.on_bind(ctx.clone());
        self.ctx = Some(ctx);
    }

    /// Whether read interest should currently be suppressed, either because
    /// the handler's in-flight depth is over its high-water mark or the
    /// connection has been closed outright.
    pub fn read_suppressed(&self) -> bool {
        self.read_suppressed || self.closed
    }

    fn process_buffered(&mut self) -> io::Result<()> {
        loop {
            if self.read_buf.is_empty() || self.closed {
                break;
            }
            let mut view = DataBuffer::new(&self.read_buf);
            let signal = self.handler.on_readable(&mut view)?;
            let consumed = view.position();
            if consumed == 0 {
                break;
            }
            self.read_buf.drain(0..consumed);
            if matches!(signal, ConnectionSignal::Close) {
                self.close(DisconnectReason::HandlerClosed);
                break;
            }
        }
        self.read_suppressed = self.handler.backpressure_active();
        Ok(())
    }

    fn drain_queue_into_scratch(&mut self) -> io::Result<()> {
        loop {
            let Some(front) = self.write_queue.front_mut() else {
                break;
            };
            let mut out = FixedOutBuffer::new(&mut self.write_scratch);
            let status = front.write_into(&mut out);
            let written = out.written().len();
            if written > 0 {
                let mut offset = 0;
                while offset < written {
                    match self.stream.write(&self.write_scratch[offset..written]) {
                        Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                        Ok(n) => offset += n,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
            if status == WriteStatus::Complete {
                self.write_queue.pop_front();
            } else if written == 0 {
                // Scratch buffer is smaller than one frame and the socket
                // isn't accepting more bytes right now; stop until the next
                // writable event.
                break;
            }
        }
        Ok(())
    }
}

impl<S> WorkerItem for Connection<S>
where
    S: TcpStream + Read + Write,
{
    fn context(&self) -> &Context {
        self.ctx.as_ref().expect("Connection::context called before bind")
    }

    fn on_message(&mut self, message: &dyn std::any::Any) {
        self.handler.on_message(message);
    }
}

impl<S> ConnectionItem for Connection<S>
where
    S: TcpStream + Read + Write + mio::event::Source,
{
    fn token(&self) -> Token {
        self.token
    }

    fn handle_readable(&mut self) -> io::Result<()> {
        loop {
            if self.closed || self.read_suppressed {
                // Mio is edge-triggered: once backpressure clears we resume
                // draining explicitly from `deliver_response` rather than
                // waiting for a readiness edge that may never re-fire.
                return Ok(());
            }
            let start = self.read_buf.len();
            self.read_buf.resize(start + READ_CHUNK, 0);
            match self.stream.read(&mut self.read_buf[start..]) {
                Ok(0) => {
                    self.read_buf.truncate(start);
                    self.close(DisconnectReason::Eof);
                    return Ok(());
                }
                Ok(n) => {
                    self.read_buf.truncate(start + n);
                    self.last_activity = Instant::now();
                    self.process_buffered()?;
                    if n < READ_CHUNK {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.read_buf.truncate(start);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    self.read_buf.truncate(start);
                    continue;
                }
                Err(e) => {
                    self.read_buf.truncate(start);
                    self.close(DisconnectReason::Io(e));
                    return Ok(());
                }
            }
        }
    }

    fn handle_writable(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        match self.drain_queue_into_scratch() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close(DisconnectReason::Io(e));
                Ok(())
            }
        }
    }

    fn deliver_response(&mut self, seq: u64, result: CallbackResult<BoxedEncoder>) {
        if self.closed {
            return;
        }
        let ready = self.handler.on_response_ready(seq, result);
        self.write_queue.extend(ready.encoders);
        let _ = self.drain_queue_into_scratch();
        if ready.close_after && self.write_queue.is_empty() {
            self.close(DisconnectReason::HandlerClosed);
        }
        let was_suppressed = self.read_suppressed;
        self.read_suppressed = self.handler.backpressure_active();
        if was_suppressed && !self.read_suppressed && !self.closed {
            let _ = self.handle_readable();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn close(&mut self, reason: DisconnectReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.handler.on_disconnect(&reason);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn wants_write(&self) -> bool {
        !self.write_queue.is_empty()
    }

    fn enqueue_write(&mut self, encoder: BoxedEncoder) {
        if self.closed {
            return;
        }
        self.write_queue.push_back(encoder);
        let _ = self.drain_queue_into_scratch();
    }

    fn handler_any_mut(&mut self) -> &mut dyn std::any::Any {
        self.handler.as_any_mut()
    }

    fn sync_interest(&mut self, registry: &Registry) -> io::Result<()> {
        if self.closed {
            if self.registered {
                registry.deregister(&mut self.stream)?;
                self.registered = false;
            }
            return Ok(());
        }

        let want_read = !self.read_suppressed;
        let want_write = !self.write_queue.is_empty();

        if !want_read && !want_write {
            if self.registered {
                registry.deregister(&mut self.stream)?;
                self.registered = false;
            }
            return Ok(());
        }

        let mut interest = if want_read {
            Interest::READABLE
        } else {
            Interest::WRITABLE
        };
        if want_write {
            interest = interest.add(Interest::WRITABLE);
        }

        if self.registered {
            registry.reregister(&mut self.stream, self.token, interest)
        } else {
            registry.register(&mut self.stream, self.token, interest)?;
            self.registered = true;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::{Shutdown, SocketAddr};

    /// An in-memory socket double: read half and write half are independent
    /// buffers, so tests can script bytes in and assert bytes out without a
    /// real OS socket.
    struct MockStream {
        incoming: Cursor<Vec<u8>>,
        outgoing: Vec<u8>,
    }

    impl MockStream {
        fn new(incoming: Vec<u8>) -> Self {
            Self {
                incoming: Cursor::new(incoming),
                outgoing: Vec::new(),
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.incoming.read(buf)?;
            if n == 0 {
                Err(io::Error::from(ErrorKind::WouldBlock))
            } else {
                Ok(n)
            }
        }
    }

    impl mio::event::Source for MockStream {
        fn register(&mut self, _registry: &Registry, _token: Token, _interests: Interest) -> io::Result<()> {
            Ok(())
        }
        fn reregister(&mut self, _registry: &Registry, _token: Token, _interests: Interest) -> io::Result<()> {
            Ok(())
        }
        fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
            Ok(())
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outgoing.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl TcpStream for MockStream {
        fn connect(_addr: SocketAddr) -> io::Result<Self> {
            unimplemented!("tests construct MockStream directly")
        }
        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
        fn shutdown(&self, _how: Shutdown) -> io::Result<()> {
            Ok(())
        }
        fn set_nodelay(&self, _nodelay: bool) -> io::Result<()> {
            Ok(())
        }
        fn nodelay(&self) -> io::Result<bool> {
            Ok(true)
        }
        fn set_ttl(&self, _ttl: u32) -> io::Result<()> {
            Ok(())
        }
        fn ttl(&self) -> io::Result<u32> {
            Ok(64)
        }
        fn take_error(&self) -> io::Result<Option<io::Error>> {
            Ok(None)
        }
        fn peek(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    struct NoopHandler;
    impl ConnectionHandler for NoopHandler {
        fn on_bind(&mut self, _ctx: Context) {}
        fn on_readable(&mut self, data: &mut DataBuffer<'_>) -> io::Result<ConnectionSignal> {
            data.advance(data.remaining());
            Ok(ConnectionSignal::Continue)
        }
        fn on_response_ready(&mut self, _seq: u64, _result: CallbackResult<BoxedEncoder>) -> ReadyOutputs {
            ReadyOutputs::none()
        }
        fn on_disconnect(&mut self, _reason: &DisconnectReason) {}
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    #[test]
    fn read_chunk_smaller_than_capacity_stops_the_loop() {
        let config = Config::default();
        let stream = MockStream::new(b"hello".to_vec());
        let mut conn = Connection::new(stream, Token(0), Box::new(NoopHandler), &config);
        conn.handle_readable().unwrap();
        assert!(!conn.is_closed());
    }

    struct EofStream(MockStream, bool);
    impl Read for EofStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.1 {
                Ok(0)
            } else {
                self.1 = true;
                self.0.read(buf)
            }
        }
    }
    impl Write for EofStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl mio::event::Source for EofStream {
        fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
            self.0.register(registry, token, interests)
        }
        fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
            self.0.reregister(registry, token, interests)
        }
        fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
            self.0.deregister(registry)
        }
    }
    impl TcpStream for EofStream {
        fn connect(_addr: SocketAddr) -> io::Result<Self> {
            unimplemented!()
        }
        fn peer_addr(&self) -> io::Result<SocketAddr> {
            self.0.peer_addr()
        }
        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.0.local_addr()
        }
        fn shutdown(&self, how: Shutdown) -> io::Result<()> {
            self.0.shutdown(how)
        }
        fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
            self.0.set_nodelay(nodelay)
        }
        fn nodelay(&self) -> io::Result<bool> {
            self.0.nodelay()
        }
        fn set_ttl(&self, ttl: u32) -> io::Result<()> {
            self.0.set_ttl(ttl)
        }
        fn ttl(&self) -> io::Result<u32> {
            self.0.ttl()
        }
        fn take_error(&self) -> io::Result<Option<io::Error>> {
            self.0.take_error()
        }
        fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.peek(buf)
        }
    }

    #[test]
    fn zero_length_read_closes_the_connection() {
        let config = Config::default();
        let stream = EofStream(MockStream::new(Vec::new()), true);
        let mut conn = Connection::new(stream, Token(0), Box::new(NoopHandler), &config);
        conn.handle_readable().unwrap();
        assert!(conn.is_closed());
    }

    #[test]
    fn deliver_response_enqueues_and_flushes() {
        use crate::encoder::BlockEncoder;
        struct OneShotHandler;
        impl ConnectionHandler for OneShotHandler {
            fn on_bind(&mut self, _ctx: Context) {}
            fn on_readable(&mut self, _data: &mut DataBuffer<'_>) -> io::Result<ConnectionSignal> {
                Ok(ConnectionSignal::Continue)
            }
            fn on_response_ready(&mut self, _seq: u64, result: CallbackResult<BoxedEncoder>) -> ReadyOutputs {
                match result {
                    Ok(e) => ReadyOutputs::single(e),
                    Err(_) => ReadyOutputs::none(),
                }
            }
            fn on_disconnect(&mut self, _reason: &DisconnectReason) {}
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
        }
        let config = Config::default();
        let stream = MockStream::new(Vec::new());
        let mut conn = Connection::new(stream, Token(0), Box::new(OneShotHandler), &config);
        let encoder: BoxedEncoder = Box::new(BlockEncoder::new(b"pong".to_vec()));
        conn.deliver_response(0, Ok(encoder));
        assert_eq!(conn.stream.outgoing, b"pong");
    }
}
