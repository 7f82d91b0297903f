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

//! Per-worker connection factories.
//!
//! A server registers one [`Initializer`] per worker before it starts
//! accepting; the worker calls it once per [`crate::worker::WorkerCommand::NewConnection`]
//! to build the handler for that socket. Because an `Initializer` lives on
//! exactly one worker for the server's lifetime, it is the natural home for
//! worker-scoped resources a handler wants to share without locking, such as
//! an upstream client pool, a cache, or a per-worker counter.

use crate::connection::ConnectionHandler;
use crate::context::Context;

/// Builds per-connection handlers for one worker, for the lifetime of the
/// server it backs.
///
/// Implementations are free to hold worker-scoped state (an upstream client
/// pool, for example); since an `Initializer` is only ever driven from the
/// worker thread it was registered on, that state needs no synchronization.
pub trait Initializer<S>: Send {
    /// Build the handler for a freshly accepted or connected socket.
    /// `ctx` is already bound; the handler receives it again via its own
    /// `on_bind` once [`crate::connection::Connection::bind`] runs.
    fn on_connect(&mut self, ctx: &Context) -> Box<dyn ConnectionHandler>;

    /// Narrow to a concrete type. Lets an embedding application reach
    /// worker-scoped state held by a specific `Initializer` implementation
    /// from outside the worker thread is never safe; this exists for
    /// same-thread introspection (tests, diagnostics) only.
    fn as_any(&self) -> &dyn std::any::Any;

    #[doc(hidden)]
    fn _marker(&self) -> std::marker::PhantomData<S> {
        std::marker::PhantomData
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DataBuffer;
    use crate::callback::CallbackResult;
    use crate::connection::{ConnectionSignal, DisconnectReason, ReadyOutputs};
    use crate::encoder::BoxedEncoder;
    use std::io;

    struct CountingHandler;
    impl ConnectionHandler for CountingHandler {
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

    struct CountingInitializer {
        connects: usize,
    }
    impl<S> Initializer<S> for CountingInitializer {
        fn on_connect(&mut self, _ctx: &Context) -> Box<dyn ConnectionHandler> {
            self.connects += 1;
            Box::new(CountingHandler)
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn tracks_how_many_connections_it_built() {
        use crate::worker::WorkerHandle;
        let ctx = Context::new(1, WorkerHandle::noop_for_tests());
        let mut init: Box<dyn Initializer<()>> = Box::new(CountingInitializer { connects: 0 });
        let _ = init.on_connect(&ctx);
        let _ = init.on_connect(&ctx);
        let counting = init.as_any().downcast_ref::<CountingInitializer>().unwrap();
        assert_eq!(counting.connects, 2);
    }
}
