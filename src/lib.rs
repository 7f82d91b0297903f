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

//! Colossus: a high-throughput, low-latency network service framework.
//!
//! The runtime kernel is a pool of single-threaded event-loop [`worker`]s
//! fronted by an [`iosystem::IOSystem`], plus a [`server`] acceptor that
//! routes accepted sockets across workers round-robin. Application logic is
//! driven through [`connection::ConnectionHandler`]; most embedders reach it
//! indirectly via the [`service`] layer's `Codec`/`Handler` pair rather than
//! implementing it directly. [`callback::Callback`] is the worker-affine
//! deferred value everything above the socket resolves through.
//!
//! Concrete wire codecs (HTTP, Redis, Memcached, WebSocket), a metrics
//! export backend, configuration/CLI parsing, and logging setup are external
//! collaborators: this crate specifies interfaces for them, not
//! implementations.

pub mod buffer;
pub mod callback;
pub mod config;
pub mod connection;
pub mod context;
pub mod encoder;
pub mod error;
pub mod initializer;
pub mod iosystem;
pub mod metrics;
pub mod net;
pub mod server;
pub mod service;
pub mod timer;
pub mod worker;

pub use config::Config;
pub use context::{Context, WorkerItem};
pub use error::ColossusError;
pub use iosystem::IOSystem;
pub use server::ServerRef;
