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

//! Transport abstractions over `mio`/`std` sockets.
//!
//! Kept generic over the concrete stream/listener type so the runtime kernel
//! can be driven by mocks in tests without touching a real socket. Transparent
//! TLS is a pluggable-transport concern and out of scope here, but these
//! traits are exactly the seam a TLS-wrapping transport would sit behind.

pub mod tcp_listener;
pub mod tcp_stream;

pub use tcp_listener::TcpListener;
pub use tcp_stream::TcpStream;
