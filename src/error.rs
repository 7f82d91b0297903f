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

//! Error types shared across the runtime kernel.
//!
//! Transport-level failures (accept, read, write) stay as [`std::io::Error`].
//! Everything above the socket, protocol framing, capacity, configuration,
//! and the "this should never happen" class of bug, gets its own variant
//! here so callers can match on it instead of string-sniffing an
//! `io::Error`.

use std::fmt;

/// Error surfaced from a [`crate::callback::Callback`] chain or a
/// [`crate::service`] pipeline.
#[derive(thiserror::Error, Debug)]
pub enum ColossusError {
    /// The wire bytes did not satisfy the codec's grammar. Server-side this
    /// closes the connection unless the codec opts into `error_response`;
    /// client-side this poisons the pipeline.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A handler's callback failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// An idle or request deadline elapsed.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The write pipeline reached its high-water mark. Transient: resolves
    /// itself once the queue drains below the low-water mark.
    #[error("pipeline at capacity ({depth}/{high_water})")]
    PipelineFull {
        /// Current queue depth.
        depth: usize,
        /// Configured high-water mark.
        high_water: usize,
    },

    /// A client-side request could not be matched to a response because the
    /// connection was poisoned or dropped mid-flight.
    #[error("disconnected before response arrived")]
    Disconnected,

    /// Invalid [`crate::config::Config`] at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transport-level I/O failure, preserved for callers that want the
    /// underlying `io::Error`.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A violated internal invariant: a callback completed twice, a
    /// `WorkerItem` went missing while still referenced, an encoder was
    /// driven past `Complete`. These are bugs, not recoverable conditions;
    /// they are logged loudly at the call site and the offending connection
    /// is torn down, but the worker itself keeps serving everyone else.
    #[error("internal invariant violated: {0}")]
    Fatal(String),
}

/// The error type threaded through [`crate::callback::Callback`].
///
/// Kept distinct from [`ColossusError`] so that user handler code can use a
/// plain string-or-custom error without importing the kernel's transport
/// variants, while the service layer still knows how to fold it into one.
#[derive(Debug, Clone)]
pub struct CallbackError(pub(crate) String);

impl CallbackError {
    /// Build a callback error from any displayable cause.
    pub fn new(cause: impl fmt::Display) -> Self {
        Self(cause.to_string())
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CallbackError {}

impl From<CallbackError> for ColossusError {
    fn from(value: CallbackError) -> Self {
        ColossusError::Handler(value.0)
    }
}

impl From<ColossusError> for CallbackError {
    fn from(value: ColossusError) -> Self {
        CallbackError(value.to_string())
    }
}
