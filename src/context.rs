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

//! Identity and worker-bound entities.
//!
//! A `Context` binds a unique, never-reused 64-bit id to the worker that
//! owns it. The rest of the crate refers to connections and handlers
//! through their context id plus a worker-table lookup rather than through
//! owning pointers, which is what lets a `Context` be cheaply cloned and
//! stashed inside a `Callback` continuation without creating a reference
//! cycle back to the connection it belongs to.

use crate::worker::WorkerHandle;

/// Identity for a [`WorkerItem`]: a unique id plus a handle back to the
/// worker that owns it.
///
/// `Context` is `Clone`, cheaply: cloning it never clones the item it
/// names, only the (id, worker handle) pair used to look the item up later.
#[derive(Clone)]
pub struct Context {
    id: u64,
    worker: WorkerHandle,
}

impl Context {
    /// Construct a context. Only `Worker` does this, when binding a new
    /// item, using the IOSystem-wide id counter so ids are unique across
    /// every worker for the lifetime of the owning `IOSystem`.
    pub(crate) fn new(id: u64, worker: WorkerHandle) -> Self {
        Self { id, worker }
    }

    /// This context's unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The worker this context is bound to.
    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("id", &self.id).finish()
    }
}

/// Anything bound to a worker that receives its lifecycle events:
/// connections, background tasks, and clients alike.
pub trait WorkerItem {
    /// This item's identity.
    fn context(&self) -> &Context;

    /// Called once, synchronously, when the item is registered with its
    /// worker.
    fn on_bind(&mut self) {}

    /// Called once when the item is removed from its worker, before it is
    /// dropped. Any callback continuations still pending against this
    /// item's context become no-ops after this point.
    fn on_unbind(&mut self) {}

    /// Delivery of an application-defined message sent to this item via a
    /// worker command.
    fn on_message(&mut self, _message: &dyn std::any::Any) {}

    /// Called when the owning `IOSystem` shuts the worker down.
    fn on_shutdown(&mut self) {}
}
