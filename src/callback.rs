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

//! The worker-thread-affine deferred value.
//!
//! `Callback<T>` is deliberately less capable than a general-purpose future:
//! it never migrates threads, and its only suspension point is the async
//! bridge in [`crate::worker`]. That restriction is what lets every
//! continuation run lock-free on the worker that created it.
//!
//! The shared cell backing a `Callback` is an `Arc<Mutex<..>>`, not an
//! `Rc<RefCell<..>>`: [`AsyncPromise`] needs to cross from the background
//! thread a [`crate::worker::WorkerHandle::spawn_async`] call spawns back to
//! the worker, and only a genuinely `Send` type can make that trip. `Callback`
//! itself stays non-`Send` anyway, via an explicit marker field, so nothing
//! about user-facing usage changes: a `Callback` still only ever resolves on
//! the worker thread that created it.

use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use crate::error::CallbackError;

/// The result a [`Callback`] eventually resolves to.
pub type CallbackResult<T> = Result<T, CallbackError>;

type Continuation<T> = Box<dyn FnOnce(CallbackResult<T>) + Send>;

/// A `Callback<T>` is consumed (by value) by exactly one of `map`,
/// `flat_map`, `map_err`, `recover` or `execute`, so at most one
/// continuation is ever registered against a given `Shared<T>`.
struct Shared<T> {
    result: Option<CallbackResult<T>>,
    waiter: Option<Continuation<T>>,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            result: None,
            waiter: None,
        }
    }
}

/// The write side of a [`Callback`], kept distinct the way a builder is kept
/// distinct from the type it produces: `Promise` is only used internally (by
/// `flat_map` and the async bridge) to construct a `Callback` whose
/// completion is driven by something other than an immediately-known value.
struct Promise<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T: Send + 'static> Promise<T> {
    fn pair() -> (Promise<T>, Callback<T>) {
        let shared = Arc::new(Mutex::new(Shared::new()));
        (
            Promise {
                shared: shared.clone(),
            },
            Callback {
                shared,
                _not_send: PhantomData,
            },
        )
    }

    /// Complete the promise, running the continuation registered so far
    /// inline if there is one, or stashing the result for a continuation
    /// attached later. Continuations run synchronously, in attachment order,
    /// which is trivially true here since there is only ever one. Completing
    /// an already-completed promise is a programming error: a callback
    /// resolves exactly once.
    fn complete(self, result: CallbackResult<T>) {
        let waiter = {
            let mut shared = self.shared.lock().expect("callback shared state poisoned");
            assert!(
                shared.result.is_none(),
                "Callback completed twice, this is a framework bug, not a recoverable condition"
            );
            shared.waiter.take()
        };
        match waiter {
            Some(waiter) => waiter(result),
            None => self.shared.lock().expect("callback shared state poisoned").result = Some(result),
        }
    }
}

/// A one-shot, worker-affine deferred value.
///
/// All continuations attached via [`Callback::map`], [`Callback::flat_map`],
/// [`Callback::map_err`], [`Callback::recover`] and the terminal
/// [`Callback::execute`] run synchronously on the worker that created this
/// callback, in attachment order. `Callback` is not `Send`:
/// the `PhantomData<Rc<()>>` marker blocks the auto-trait even though its
/// backing cell is thread-safe, so user code cannot accidentally move a
/// `Callback` to another thread and violate that invariant.
pub struct Callback<T> {
    shared: Arc<Mutex<Shared<T>>>,
    _not_send: PhantomData<Rc<()>>,
}

impl<T: Send + 'static> Callback<T> {
    /// An already-succeeded callback.
    pub fn successful(value: T) -> Self {
        let (promise, callback) = Promise::pair();
        promise.complete(Ok(value));
        callback
    }

    /// An already-failed callback.
    pub fn failed(error: CallbackError) -> Self {
        let (promise, callback) = Promise::pair();
        promise.complete(Err(error));
        callback
    }

    /// Attach a continuation that runs whenever this callback resolves,
    /// successfully or not. This is the terminal operation: the framework
    /// calls it once, exactly, to obtain the value it streams into the
    /// connection's encoder pipeline.
    pub fn execute<F>(self, k: F)
    where
        F: FnOnce(CallbackResult<T>) + Send + 'static,
    {
        let mut shared = self.shared.lock().expect("callback shared state poisoned");
        if let Some(result) = shared.result.take() {
            drop(shared);
            k(result);
        } else {
            shared.waiter = Some(Box::new(k));
        }
    }

    /// Transform a successful value; a failure passes through untouched.
    pub fn map<U, F>(self, f: F) -> Callback<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (promise, next) = Promise::pair();
        self.execute(move |result| promise.complete(result.map(f)));
        next
    }

    /// Chain into another callback produced from a successful value. The
    /// inner callback inherits this one's worker affinity: it is created
    /// on the same thread this continuation runs on.
    pub fn flat_map<U, F>(self, f: F) -> Callback<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Callback<U> + Send + 'static,
    {
        let (promise, next) = Promise::pair();
        self.execute(move |result| match result {
            Ok(value) => f(value).execute(move |inner| promise.complete(inner)),
            Err(e) => promise.complete(Err(e)),
        });
        next
    }

    /// Transform a failure; a success passes through untouched.
    pub fn map_err<F>(self, f: F) -> Callback<T>
    where
        F: FnOnce(CallbackError) -> CallbackError + Send + 'static,
    {
        let (promise, next) = Promise::pair();
        self.execute(move |result| promise.complete(result.map_err(f)));
        next
    }

    /// Salvage a failure into a success.
    pub fn recover<F>(self, f: F) -> Callback<T>
    where
        F: FnOnce(CallbackError) -> T + Send + 'static,
    {
        let (promise, next) = Promise::pair();
        self.execute(move |result| {
            promise.complete(match result {
                Ok(v) => Ok(v),
                Err(e) => Ok(f(e)),
            })
        });
        next
    }
}

/// The write half of a [`Callback`] bridged from off-worker work. Kept
/// crate-visible: user code reaches it only through
/// `Worker::spawn_async`/`WorkerHandle::spawn_async`, never constructs one
/// directly, so an external thread can never touch framework state except
/// through this one documented channel. Unlike `Callback`, `AsyncPromise`
/// genuinely is `Send`, which is the whole point of routing the async
/// bridge and [`crate::service::ClientRef::send`] through it rather than
/// through `Callback` itself.
pub(crate) struct AsyncPromise<T> {
    promise: Promise<T>,
}

impl<T: Send + 'static> AsyncPromise<T> {
    pub(crate) fn pair() -> (AsyncPromise<T>, Callback<T>) {
        let (promise, callback) = Promise::pair();
        (AsyncPromise { promise }, callback)
    }

    pub(crate) fn complete(self, result: CallbackResult<T>) {
        self.promise.complete(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn successful_executes_inline() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        Callback::successful(5).execute(move |r| {
            assert_eq!(r.unwrap(), 5);
            ran2.store(true, Ordering::SeqCst);
        });
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn map_chains_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        Callback::successful(1)
            .map(move |v| {
                o1.lock().unwrap().push("first");
                v + 1
            })
            .map(move |v| {
                o2.lock().unwrap().push("second");
                v + 1
            })
            .execute(|r| assert_eq!(r.unwrap(), 3));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn failure_skips_map_but_recover_salvages() {
        let cb: Callback<i32> = Callback::failed(CallbackError::new("boom"));
        cb.map(|v| v + 1)
            .recover(|_e| 42)
            .execute(|r| assert_eq!(r.unwrap(), 42));
    }

    #[test]
    fn flat_map_inherits_and_propagates_value() {
        Callback::successful(2)
            .flat_map(|v| Callback::successful(v * 10))
            .execute(|r| assert_eq!(r.unwrap(), 20));
    }

    #[test]
    fn flat_map_short_circuits_on_outer_error() {
        let inner_ran = Arc::new(AtomicBool::new(false));
        let inner_ran2 = inner_ran.clone();
        let cb: Callback<i32> = Callback::failed(CallbackError::new("nope"));
        cb.flat_map(move |v| {
            inner_ran2.store(true, Ordering::SeqCst);
            Callback::successful(v)
        })
        .execute(|r| assert!(r.is_err()));
        assert!(!inner_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn execute_attached_before_completion_still_runs() {
        let (promise, callback) = Promise::pair();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        callback.execute(move |r| {
            assert_eq!(r.unwrap(), 7);
            ran2.store(true, Ordering::SeqCst);
        });
        assert!(!ran.load(Ordering::SeqCst), "must not run before completion");
        promise.complete(Ok(7));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn completing_twice_panics() {
        let (promise, callback) = Promise::pair();
        let shared = callback.shared.clone();
        promise.complete(Ok(1));
        (Promise { shared }).complete(Ok(2));
    }

    #[test]
    fn async_promise_pair_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<AsyncPromise<u32>>();
    }
}
