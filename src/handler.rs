//! Event handler cells and the execution-model glue shared by both backends.
//!
//! The native backend runs on a multi-threaded tokio runtime, so everything crossing tasks has
//! to be `Send + Sync`. The browser backend is single-threaded and deals with `!Send` JS
//! handles, so the same bounds collapse to nothing there.

use arc_swap::ArcSwapOption;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

#[cfg(not(target_arch = "wasm32"))]
mod bounds {
    pub trait MaybeSend: Send {}
    impl<T: Send + ?Sized> MaybeSend for T {}

    pub trait MaybeSendSync: Send + Sync {}
    impl<T: Send + Sync + ?Sized> MaybeSendSync for T {}

    pub(crate) type BoxedHandler<T> = Box<dyn Fn(T) + Send + Sync>;
}

#[cfg(target_arch = "wasm32")]
mod bounds {
    pub trait MaybeSend {}
    impl<T: ?Sized> MaybeSend for T {}

    pub trait MaybeSendSync {}
    impl<T: ?Sized> MaybeSendSync for T {}

    pub(crate) type BoxedHandler<T> = Box<dyn Fn(T)>;
}

pub use bounds::{MaybeSend, MaybeSendSync};
pub(crate) use bounds::BoxedHandler;

#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn spawn<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(fut);
}

#[cfg(target_arch = "wasm32")]
pub(crate) fn spawn<F>(fut: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(fut);
}

/// Holds at most one handler. Setting a new handler replaces the previous one.
pub(crate) struct HandlerSlot<T> {
    name: &'static str,
    handler: ArcSwapOption<BoxedHandler<T>>,
}

impl<T> HandlerSlot<T> {
    pub fn new(name: &'static str) -> Self {
        HandlerSlot {
            name,
            handler: ArcSwapOption::empty(),
        }
    }

    pub fn set(&self, handler: BoxedHandler<T>) {
        self.handler.store(Some(Arc::new(handler)));
    }

    pub fn clear(&self) {
        self.handler.store(None);
    }

    pub fn is_set(&self) -> bool {
        self.handler.load().is_some()
    }

    /// Invokes the current handler, if any. Returns `false` when no handler was registered.
    /// A panicking handler is logged and doesn't affect the delivery of further events.
    pub fn emit(&self, value: T) -> bool {
        let handler = match self.handler.load_full() {
            Some(handler) => handler,
            None => return false,
        };
        if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
            log::error!(target: "rtcpeer", "{} handler panicked", self.name);
        }
        true
    }
}

impl<T> std::fmt::Debug for HandlerSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSlot")
            .field("name", &self.name)
            .field("set", &self.is_set())
            .finish()
    }
}
