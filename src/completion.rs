//! Single-use handoff between the task waiting for an engine operation and the engine side
//! which eventually produces its outcome.
//!
//! A [Completer] is consumed by [Completer::fulfill], so an operation resolves at most once.
//! If it's dropped unfulfilled (the engine gave up or its task panicked) the waiting side
//! resolves with an error instead of hanging.

use crate::error::{Error, Result};
use crate::handler::{spawn, MaybeSend};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::oneshot;

pub(crate) struct Completer<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Completer<T> {
    pub fn fulfill(self, result: Result<T>) {
        // waiter may be gone already ie. when the connection was closed meanwhile
        let _ = self.tx.send(result);
    }
}

pub(crate) struct Completion<T> {
    op: &'static str,
    kind: fn(String) -> Error,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Completion<T> {
    pub async fn wait(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err((self.kind)(format!(
                "{}: operation aborted by the engine",
                self.op
            ))),
        }
    }
}

/// Creates a handoff for `op`. An abandoned operation is reported as an error of `kind`.
pub(crate) fn completion<T>(
    op: &'static str,
    kind: fn(String) -> Error,
) -> (Completer<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, Completion { op, kind, rx })
}

/// Runs `fut` as a separate engine task and waits for its outcome. A panic inside `fut` is
/// reported to the caller as an error of `kind`.
pub(crate) async fn run<T, F>(op: &'static str, kind: fn(String) -> Error, fut: F) -> Result<T>
where
    T: MaybeSend + 'static,
    F: Future<Output = Result<T>> + MaybeSend + 'static,
{
    let (completer, completion) = completion(op, kind);
    spawn(async move {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => completer.fulfill(result),
            Err(_) => log::error!(target: "rtcpeer", "{op}: engine task panicked"),
        }
    });
    completion.wait().await
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod test {
    use super::*;

    #[tokio::test]
    async fn resolves_once_with_value() {
        let (completer, completion) = completion::<u32>("test", Error::Negotiation);
        completer.fulfill(Ok(7));
        assert_eq!(completion.wait().await, Ok(7));
    }

    #[tokio::test]
    async fn dropped_completer_fails_the_waiter() {
        let (completer, completion) = completion::<u32>("create offer", Error::Negotiation);
        drop(completer);
        let err = completion.wait().await.unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
    }

    #[tokio::test]
    async fn aborted_operation_keeps_its_error_kind() {
        let (completer, completion) = completion::<()>("add ice candidate", Error::Ice);
        drop(completer);
        let err = completion.wait().await.unwrap_err();
        assert_eq!(
            err,
            Error::Ice("add ice candidate: operation aborted by the engine".into())
        );
        assert!(!err.is_closed());
    }

    #[tokio::test]
    async fn panic_is_converted_into_error() {
        let res: Result<()> = run("add ice candidate", Error::Ice, async {
            if true {
                panic!("boom");
            }
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(Error::Ice(_))));

        let res = run("create answer", Error::Negotiation, async { Ok(1u8) }).await;
        assert_eq!(res, Ok(1));
    }
}
