//! Helpers for running the blocking import pipeline from Tokio.

use core::fmt::{Debug, Display};

use anyhow::Result;
use futures_util::{Future, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Call a faillible future, while monitoring `cancellable` and return an error if cancelled.
pub async fn run_with_cancellable<F, R>(f: F, cancellable: &CancellationToken) -> Result<R>
where
    F: Future<Output = Result<R>>,
{
    if cancellable.is_cancelled() {
        return Err(Error::Cancelled.into());
    }
    tokio::select! {
       r = f => r,
       _ = cancellable.cancelled() => Err(Error::Cancelled.into()),
    }
}

/// Run `f` on the blocking pool with `token`, which is cancelled when the
/// returned future is dropped.
pub fn spawn_blocking_with_token<F, R>(
    token: CancellationToken,
    f: F,
) -> impl Future<Output = std::result::Result<R, tokio::task::JoinError>>
where
    F: FnOnce(&CancellationToken) -> R + Send + 'static,
    R: Send + 'static,
{
    let guard = token.clone().drop_guard();
    let handle = tokio::task::spawn_blocking(move || f(&token));
    async move {
        let r = handle.await;
        drop(guard);
        r
    }
}

/// Wrapper for [`tokio::task::spawn_blocking`] which provides a [`CancellationToken`] that will be triggered on drop.
///
/// The blocking import functions check the token between archive entries, so
/// dropping the future bounds how long the worker thread stays busy.
///
/// This is in a sense the inverse of [`run_with_cancellable`].
pub fn spawn_blocking_cancellable<F, R>(
    f: F,
) -> impl Future<Output = std::result::Result<R, tokio::task::JoinError>>
where
    F: FnOnce(&CancellationToken) -> R + Send + 'static,
    R: Send + 'static,
{
    spawn_blocking_with_token(CancellationToken::new(), f)
}

/// Flatten a nested Result<Result<T>>, defaulting to converting the error type to an `anyhow::Error`.
pub(crate) fn flatten_anyhow<T, E>(r: std::result::Result<Result<T>, E>) -> Result<T>
where
    E: Display + Debug + Send + Sync + 'static,
{
    match r {
        Ok(x) => x,
        Err(e) => Err(anyhow::anyhow!(e)),
    }
}

/// A wrapper around [`spawn_blocking_cancellable`] that flattens nested results.
pub fn spawn_blocking_cancellable_flatten<F, T>(f: F) -> impl Future<Output = Result<T>>
where
    F: FnOnce(&CancellationToken) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking_cancellable(f).map(flatten_anyhow)
}

/// A wrapper around [`spawn_blocking_with_token`] that flattens nested results.
pub fn spawn_blocking_with_token_flatten<F, T>(
    token: CancellationToken,
    f: F,
) -> impl Future<Output = Result<T>>
where
    F: FnOnce(&CancellationToken) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking_with_token(token, f).map(flatten_anyhow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancellable() {
        let cancellable = CancellationToken::new();

        let cancellable_copy = cancellable.clone();
        let s = async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            cancellable_copy.cancel();
        };
        let r = async move {
            tokio::time::sleep(std::time::Duration::from_secs(200)).await;
            Ok(())
        };
        let r = run_with_cancellable(r, &cancellable);
        let (_, r) = tokio::join!(s, r);
        let e = r.unwrap_err();
        assert!(matches!(Error::find(&e), Some(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_on_drop() {
        let (tx, rx) = std::sync::mpsc::channel();
        let fut = spawn_blocking_cancellable(move |c| {
            tx.send(c.clone()).unwrap();
        });
        let token = rx.recv().unwrap();
        assert!(!token.is_cancelled());
        drop(fut);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_flatten() {
        let r = spawn_blocking_cancellable_flatten(|c| {
            assert!(!c.is_cancelled());
            Ok(42)
        })
        .await
        .unwrap();
        assert_eq!(r, 42);
    }
}
