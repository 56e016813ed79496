//! A thin wrapper around [`tokio::task::JoinHandle`] that converts join
//! errors (task panic or cancellation) into this crate's [`Error`] type,
//! so background worker tasks can be awaited without leaking `tokio`
//! error types through the public API.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::error::{Error, ErrorKind, LibraryError, Result};

#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T> {
    inner: tokio::task::JoinHandle<T>,
}

impl<T> AsyncJoinHandle<T> {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self {
            inner: tokio::spawn(future),
        }
    }

    pub(crate) fn abort(&self) {
        self.inner.abort();
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.inner) };
        inner.poll(cx).map(|result| {
            result.map_err(|e| {
                Error::from(ErrorKind::Library(LibraryError::Internal {
                    message: format!("background task failed: {e}"),
                }))
            })
        })
    }
}
