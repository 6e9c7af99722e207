//! Result sequences that own their command.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};

use super::CommandScope;
use crate::ambient;
use crate::db::{Command, DialectProvider};
use crate::error::Result;

/// Iterator returned by [`ExecFilter::exec_lazy`](super::ExecFilter::exec_lazy).
///
/// Each pull runs with the command's dialect as the ambient dialect. The
/// command is disposed after the inner iterator reports its end, or when this
/// value is dropped, whichever comes first. The inner iterator is always
/// dropped before the command.
pub struct LazyResults<'f, I> {
    scope: Option<CommandScope<'f>>,
    iter: Option<I>,
    dialect: Arc<dyn DialectProvider>,
}

impl<'f, I: Iterator> LazyResults<'f, I> {
    pub(super) fn new(scope: CommandScope<'f>, iter: I, dialect: Arc<dyn DialectProvider>) -> Self {
        Self {
            scope: Some(scope),
            iter: Some(iter),
            dialect,
        }
    }
}

impl<I> LazyResults<'_, I> {
    /// The owned command, until it has been disposed.
    pub fn command(&self) -> Option<&Command> {
        self.scope.as_ref().map(|scope| &scope.command)
    }

    pub fn is_disposed(&self) -> bool {
        self.scope.is_none()
    }

    fn finish(&mut self) {
        if self.scope.is_none() {
            return;
        }
        let iter = self.iter.take();
        let scope = self.scope.take();
        ambient::with_dialect_sync(Arc::clone(&self.dialect), move || {
            drop(iter);
            drop(scope);
        });
    }
}

impl<I: Iterator> Iterator for LazyResults<'_, I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        let iter = self.iter.as_mut()?;
        let item = ambient::with_dialect_sync(Arc::clone(&self.dialect), || iter.next());
        if item.is_none() {
            self.finish();
        }
        item
    }
}

impl<I> Drop for LazyResults<'_, I> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Stream returned by [`ExecFilter::exec_stream`](super::ExecFilter::exec_stream).
///
/// Disposes its command once the inner stream ends or this value is dropped,
/// after the inner stream itself has been dropped.
pub struct LazyStream<'f, T> {
    scope: Option<CommandScope<'f>>,
    stream: Option<BoxStream<'static, Result<T>>>,
    dialect: Arc<dyn DialectProvider>,
}

impl<'f, T> LazyStream<'f, T> {
    pub(super) fn new(
        scope: CommandScope<'f>,
        stream: BoxStream<'static, Result<T>>,
        dialect: Arc<dyn DialectProvider>,
    ) -> Self {
        Self {
            scope: Some(scope),
            stream: Some(stream),
            dialect,
        }
    }

    pub fn command(&self) -> Option<&Command> {
        self.scope.as_ref().map(|scope| &scope.command)
    }

    pub fn is_disposed(&self) -> bool {
        self.scope.is_none()
    }

    fn finish(&mut self) {
        if self.scope.is_none() {
            return;
        }
        let stream = self.stream.take();
        let scope = self.scope.take();
        ambient::with_dialect_sync(Arc::clone(&self.dialect), move || {
            drop(stream);
            drop(scope);
        });
    }
}

impl<T> Stream for LazyStream<'_, T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(None);
        };
        let polled =
            ambient::with_dialect_sync(Arc::clone(&this.dialect), || stream.poll_next_unpin(cx));
        if let Poll::Ready(None) = polled {
            this.finish();
        }
        polled
    }
}

impl<T> Drop for LazyStream<'_, T> {
    fn drop(&mut self) {
        self.finish();
    }
}
