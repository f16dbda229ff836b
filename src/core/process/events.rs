use crate::core::error::Result;
use crate::core::lock;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Lifecycle events fired by processes and experiments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Start,
    End,
}

pub type SyncListener<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub type AsyncListener<T> = Arc<dyn Fn(Arc<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Two ordered lists of subscribers per event.
///
/// Firing calls every synchronous listener first, then awaits the
/// asynchronous ones one after the other in registration order. The first
/// asynchronous error stops the chain and is returned.
pub struct Observable<T> {
    sync: Mutex<Vec<(Event, SyncListener<T>)>>,
    asynchronous: Mutex<Vec<(Event, AsyncListener<T>)>>,
}

impl<T: Send + Sync + 'static> Observable<T> {
    pub fn new() -> Self {
        Self {
            sync: Mutex::new(Vec::new()),
            asynchronous: Mutex::new(Vec::new()),
        }
    }

    pub fn on(&self, event: Event, listener: impl Fn(&T) + Send + Sync + 'static) {
        lock(&self.sync).push((event, Arc::new(listener)));
    }

    pub fn on_async<F, Fut>(&self, event: Event, listener: F)
    where
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let listener: AsyncListener<T> = Arc::new(move |subject| listener(subject).boxed());
        lock(&self.asynchronous).push((event, listener));
    }

    pub fn count(&self, event: Event) -> usize {
        lock(&self.sync).iter().filter(|(e, _)| *e == event).count()
            + lock(&self.asynchronous)
                .iter()
                .filter(|(e, _)| *e == event)
                .count()
    }

    pub async fn fire(&self, event: Event, subject: &Arc<T>) -> Result<()> {
        let sync: Vec<SyncListener<T>> = lock(&self.sync)
            .iter()
            .filter(|(e, _)| *e == event)
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in sync {
            listener(subject.as_ref());
        }

        let asynchronous: Vec<AsyncListener<T>> = lock(&self.asynchronous)
            .iter()
            .filter(|(e, _)| *e == event)
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in asynchronous {
            listener(Arc::clone(subject)).await?;
        }
        Ok(())
    }
}

impl<T: Send + Sync + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}
