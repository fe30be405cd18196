use crate::task::Context;
use async_trait::async_trait;
use std::{
    convert::Infallible,
    fmt,
    sync::{Mutex, PoisonError},
};

/// The work performed by a [Task](crate::Task).
///
/// Every kind of task (fetching, storing, delivering) implements this one
/// trait, and the task lifecycle is generic over it.
#[async_trait]
pub trait Work: Send + Sync + 'static {
    /// The type of result the work produces.
    type Output: Send + Sync + 'static;

    /// The type of error that can occur when performing the work.
    type Error: fmt::Display + Send + 'static;

    /// Performs the work.
    ///
    /// Returning `Ok(None)` means the work completed without producing a
    /// result, for example because there was nothing to act on.
    async fn run(&self, cx: &Context) -> Result<Option<Self::Output>, Self::Error>;
}

/// Work backed by a one-shot closure.
///
/// Used for lightweight synchronous steps that follow another task, such as
/// writing a fetched value into a cache.
pub struct Block<F> {
    f: Mutex<Option<F>>,
}

impl<F> Block<F>
where
    F: FnOnce(&Context) + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f: Mutex::new(Some(f)),
        }
    }
}

#[async_trait]
impl<F> Work for Block<F>
where
    F: FnOnce(&Context) + Send + 'static,
{
    type Output = ();
    type Error = Infallible;

    async fn run(&self, cx: &Context) -> Result<Option<()>, Infallible> {
        let f = self.f.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(f.map(|f| f(cx)))
    }
}

impl<F> fmt::Debug for Block<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").finish_non_exhaustive()
    }
}
