use crate::{job::Work, task::Context};
use async_trait::async_trait;
use std::{fmt, hash::Hash, sync::Arc, time::Duration};
use tokio::time;

/// Something that can be fetched and is identified by a key.
pub trait Reference: Send + Sync + 'static {
    /// The identifier that fetched results are cached under.
    type Key: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}

/// Resolves references into payloads, typically over the network.
///
/// Dropping the future returned by [FetchSource::fetch] must abort the
/// underlying request. This is how cancelling a fetch task cancels the
/// request.
#[async_trait]
pub trait FetchSource: Send + Sync + 'static {
    type Reference: Reference;

    /// The type of fetched data.
    type Payload: Clone + Send + Sync + 'static;

    /// The type of error that can occur when fetching.
    type Error: std::error::Error + Send + Sync + 'static;

    async fn fetch(&self, reference: &Self::Reference) -> Result<Self::Payload, Self::Error>;
}

/// Shorthand for the key type of a source's references.
pub type KeyOf<S> = <<S as FetchSource>::Reference as Reference>::Key;

/// [Work] that fetches a single reference from a [FetchSource].
pub struct Fetch<S: FetchSource> {
    source: Arc<S>,
    reference: S::Reference,
    timeout: Option<Duration>,
}

impl<S: FetchSource> Fetch<S> {
    pub fn new(source: Arc<S>, reference: S::Reference) -> Self {
        Self {
            source,
            reference,
            timeout: None,
        }
    }

    /// Fails the fetch if it takes longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn reference(&self) -> &S::Reference {
        &self.reference
    }

    pub fn key(&self) -> KeyOf<S> {
        self.reference.key()
    }
}

#[async_trait]
impl<S: FetchSource> Work for Fetch<S> {
    type Output = S::Payload;
    type Error = FetchError<S::Error>;

    async fn run(&self, cx: &Context) -> Result<Option<S::Payload>, Self::Error> {
        tracing::debug!(task = %cx.id(), key = ?self.key(), "fetching");
        let request = self.source.fetch(&self.reference);
        let payload = match self.timeout {
            Some(timeout) => time::timeout(timeout, request)
                .await
                .map_err(|_| FetchError::Elapsed(timeout))?,
            None => request.await,
        }
        .map_err(FetchError::Source)?;
        Ok(Some(payload))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError<E> {
    #[error("fetch failed: {0}")]
    Source(#[source] E),
    #[error("fetch timed out after {0:?}")]
    Elapsed(Duration),
}
