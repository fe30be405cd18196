#![allow(dead_code)]

use async_trait::async_trait;
use fetch_jobs::{FetchSource, Reference};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};
use tokio::sync::Semaphore;
use tracing_subscriber::{filter::EnvFilter, fmt::fmt};

/// Captures logs of the crate under test in the test output.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("fetch_jobs=trace"))
        .with_target(false)
        .with_test_writer()
        .try_init()
        .ok();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhotoRef {
    pub id: u32,
}

impl Reference for PhotoRef {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }
}

#[derive(thiserror::Error, Debug)]
#[error("no photo with id {0}")]
pub struct Missing(pub u32);

/// A fetch source that serves fixed payloads and can be told to hold every
/// request until released.
pub struct FakeSource {
    payloads: Mutex<HashMap<u32, Vec<u8>>>,
    stalled: bool,
    gate: Semaphore,
    started: AtomicUsize,
    aborted: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A source whose requests wait for [FakeSource::release].
    pub fn stalled() -> Self {
        Self::build(true)
    }

    fn build(stalled: bool) -> Self {
        Self {
            payloads: Mutex::default(),
            stalled,
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            aborted: AtomicUsize::new(0),
        }
    }

    pub fn with(self, id: u32, payload: &[u8]) -> Self {
        self.payloads.lock().unwrap().insert(id, payload.to_vec());
        self
    }

    /// Lets `count` stalled requests complete.
    pub fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Requests dropped before they completed.
    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Counts a request as aborted if dropped while still armed.
struct InFlight<'a> {
    aborted: &'a AtomicUsize,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl FetchSource for FakeSource {
    type Reference = PhotoRef;
    type Payload = Vec<u8>;
    type Error = Missing;

    async fn fetch(&self, reference: &PhotoRef) -> Result<Vec<u8>, Missing> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut request = InFlight {
            aborted: &self.aborted,
            armed: true,
        };
        if self.stalled {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        request.armed = false;
        self.payloads
            .lock()
            .unwrap()
            .get(&reference.id)
            .cloned()
            .ok_or(Missing(reference.id))
    }
}

/// Yields until `done` holds, for at most a few seconds.
pub async fn eventually(mut done: impl FnMut() -> bool) {
    for _ in 0..5000 {
        if done() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
