//! A keyed memoization cache plus cancellable, dependency-ordered tasks that
//! fill it.
//!
//! [KeyedCache] serializes all access through a single owner. [Task] wraps
//! a unit of [Work] in an `Idle -> Executing -> Finished` lifecycle with
//! cancellation. [Scheduler] runs tasks once their predecessors have
//! finished. [Loader] ties them together: check the cache, fetch on a miss,
//! then store and deliver the result.

mod cache;
mod config;
mod defer;
mod fetch;
mod graph;
mod job;
mod loader;
mod scheduler;
mod task;

pub use cache::{Cache, KeyedCache};
pub use config::{Config, ConfigError};
pub use fetch::{Fetch, FetchError, FetchSource, KeyOf, Reference};
pub use job::{Block, Work};
pub use loader::{Delivery, Loader, Pending};
pub use scheduler::{Scheduler, SchedulerError};
pub use task::{Context, Job, Task, TaskId, TaskState};
