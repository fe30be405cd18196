mod common;

use async_trait::async_trait;
use common::setup;
use fetch_jobs::{Config, Context, Job, Scheduler, Task, TaskState, Work};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;

/// Work that sleeps for a while and records whether its predecessor had
/// finished by the time it began.
struct Witness {
    delay: Duration,
    predecessor: Option<Arc<dyn Job>>,
    runs: AtomicUsize,
    saw_unfinished_predecessor: AtomicBool,
}

impl Witness {
    fn new(delay: Duration, predecessor: Option<Arc<dyn Job>>) -> Self {
        Self {
            delay,
            predecessor,
            runs: AtomicUsize::new(0),
            saw_unfinished_predecessor: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Work for Witness {
    type Output = ();
    type Error = Infallible;

    async fn run(&self, _cx: &Context) -> Result<Option<()>, Infallible> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(predecessor) = &self.predecessor {
            if predecessor.state() != TaskState::Finished {
                self.saw_unfinished_predecessor.store(true, Ordering::SeqCst);
            }
        }
        tokio::time::sleep(self.delay).await;
        Ok(Some(()))
    }
}

/// One randomized interleaving of scheduling, starting and cancelling a
/// task `a` and a task `b` that depends on it.
async fn interleaving(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let config = Config {
        max_concurrent_tasks: rng.gen_bool(0.5).then_some(1),
        ..Config::default()
    };
    let scheduler = Scheduler::new(&config).unwrap();

    let a = Task::new(Witness::new(
        Duration::from_micros(rng.gen_range(0..500)),
        None,
    ));
    let b = Task::new(Witness::new(
        Duration::from_micros(rng.gen_range(0..500)),
        Some(a.as_job()),
    ));
    b.add_dependency(&a);

    // Schedule `a`, run it by hand, or both at once, in either order
    // relative to `b`.
    let (a_scheduled, a_by_hand) = match rng.gen_range(0..3) {
        0 => (true, false),
        1 => (false, true),
        _ => (true, true),
    };
    let b_first = rng.gen_bool(0.5);
    let mut a_runner: Option<JoinHandle<()>> = None;
    let start_a = |runner: &mut Option<JoinHandle<()>>| {
        // `a` must still be idle when it is scheduled. When both happen,
        // the two starts then race and either may win.
        if a_scheduled {
            scheduler.add(&a).unwrap();
        }
        if a_by_hand {
            let a = a.clone();
            *runner = Some(tokio::spawn(async move { a.start().await }));
        }
    };
    if b_first {
        scheduler.add(&b).unwrap();
        tokio::task::yield_now().await;
        start_a(&mut a_runner);
    } else {
        start_a(&mut a_runner);
        scheduler.add(&b).unwrap();
    }

    // Sprinkle cancellations at random points.
    for _ in 0..rng.gen_range(0..3) {
        if rng.gen_bool(0.5) {
            tokio::time::sleep(Duration::from_micros(rng.gen_range(0..300))).await;
        }
        if rng.gen_bool(0.5) {
            a.cancel();
        } else {
            b.cancel();
        }
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        scheduler.wait_idle().await;
        a.finished().await;
        b.finished().await;
    })
    .await
    .unwrap_or_else(|_| panic!("seed {seed}: tasks did not finish"));
    if let Some(runner) = a_runner {
        runner.await.unwrap();
    }

    assert_eq!(a.state(), TaskState::Finished, "seed {seed}");
    assert_eq!(b.state(), TaskState::Finished, "seed {seed}");
    assert!(a.work().runs.load(Ordering::SeqCst) <= 1, "seed {seed}");
    assert!(b.work().runs.load(Ordering::SeqCst) <= 1, "seed {seed}");
    assert!(
        !b.work().saw_unfinished_predecessor.load(Ordering::SeqCst),
        "seed {seed}: b started before a finished"
    );
    if a.is_cancelled() {
        assert!(a.output().is_none(), "seed {seed}");
    }
    if b.is_cancelled() {
        assert!(b.output().is_none(), "seed {seed}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dependent_never_starts_before_predecessor_finishes() {
    setup();
    for seed in 0..128 {
        interleaving(seed).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chains_run_in_order() {
    setup();
    let scheduler = Scheduler::new(&Config::default()).unwrap();
    let mut previous: Option<Task<Witness>> = None;
    let mut chain = Vec::new();
    for _ in 0..20 {
        let task = Task::new(Witness::new(
            Duration::from_micros(50),
            previous.as_ref().map(Task::as_job),
        ));
        if let Some(previous) = &previous {
            task.add_dependency(previous);
        }
        chain.push(task.clone());
        previous = Some(task);
    }
    chain[7].cancel();
    // Schedule back to front so most edges start out external.
    for task in chain.iter().rev() {
        scheduler.add(task).unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle())
        .await
        .unwrap();
    for (i, task) in chain.iter().enumerate() {
        assert_eq!(task.state(), TaskState::Finished);
        assert!(!task.work().saw_unfinished_predecessor.load(Ordering::SeqCst));
        let expected_runs = usize::from(i != 7);
        assert_eq!(task.work().runs.load(Ordering::SeqCst), expected_runs);
    }
}
