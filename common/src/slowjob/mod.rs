// Copyright James Carl (C) 2020
// AGPL-3.0-or-later

//! A pool for expensive jobs that don't need to finish within the tick that started them, such as
//! generating terrain.
//!
//! Jobs are sorted into named categories. The pool has a global limit on how many jobs may run at
//! once, and every category has its own limit on top of that. Jobs that can't start right away wait
//! in their category's queue. The job with the lowest priority value starts first, and jobs with the
//! same priority start in the order they were spawned. Whenever a job finishes, every category gets
//! a chance to start its queued jobs, so freed capacity never sits idle.
//!
//! A queued job can be cancelled outright. A running job can only be asked to stop through its
//! [`CancelToken`]. It keeps its slot until it actually returns.
//!
//! If a job panics, the panic is caught, logged and counted, and the pool carries on. Unless the job
//! was spawned with [`SlowJobPool::spawn_async`], nobody else finds out about it.

mod cancel;
mod future;

pub use cancel::CancelToken;
pub use future::JobFuture;

use antidote::Mutex;
use std::{
    any::Any,
    cmp,
    collections::{BTreeMap, BinaryHeap, HashMap},
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use thiserror::Error;
use threadpool::ThreadPool;

/// The work of a slow job. It is given a token that tells it when it has been asked to stop.
pub type JobCallback = dyn FnOnce(&CancelToken) + Send + 'static;

/// Things that can go wrong with a slow job.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JobError {
    /// Jobs were submitted to a category that was never configured.
    #[error("Slow job category \"{0}\" was never configured.")]
    NotConfigured(String),

    /// The job was removed from its queue, or the pool was dropped, before the job could run.
    #[error("Slow job was cancelled before it ran.")]
    Cancelled,

    /// The job panicked.
    #[error("Slow job panicked: {0}")]
    Panicked(String),
}

/// A slow job result type.
pub type JobResult<O> = std::result::Result<O, JobError>;

/// A handle to a job that was spawned into the pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SlowJob {
    name: String,
    id: u64,
}

impl SlowJob {
    /// The category the job was spawned in.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The identifier of the job. Unique for the lifetime of the pool.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// The outcome of [`SlowJobPool::try_run`].
pub enum Admission<F> {
    /// The job is running.
    Started(SlowJob),

    /// There was no room for the job. Nothing about the pool changed, and you get the work back so you
    /// can try again later, spawn it into the queue, or drop it.
    Rejected(F),
}

impl<F> Admission<F> {
    /// True if the job was started.
    pub fn is_started(&self) -> bool {
        matches!(self, Admission::Started(_))
    }

    /// The handle of the job, if it was started.
    pub fn started(self) -> Option<SlowJob> {
        match self {
            Admission::Started(job) => Some(job),
            Admission::Rejected(_) => None,
        }
    }
}

/// A job waiting in a queue.
struct QueuedJob {
    id: u64,
    priority: i32,
    callback: Box<JobCallback>,
}

// Ordered by priority, then by id, so that equal priorities come out first in, first out.
// The queues wrap these in a Reverse so the smallest comes out first.
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.priority.cmp(&other.priority).then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.id == other.id
    }
}

impl Eq for QueuedJob {}

struct Category {
    limit: usize,
    running: usize,
    queue: BinaryHeap<cmp::Reverse<QueuedJob>>,
}

impl Category {
    fn new(limit: usize) -> Category {
        Category { limit, running: 0, queue: BinaryHeap::new() }
    }

    fn has_capacity(&self) -> bool {
        self.running < self.limit
    }
}

/// Everything that has to be changed under the lock.
struct PoolState {
    categories: BTreeMap<String, Category>,
    running: usize,
    next_id: u64,
    running_tokens: HashMap<u64, CancelToken>,
    panicked: u64,
    workers: ThreadPool,
}

struct Shared {
    global_limit: usize,
    state: Mutex<PoolState>,
}

impl Shared {
    /// Start as many queued jobs as the limits allow.
    fn spawn_queued(shared: &Arc<Shared>, state: &mut PoolState) {
        let PoolState { categories, running, running_tokens, workers, .. } = state;

        for (name, category) in categories.iter_mut() {
            while *running < shared.global_limit && category.has_capacity() {
                let job = match category.queue.pop() {
                    Some(cmp::Reverse(job)) => job,
                    None => break,
                };

                category.running += 1;
                *running += 1;
                Shared::launch(shared, running_tokens, workers, name, job);
            }
        }
    }

    /// Hand a job to the workers. The caller must have already counted it as running.
    fn launch(
        shared: &Arc<Shared>, running_tokens: &mut HashMap<u64, CancelToken>, workers: &ThreadPool, name: &str,
        job: QueuedJob,
    ) {
        let QueuedJob { id, priority, callback } = job;
        let token = CancelToken::new();
        running_tokens.insert(id, token.clone());

        log::debug!("Starting slow job {} in {} with priority {}.", id, name, priority);

        let shared = Arc::clone(shared);
        let name = name.to_owned();
        workers.execute(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(move || callback(&token)));
            let panicked = match outcome {
                Ok(()) => false,
                Err(payload) => {
                    log::warn!("Slow job {} in {} panicked: {}", id, name, panic_message(payload.as_ref()));
                    true
                }
            };

            // This has to run no matter how the job ended, or its slot would leak.
            Shared::finish(&shared, &name, id, panicked);
        });
    }

    fn finish(shared: &Arc<Shared>, name: &str, id: u64, panicked: bool) {
        let mut guard = shared.state.lock();
        let state = &mut *guard;

        if let Some(category) = state.categories.get_mut(name) {
            category.running = category.running.saturating_sub(1);
        }
        state.running = state.running.saturating_sub(1);
        state.running_tokens.remove(&id);
        if panicked {
            state.panicked += 1;
        }

        log::debug!("Slow job {} in {} finished.", id, name);

        // Anything in any category may be able to start now.
        Shared::spawn_queued(shared, state);
    }
}

/// Runs expensive jobs in the background, within a global limit and a limit per category.
///
/// Cloning the pool gives another handle to the same pool.
#[derive(Clone)]
pub struct SlowJobPool {
    shared: Arc<Shared>,
}

impl SlowJobPool {
    /// Create a pool that will run at most `global_limit` jobs at once. A limit of zero is treated as one.
    /// The pool gets a worker thread for every job it can run at once.
    pub fn new(global_limit: usize) -> SlowJobPool {
        let global_limit = global_limit.max(1);
        let workers = threadpool::Builder::new().num_threads(global_limit).thread_name(String::from("slowjob")).build();

        let state = PoolState {
            categories: BTreeMap::new(),
            running: 0,
            next_id: 0,
            running_tokens: HashMap::new(),
            panicked: 0,
            workers,
        };

        SlowJobPool { shared: Arc::new(Shared { global_limit, state: Mutex::new(state) }) }
    }

    /// The most jobs that may run at once, across all categories.
    pub fn global_limit(&self) -> usize {
        self.shared.global_limit
    }

    /// Configure a category. Its limit is worked out by passing the global limit to `limit_fn`, and is
    /// never less than one. Configuring a category again only changes its limit. Its queue and running
    /// jobs are left alone.
    pub fn configure<F>(&self, name: &str, limit_fn: F)
    where
        F: FnOnce(usize) -> usize,
    {
        // Called before taking the lock. We don't run outside code in there.
        let limit = limit_fn(self.shared.global_limit).max(1);

        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        state.categories.entry(name.to_owned()).and_modify(|category| category.limit = limit).or_insert_with(|| {
            log::debug!("Configured slow job category {}.", name);
            Category::new(limit)
        });

        // A raised limit may let queued jobs start.
        Shared::spawn_queued(&self.shared, state);
    }

    /// Queue a job. It starts right away if there's room for it. Lower priority values start first.
    pub fn spawn<F>(&self, name: &str, work: F, priority: i32) -> JobResult<SlowJob>
    where
        F: FnOnce(&CancelToken) + Send + 'static,
    {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        let category = match state.categories.get_mut(name) {
            Some(category) => category,
            None => return Err(JobError::NotConfigured(name.to_owned())),
        };

        let id = state.next_id;
        state.next_id += 1;
        category.queue.push(cmp::Reverse(QueuedJob { id, priority, callback: Box::new(work) }));
        log::trace!("Queued slow job {} in {}.", id, name);

        Shared::spawn_queued(&self.shared, state);

        Ok(SlowJob { name: name.to_owned(), id })
    }

    /// Start a job right now, or not at all. It never gets queued.
    /// The job starts only if both the global limit and the category limit have room for it.
    pub fn try_run<F>(&self, name: &str, work: F, priority: i32) -> JobResult<Admission<F>>
    where
        F: FnOnce(&CancelToken) + Send + 'static,
    {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        let category = match state.categories.get_mut(name) {
            Some(category) => category,
            None => return Err(JobError::NotConfigured(name.to_owned())),
        };

        if state.running >= self.shared.global_limit || !category.has_capacity() {
            return Ok(Admission::Rejected(work));
        }

        let id = state.next_id;
        state.next_id += 1;
        category.running += 1;
        state.running += 1;

        let job = QueuedJob { id, priority, callback: Box::new(work) };
        Shared::launch(&self.shared, &mut state.running_tokens, &state.workers, name, job);

        Ok(Admission::Started(SlowJob { name: name.to_owned(), id }))
    }

    /// Like [`SlowJobPool::spawn`], but you also get a future that resolves once the job is done.
    ///
    /// The future resolves exactly once: with the job's return value, with [`JobError::Panicked`] if it
    /// panicked, or with [`JobError::Cancelled`] if it was cancelled before it started.
    pub fn spawn_async<F, R>(&self, name: &str, work: F, priority: i32) -> JobResult<(SlowJob, JobFuture<R>)>
    where
        F: FnOnce(&CancelToken) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (completer, future) = future::channel();

        let job = self.spawn(
            name,
            move |token: &CancelToken| {
                match panic::catch_unwind(AssertUnwindSafe(move || work(token))) {
                    Ok(result) => completer.complete(Ok(result)),
                    Err(payload) => {
                        completer.complete(Err(JobError::Panicked(panic_message(payload.as_ref()))));

                        // Let the worker see the panic too, so it gets logged like any other.
                        panic::resume_unwind(payload);
                    }
                }
            },
            priority,
        )?;

        Ok((job, future))
    }

    /// Remove a job from its queue before it starts. Returns false if the job is not queued, which is
    /// the case once it has started running.
    pub fn cancel(&self, job: &SlowJob) -> bool {
        let removed = {
            let mut state = self.shared.state.lock();
            let category = match state.categories.get_mut(job.name()) {
                Some(category) => category,
                None => return false,
            };

            // Pull the job out and rebuild the heap from the rest. Their ordering keys don't change, so
            // neither does the order they come out in.
            let queue = std::mem::take(&mut category.queue);
            let (removed, kept): (Vec<_>, Vec<_>) =
                queue.into_vec().into_iter().partition(|cmp::Reverse(queued)| queued.id == job.id());
            category.queue = BinaryHeap::from(kept);

            removed
        };

        // The job gets dropped out here, since dropping it could run anything.
        let cancelled = !removed.is_empty();
        if cancelled {
            log::debug!("Cancelled queued slow job {} in {}.", job.id(), job.name());
        }

        cancelled
    }

    /// Ask a running job to stop. Returns false if the job is not running.
    ///
    /// This only signals the job's [`CancelToken`]. The job keeps its slot until it returns.
    pub fn cancel_running(&self, job: &SlowJob) -> bool {
        let state = self.shared.state.lock();
        match state.running_tokens.get(&job.id()) {
            Some(token) => {
                token.cancel();
                log::debug!("Asked running slow job {} in {} to stop.", job.id(), job.name());
                true
            }
            None => false,
        }
    }

    /// The number of jobs of a category that are running.
    pub fn running_jobs(&self, name: &str) -> usize {
        self.shared.state.lock().categories.get(name).map(|category| category.running).unwrap_or(0)
    }

    /// The number of jobs of a category that are waiting to run.
    pub fn queued_jobs(&self, name: &str) -> usize {
        self.shared.state.lock().categories.get(name).map(|category| category.queue.len()).unwrap_or(0)
    }

    /// The number of jobs running across all categories.
    pub fn total_running(&self) -> usize {
        self.shared.state.lock().running
    }

    /// The number of jobs that have panicked since the pool was created.
    pub fn panicked_jobs(&self) -> u64 {
        self.shared.state.lock().panicked
    }

    /// The limit of a category, if it has been configured.
    pub fn category_limit(&self, name: &str) -> Option<usize> {
        self.shared.state.lock().categories.get(name).map(|category| category.limit)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        String::from(*message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("Unknown panic.")
    }
}
