// Copyright James Carl (C) 2020
// AGPL-3.0-or-later

//! Systems and the schedulers that run them once per tick.
//!
//! The [`Scheduler`] runs its systems one after the other in the order they were added, so a system
//! always sees the writes of the systems before it. The [`ParallelScheduler`] runs all of its systems
//! at once on a rayon thread pool and waits for every one of them to finish.
//!
//! The parallel scheduler does not check what its systems touch. It is up to you to only put systems
//! in it that work on different component types.

use crate::world::World;
use anyhow::{Context, Result};
use rayon::{prelude::*, ThreadPool};
use std::{error, fmt, sync::Arc};

/// A unit of logic that runs over the world once per tick.
pub trait System: Send + Sync {
    /// A name for logging and error reporting.
    fn name(&self) -> &str;

    /// Run the system.
    fn run(&self, world: &World) -> Result<()>;
}

/// A system made out of a closure.
pub struct FnSystem<F> {
    name: String,
    function: F,
}

impl<F> FnSystem<F>
where
    F: Fn(&World) -> Result<()> + Send + Sync,
{
    /// Wrap a closure into a system.
    pub fn new(name: impl Into<String>, function: F) -> FnSystem<F> {
        FnSystem { name: name.into(), function }
    }
}

impl<F> System for FnSystem<F>
where
    F: Fn(&World) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, world: &World) -> Result<()> {
        (self.function)(world)
    }
}

/// Runs systems one at a time, in the order they were added.
#[derive(Default)]
pub struct Scheduler {
    systems: Vec<Box<dyn System>>,
}

impl Scheduler {
    /// Create a scheduler with no systems.
    pub fn new() -> Scheduler {
        Scheduler { systems: Vec::new() }
    }

    /// Add a system to the end of the list.
    pub fn add<S: System + 'static>(&mut self, system: S) {
        self.systems.push(Box::new(system));
    }

    /// Add a closure as a system to the end of the list.
    pub fn add_fn<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&World) -> Result<()> + Send + Sync + 'static,
    {
        self.add(FnSystem::new(name, function));
    }

    /// The number of systems.
    pub fn len(&self) -> usize {
        self.systems.len()
    }

    /// True if there are no systems.
    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    /// Run every system once.
    /// If a system fails, the systems after it are not run and the error is returned.
    pub fn run(&self, world: &World) -> Result<()> {
        for system in &self.systems {
            log::trace!("Running system {}.", system.name());
            system.run(world).with_context(|| format!("System {} failed.", system.name()))?;
        }

        Ok(())
    }
}

/// A system that failed while running in a [`ParallelScheduler`].
#[derive(Debug)]
pub struct SystemFailure {
    /// Name of the system.
    pub system: String,
    /// What went wrong.
    pub error: anyhow::Error,
}

/// Returned when one or more systems of a [`ParallelScheduler`] fail.
/// Every failure is kept, in the order the systems were added.
#[derive(Debug)]
pub struct ScheduleError {
    failures: Vec<SystemFailure>,
}

impl ScheduleError {
    /// Every failed system, in the order they were added to the scheduler.
    pub fn failures(&self) -> &[SystemFailure] {
        &self.failures
    }

    /// Take the failures out of the error.
    pub fn into_failures(self) -> Vec<SystemFailure> {
        self.failures
    }
}

impl error::Error for ScheduleError {}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} system(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, " [{}: {:#}]", failure.system, failure.error)?;
        }

        Ok(())
    }
}

/// Runs every system at the same time, against the same world.
///
/// Systems that run together must not write the same component types. This is not checked.
#[derive(Default)]
pub struct ParallelScheduler {
    systems: Vec<Box<dyn System>>,
    thread_pool: Option<Arc<ThreadPool>>,
}

impl ParallelScheduler {
    /// Create a scheduler that runs its systems on rayon's global thread pool.
    pub fn new() -> ParallelScheduler {
        ParallelScheduler { systems: Vec::new(), thread_pool: None }
    }

    /// Create a scheduler that runs its systems on the provided thread pool.
    pub fn with_thread_pool(thread_pool: Arc<ThreadPool>) -> ParallelScheduler {
        ParallelScheduler { systems: Vec::new(), thread_pool: Some(thread_pool) }
    }

    /// Add a system.
    pub fn add<S: System + 'static>(&mut self, system: S) {
        self.systems.push(Box::new(system));
    }

    /// Add a closure as a system.
    pub fn add_fn<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&World) -> Result<()> + Send + Sync + 'static,
    {
        self.add(FnSystem::new(name, function));
    }

    /// The number of systems.
    pub fn len(&self) -> usize {
        self.systems.len()
    }

    /// True if there are no systems.
    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    /// Run every system once and wait for all of them to finish.
    /// A failing system does not stop the others. Every failure is collected into the error.
    pub fn run(&self, world: &World) -> std::result::Result<(), ScheduleError> {
        let dispatch = || -> Vec<Option<SystemFailure>> {
            self.systems
                .par_iter()
                .map(|system| {
                    log::trace!("Running system {} in parallel.", system.name());
                    system.run(world).err().map(|error| SystemFailure { system: system.name().to_owned(), error })
                })
                .collect()
        };

        let results = match &self.thread_pool {
            Some(thread_pool) => thread_pool.install(dispatch),
            None => dispatch(),
        };

        let failures: Vec<SystemFailure> = results.into_iter().flatten().collect();
        if failures.is_empty() {
            Ok(())
        } else {
            log::debug!("{} of {} parallel systems failed.", failures.len(), self.systems.len());
            Err(ScheduleError { failures })
        }
    }
}
