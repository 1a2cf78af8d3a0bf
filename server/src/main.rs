// Copyright James Carl (C) 2020
// AGPL-3.0-or-later

//! Server for the simulation.
//! Runs the simulation loop and pushes chunk work out to the slow job pool.

#![warn(missing_docs)]

use anyhow::{anyhow, Context, Result};
use sim_common::{
    scheduler::{ParallelScheduler, Scheduler},
    slowjob::{Admission, JobFuture, SlowJob, SlowJobPool},
    world::{Entity, World, WorldResult},
};

/// Generating chunks is heavy, so it only gets half of the pool.
const CHUNK_GENERATOR: &str = "CHUNK_GENERATOR";

/// Saving chunks is lighter and less urgent.
const CHUNK_SERIALIZER: &str = "CHUNK_SERIALIZER";

const TICKS: u32 = 10;

#[derive(Clone, Debug, PartialEq)]
struct Position {
    x: i64,
    y: i64,
}

#[derive(Clone, Debug, PartialEq)]
struct Velocity {
    x: i64,
    y: i64,
}

#[derive(Clone, Debug, PartialEq)]
struct Age(u32);

fn main() {
    let result = trampoline();

    if let Err(error) = result {
        // Okay, something must have gone wrong during startup or shutdown.
        // First we log it.
        log::error!("Error running server: {:?}", error);
    }
}

/// A function that generally catches errors from the server setup so that they
/// can be properly handled and displayed to the user.
fn trampoline() -> Result<()> {
    env_logger::init();

    log::info!("Welcome to the simulation server!");
    sim_common::log_basic_system_info().context("Error logging basic system info.")?;

    let global_limit = sys_info::cpu_num().map(|cpus| cpus as usize).unwrap_or(1);
    let pool = SlowJobPool::new(global_limit);
    pool.configure(CHUNK_GENERATOR, |global| global / 2);
    pool.configure(CHUNK_SERIALIZER, |global| global / 4);
    log::info!(
        "Slow job pool has {} slots. {} gets {}, {} gets {}.",
        pool.global_limit(),
        CHUNK_GENERATOR,
        pool.category_limit(CHUNK_GENERATOR).unwrap_or(0),
        CHUNK_SERIALIZER,
        pool.category_limit(CHUNK_SERIALIZER).unwrap_or(0)
    );

    let world = build_world().context("Error building the world.")?;
    let sequential = build_sequential_systems();
    let parallel = build_parallel_systems();

    // Ask for the chunks around the origin. Closer chunks are more important.
    let mut pending: Vec<(SlowJob, JobFuture<u64>)> = Vec::new();
    for x in -2i64..=2 {
        for y in -2i64..=2 {
            let priority = (x.abs() + y.abs()) as i32;
            pending.push(pool.spawn_async(CHUNK_GENERATOR, move |token| generate_chunk(token, x, y), priority)?);
        }
    }

    // The far corners can wait for some other time.
    for (job, _future) in pending.iter().filter(|(job, _future)| job.id() % 5 == 4) {
        if pool.cancel(job) {
            log::debug!("Dropped chunk request {}.", job.id());
        }
    }

    for tick in 0..TICKS {
        sequential.run(&world).with_context(|| format!("Tick {} failed.", tick))?;
        parallel.run(&world).map_err(|error| anyhow!("Tick {} failed: {}", tick, error))?;

        // Saving is best effort. If there's no room, we'll save on a later tick.
        match pool.try_run(CHUNK_SERIALIZER, move |_token| log::trace!("Saved the world at tick {}.", tick), 0)? {
            Admission::Started(job) => log::trace!("Started save job {}.", job.id()),
            Admission::Rejected(_work) => log::trace!("No room to save at tick {}.", tick),
        }
    }

    for (entity, position) in world.read::<Position>()?.iter() {
        log::info!("{} ended up at ({}, {}).", entity, position.x, position.y);
    }

    let mut generated = 0;
    for (job, future) in pending {
        match future.wait() {
            Ok(checksum) => {
                generated += 1;
                log::debug!("Chunk job {} finished with checksum {}.", job.id(), checksum);
            }
            Err(error) => log::info!("Chunk job {} did not finish: {}", job.id(), error),
        }
    }
    log::info!("Generated {} chunks.", generated);

    Ok(())
}

fn build_world() -> WorldResult<World> {
    let mut world = World::new();
    world.register::<Position>();
    world.register::<Velocity>();
    world.register::<Age>();

    for index in 0..8i64 {
        let entity = world.create_entity();
        world.add(entity, Position { x: 0, y: index })?;
        world.add(entity, Age(0))?;
        if index % 2 == 0 {
            world.add(entity, Velocity { x: 1, y: -1 })?;
        }
    }

    Ok(world)
}

fn build_sequential_systems() -> Scheduler {
    let mut scheduler = Scheduler::new();

    scheduler.add_fn("movement", |world| {
        let velocities = world.read::<Velocity>()?;
        let mut positions = world.write::<Position>()?;
        for (_entity, position, velocity) in positions.join_mut(&velocities) {
            position.x += velocity.x;
            position.y += velocity.y;
        }

        Ok(())
    });

    scheduler.add_fn("despawn", |world| {
        let strays: Vec<Entity> = world
            .read::<Position>()?
            .iter()
            .filter(|(_entity, position)| position.x.abs() > 8)
            .map(|(entity, _position)| entity)
            .collect();

        // The view is dropped by now, so destroying is safe.
        for entity in strays {
            log::debug!("{} wandered off.", entity);
            world.destroy(entity);
        }

        Ok(())
    });

    scheduler
}

fn build_parallel_systems() -> ParallelScheduler {
    let mut scheduler = ParallelScheduler::new();

    // These two touch different component types, so they can run side by side.
    scheduler.add_fn("aging", |world| {
        for (_entity, age) in world.write::<Age>()?.iter_mut() {
            age.0 += 1;
        }

        Ok(())
    });

    scheduler.add_fn("drag", |world| {
        for (_entity, velocity) in world.write::<Velocity>()?.iter_mut() {
            velocity.x -= velocity.x.signum() * (velocity.x.abs() / 4);
        }

        Ok(())
    });

    scheduler
}

/// Stand in for generating a chunk. Gives up early if the pool asks it to.
fn generate_chunk(token: &sim_common::slowjob::CancelToken, x: i64, y: i64) -> u64 {
    let mut checksum = (x as u64).wrapping_mul(31).wrapping_add(y as u64);
    for step in 0..10_000u64 {
        if step % 1000 == 0 && token.is_cancelled() {
            break;
        }
        checksum = checksum.rotate_left(5) ^ step;
    }

    checksum
}

#[cfg(test)]
mod test_server {
    use super::*;

    #[test]
    fn world_is_populated() {
        let world = build_world().unwrap();
        assert_eq!(world.entity_count(), 8);
        assert_eq!(world.read::<Position>().unwrap().len(), 8);
        assert_eq!(world.read::<Age>().unwrap().len(), 8);
        assert_eq!(world.read::<Velocity>().unwrap().len(), 4);
    }

    #[test]
    fn a_tick_moves_and_ages() {
        let world = build_world().unwrap();
        build_sequential_systems().run(&world).unwrap();
        build_parallel_systems().run(&world).unwrap();

        let positions = world.read::<Position>().unwrap();
        let velocities = world.read::<Velocity>().unwrap();
        for (_entity, position, _velocity) in positions.join(&velocities) {
            assert_eq!(position.x, 1);
        }
        assert!(world.read::<Age>().unwrap().iter().all(|(_entity, age)| *age == Age(1)));
    }
}
