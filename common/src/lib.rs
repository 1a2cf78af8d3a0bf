// Copyright James Carl (C) 2020
// AGPL-3.0-or-later

//! Simulation core shared by the server and its tools.
//! Holds the entity store, the system schedulers, and the pool for slow background jobs.

#![warn(missing_docs)]

pub mod scheduler;
pub mod slowjob;
pub mod world;

/// Writes basic system info such as the OS, memory, and the processor used.
pub fn log_basic_system_info() -> anyhow::Result<()> {
    let os = os_info::get();

    log::info!("OS Info: {}", os);
    log::info!("Target Arch: {}", std::env::consts::ARCH);

    let cpu_num = sys_info::cpu_num()?;

    log::info!("Hardware Threads: {}", cpu_num);

    // Not every platform can tell us this, and it's not worth failing over.
    match sys_info::cpu_speed() {
        Ok(cpu_speed) => log::info!("CPU Speed: {}MHz", cpu_speed),
        Err(error) => log::debug!("CPU speed unavailable: {}", error),
    }

    let mem_info = sys_info::mem_info()?;

    log::info!("Physical Memory: {}Mb", mem_info.total / 1000);
    log::info!("Swap Memory: {}Mb", mem_info.swap_total / 1000);

    Ok(())
}
