use crate::process::{Pid, ProcessTable};

/// Round-robin choice of the next process to run.
///
/// Starts looking right after `prev` and wraps around, so every runnable
/// process gets a turn. `prev` itself is picked only if nothing else is
/// runnable and it still is. Returns `None` when the CPU should idle.
pub fn pick_next(table: &ProcessTable, prev: Option<Pid>) -> Option<Pid> {
    let runnable = |pid: &Pid| table.get(*pid).map_or(false, |p| p.is_runnable());

    match prev {
        Some(prev) => table
            .pids()
            .filter(|pid| *pid > prev)
            .chain(table.pids().filter(|pid| *pid <= prev))
            .find(runnable),
        None => table.pids().find(runnable),
    }
}
