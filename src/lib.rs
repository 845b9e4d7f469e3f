//! Trap, syscall and process-control core of a small x86_64 kernel.
//!
//! The portable part (frames, dispatch, syscalls, processes, signals) is
//! written against the traits in [`hal`] and unit-tested on the host. The
//! `arch` module wires it to real hardware and only exists when building
//! for the bare-metal target.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod errno;
pub mod frame;
pub mod hal;
pub mod interrupts;
pub mod kernel;
pub mod process;
pub mod scheduler;
pub mod signal;
pub mod spinlock;
pub mod syscall;

#[cfg(target_os = "none")]
pub mod arch;

#[cfg(test)]
mod testing;
