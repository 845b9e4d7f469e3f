//! Process lifecycle syscalls: fork, exit, getpid, getppid, waitpid.

use crate::errno::{Errno, SyscallResult};
use crate::frame::Registers;
use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::process::{ChildStatus, Pid, ProcessState, WaitTarget};

use super::validate::check_user_range;

/// Do not block if no matching child has exited yet.
pub const WNOHANG: u64 = 1;

/// fork(): duplicates the caller. The child resumes at the same instruction
/// with `rax = 0`; the parent gets the child's pid.
pub fn sys_fork<H: Hal>(kernel: &Kernel<H>, pid: Pid, frame: &mut Registers) -> SyscallResult {
    let parent_space = {
        let table = kernel.processes();
        if !table.has_free_slot() {
            return Err(Errno::EAGAIN);
        }
        table.get(pid).map(|p| p.address_space).ok_or(Errno::ESRCH)?
    };

    let child_space = kernel.hal().duplicate(parent_space)?;
    let forked = kernel.processes().fork(pid, frame, child_space);
    if forked.is_err() {
        kernel.hal().release(child_space);
    }
    forked
}

/// exit(status): never returns to the caller.
pub fn sys_exit<H: Hal>(kernel: &Kernel<H>, pid: Pid, frame: &mut Registers) -> SyscallResult {
    let [status, ..] = frame.syscall_args();
    kernel.terminate(pid, status as i32);
    Ok(0)
}

pub fn sys_getpid<H: Hal>(_kernel: &Kernel<H>, pid: Pid, _frame: &mut Registers) -> SyscallResult {
    Ok(pid)
}

pub fn sys_getppid<H: Hal>(kernel: &Kernel<H>, pid: Pid, _frame: &mut Registers) -> SyscallResult {
    kernel.processes().get(pid).map(|p| p.parent).ok_or(Errno::ESRCH)
}

/// waitpid(pid, status_ptr, options): collects an exited child.
///
/// `pid` is -1 for any child or a specific child pid. When nothing has
/// exited yet and `WNOHANG` is not set, the caller is blocked and its saved
/// `rip` is moved back onto the syscall instruction. It re-issues the call
/// once a child exit wakes it up, and the return value below is discarded.
pub fn sys_waitpid<H: Hal>(kernel: &Kernel<H>, pid: Pid, frame: &mut Registers) -> SyscallResult {
    let [raw_pid, status_ptr, options, _] = frame.syscall_args();
    if options & !WNOHANG != 0 {
        return Err(Errno::EINVAL);
    }
    let target = WaitTarget::from_raw(raw_pid as i64)?;
    if status_ptr != 0 {
        check_user_range(status_ptr, core::mem::size_of::<i32>())?;
    }

    let (child, status) = {
        let mut table = kernel.processes();
        match table.find_child(pid, target) {
            ChildStatus::NoChild => return Err(Errno::ECHILD),
            ChildStatus::StillRunning if options & WNOHANG != 0 => return Ok(0),
            ChildStatus::StillRunning => {
                if let Some(process) = table.get_mut(pid) {
                    process.state = ProcessState::Blocked;
                    process.waiting_for = Some(target);
                    process.regs_state.rewind_syscall();
                }
                log::debug!("process {} waits for {:?}", pid, target);
                return Ok(0);
            }
            ChildStatus::Exited(child) => {
                let status = table.get(child).and_then(|p| p.exit_status).unwrap_or(0);
                (child, status)
            }
        }
    };

    if status_ptr != 0 {
        kernel.hal().copy_to_user(status_ptr, &status.to_le_bytes())?;
    }

    let reaped = kernel.processes().reap(child);
    if let Some(process) = reaped {
        kernel.hal().release(process.address_space);
    }
    log::debug!("process {} reaped {} (status {})", pid, child, status);
    Ok(child)
}
