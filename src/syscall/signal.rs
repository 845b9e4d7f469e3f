use crate::errno::{Errno, SyscallResult};
use crate::frame::Registers;
use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::process::{Pid, ProcessState};
use crate::signal::{check_signal, SignalAction};

/// signal(sig, handler): installs a disposition and returns the previous one.
///
/// `handler` is 0 for the default action, 1 to ignore, or a user address.
pub fn sys_signal<H: Hal>(kernel: &Kernel<H>, pid: Pid, frame: &mut Registers) -> SyscallResult {
    let [sig, handler, ..] = frame.syscall_args();
    let sig = check_signal(sig)?;
    let mut table = kernel.processes();
    let process = table.get_mut(pid).ok_or(Errno::ESRCH)?;
    let previous = process.signals.set_action(sig, SignalAction::from_raw(handler));
    Ok(previous.to_raw() as usize)
}

/// kill(pid, sig): marks `sig` pending on `pid`. Acted upon the next time
/// the target returns to user mode.
pub fn sys_kill<H: Hal>(kernel: &Kernel<H>, _pid: Pid, frame: &mut Registers) -> SyscallResult {
    let [target, sig, ..] = frame.syscall_args();
    let sig = check_signal(sig)?;
    let target = match target as i64 {
        t if t > 0 => t as Pid,
        // Process groups are not supported
        _ => return Err(Errno::EINVAL),
    };

    let mut table = kernel.processes();
    match table.get_mut(target) {
        Some(process) if process.state != ProcessState::Zombie => {
            process.signals.raise(sig);
            log::debug!("signal {} sent to process {}", sig, target);
            Ok(0)
        }
        _ => Err(Errno::ESRCH),
    }
}

/// sigreturn(): called by the trampoline when a handler returns. Restores
/// the frame the handler interrupted, `rax` included.
pub fn sys_sigreturn<H: Hal>(kernel: &Kernel<H>, pid: Pid, frame: &mut Registers) -> SyscallResult {
    let saved = kernel
        .processes()
        .get_mut(pid)
        .and_then(|p| p.signals.take_saved_frame())
        .ok_or(Errno::EINVAL)?;
    *frame = saved;
    Ok(saved.rax as usize)
}
