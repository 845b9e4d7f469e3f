//! System call interface.
//!
//! User programs raise `int 0x80` with the syscall number in `rax` and up to
//! four arguments in `rdi, rsi, rdx, r10`. The result comes back in `rax`:
//! a non-negative value on success, a negated [`Errno`] otherwise.
//!
//! # Syscalls
//! - 0: write(fd, buf, count)
//! - 1: fork()
//! - 2: exit(status)
//! - 3: getpid()
//! - 4: waitpid(pid, status_ptr, options)
//! - 5: getppid()
//! - 6: signal(sig, handler)
//! - 7: kill(pid, sig)
//! - 8: sigreturn()

mod io;
mod process;
mod signal;
pub mod validate;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::errno::{Errno, SyscallResult};
use crate::frame::Registers;
use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::process::Pid;

pub use process::WNOHANG;

pub const SYS_WRITE: u64 = 0;
pub const SYS_FORK: u64 = 1;
pub const SYS_EXIT: u64 = 2;
pub const SYS_GETPID: u64 = 3;
pub const SYS_WAITPID: u64 = 4;
pub const SYS_GETPPID: u64 = 5;
pub const SYS_SIGNAL: u64 = 6;
pub const SYS_KILL: u64 = 7;
pub const SYS_SIGRETURN: u64 = 8;

/// A syscall implementation. Gets the calling process and its trap frame;
/// arguments are read from the frame.
pub type SyscallHandler<H> = fn(&Kernel<H>, Pid, &mut Registers) -> SyscallResult;

/// Number-indexed handler table. Holes are allowed and behave like
/// out-of-range numbers. Never changes once the kernel is built.
pub struct SyscallTable<H: Hal> {
    handlers: Box<[Option<SyscallHandler<H>>]>,
}

impl<H: Hal> SyscallTable<H> {
    pub fn new(handlers: Vec<Option<SyscallHandler<H>>>) -> Self {
        SyscallTable {
            handlers: handlers.into_boxed_slice(),
        }
    }

    /// The table user programs are built against.
    pub fn standard() -> Self {
        Self::new(vec![
            Some(io::sys_write as SyscallHandler<H>),
            Some(process::sys_fork),
            Some(process::sys_exit),
            Some(process::sys_getpid),
            Some(process::sys_waitpid),
            Some(process::sys_getppid),
            Some(signal::sys_signal),
            Some(signal::sys_kill),
            Some(signal::sys_sigreturn),
        ])
    }

    pub fn lookup(&self, number: u64) -> Option<SyscallHandler<H>> {
        let index = usize::try_from(number).ok()?;
        self.handlers.get(index).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub fn name(number: u64) -> &'static str {
    match number {
        SYS_WRITE => "write",
        SYS_FORK => "fork",
        SYS_EXIT => "exit",
        SYS_GETPID => "getpid",
        SYS_WAITPID => "waitpid",
        SYS_GETPPID => "getppid",
        SYS_SIGNAL => "signal",
        SYS_KILL => "kill",
        SYS_SIGRETURN => "sigreturn",
        _ => "unknown",
    }
}

/// Runs the syscall requested by `frame` on behalf of the current process.
///
/// The caller's frame is published as its saved state before the handler
/// runs, so handlers that block or fork see a consistent snapshot. The
/// handler itself runs with interrupts enabled; they are masked again
/// before returning to the trap exit path.
pub(crate) fn dispatch<H: Hal>(kernel: &Kernel<H>, frame: &mut Registers) -> SyscallResult {
    let number = frame.syscall_number();
    let handler = match kernel.syscalls().lookup(number) {
        Some(handler) => handler,
        None => {
            log::debug!("invalid syscall {} at {:#x}", number, frame.rip);
            return Err(Errno::ENOSYS);
        }
    };

    let pid = {
        let mut table = kernel.processes();
        let pid = match table.current() {
            Some(pid) => pid,
            None => {
                log::error!("syscall {} with no current process", number);
                return Err(Errno::ESRCH);
            }
        };
        if let Some(process) = table.get_mut(pid) {
            process.regs_state = *frame;
            process.syscalling = true;
        }
        pid
    };

    #[cfg(feature = "strace")]
    let args = frame.syscall_args();

    kernel.hal().enable_interrupts();
    let result = handler(kernel, pid, frame);
    kernel.hal().disable_interrupts();

    if let Some(process) = kernel.processes().get_mut(pid) {
        process.syscalling = false;
    }

    #[cfg(feature = "strace")]
    match result {
        Ok(value) => log::info!(
            "[strace] pid {}: {}({:#x}, {:#x}, {:#x}, {:#x}) = {}",
            pid,
            name(number),
            args[0],
            args[1],
            args[2],
            args[3],
            value
        ),
        Err(err) => log::info!(
            "[strace] pid {}: {}({:#x}, {:#x}, {:#x}, {:#x}) = {} {}",
            pid,
            name(number),
            args[0],
            args[1],
            args[2],
            args[3],
            err.as_raw(),
            err.name()
        ),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::InterruptMask;
    use crate::testing::{self, MockHal};
    use core::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counting(_kernel: &Kernel<MockHal>, _pid: Pid, _frame: &mut Registers) -> SyscallResult {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(7)
    }

    fn syscall_frame(number: u64) -> Registers {
        Registers {
            rax: number,
            rdi: 11,
            rsi: 22,
            rdx: 33,
            r10: 44,
            vector: crate::config::SYSCALL_VECTOR as u64,
            ..testing::user_frame(testing::USER_ENTRY)
        }
    }

    #[test]
    fn invalid_numbers_only_touch_rax() {
        let table = SyscallTable::new(vec![None, Some(counting as SyscallHandler<MockHal>)]);
        let kernel = testing::booted_kernel_with(table);

        for number in [0, 2, 500, u64::MAX] {
            let before = syscall_frame(number);
            let mut frame = before;
            kernel.handle_trap(&mut frame);
            assert_eq!(frame.rax, Errno::ENOSYS.as_raw() as u64);
            assert_eq!(Registers { rax: number, ..frame }, before);
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);

        let mut frame = syscall_frame(1);
        kernel.handle_trap(&mut frame);
        assert_eq!(frame.rax, 7);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_runs_with_interrupts_enabled_and_exit_path_masks_them() {
        fn check_context(kernel: &Kernel<MockHal>, pid: Pid, _frame: &mut Registers) -> SyscallResult {
            assert!(kernel.hal().interrupts_enabled());
            assert!(kernel.processes().get(pid).unwrap().syscalling);
            Ok(0)
        }
        let kernel = testing::booted_kernel_with(SyscallTable::new(vec![Some(check_context as SyscallHandler<MockHal>)]));

        let mut frame = syscall_frame(0);
        kernel.handle_trap(&mut frame);

        assert!(!kernel.hal().interrupts_enabled());
        assert!(!kernel.processes().get(1).unwrap().syscalling);
    }

    #[test]
    fn standard_table_is_dense() {
        let table = SyscallTable::<MockHal>::standard();
        assert_eq!(table.len(), 9);
        assert!((0..9).all(|n| table.lookup(n).is_some()));
        assert!(table.lookup(9).is_none());
        assert_eq!(name(SYS_WAITPID), "waitpid");
    }
}
