//! Error numbers returned through the syscall ABI.
//!
//! Handlers return [`SyscallResult`]; the dispatcher turns it into the raw
//! `rax` word with [`encode`]. Errors are negative, Linux-numbered.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Errno {
    /// Operation not permitted
    EPERM = -1,
    /// No such process
    ESRCH = -3,
    /// Interrupted system call. Reserved: nothing returns it yet.
    EINTR = -4,
    /// Bad file descriptor
    EBADF = -9,
    /// No child processes
    ECHILD = -10,
    /// Resource temporarily unavailable
    EAGAIN = -11,
    /// Cannot allocate memory
    ENOMEM = -12,
    /// Bad address
    EFAULT = -14,
    /// Invalid argument
    EINVAL = -22,
    /// Function not implemented
    ENOSYS = -38,
}

pub type SyscallResult = Result<usize, Errno>;

impl Errno {
    pub const fn as_raw(self) -> i64 {
        self as i64
    }

    pub const fn name(self) -> &'static str {
        match self {
            Errno::EPERM => "EPERM",
            Errno::ESRCH => "ESRCH",
            Errno::EINTR => "EINTR",
            Errno::EBADF => "EBADF",
            Errno::ECHILD => "ECHILD",
            Errno::EAGAIN => "EAGAIN",
            Errno::ENOMEM => "ENOMEM",
            Errno::EFAULT => "EFAULT",
            Errno::EINVAL => "EINVAL",
            Errno::ENOSYS => "ENOSYS",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Errno::EPERM => "operation not permitted",
            Errno::ESRCH => "no such process",
            Errno::EINTR => "interrupted system call",
            Errno::EBADF => "bad file descriptor",
            Errno::ECHILD => "no child processes",
            Errno::EAGAIN => "resource temporarily unavailable",
            Errno::ENOMEM => "cannot allocate memory",
            Errno::EFAULT => "bad address",
            Errno::EINVAL => "invalid argument",
            Errno::ENOSYS => "function not implemented",
        };
        write!(f, "{} ({})", msg, self.name())
    }
}

/// Raw value placed in the frame's return-value slot.
pub fn encode(result: SyscallResult) -> u64 {
    match result {
        Ok(value) => value as u64,
        Err(errno) => errno.as_raw() as u64,
    }
}
