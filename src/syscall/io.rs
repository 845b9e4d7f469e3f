use crate::config::WRITE_CHUNK;
use crate::errno::{Errno, SyscallResult};
use crate::frame::Registers;
use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::process::Pid;

use super::validate::check_user_range;

pub const STDOUT: u64 = 1;
pub const STDERR: u64 = 2;

/// write(fd, buf, count): copies `count` bytes from user memory to the console.
///
/// A fault after some chunks went out returns the short count; `EFAULT`
/// only when nothing was written.
pub fn sys_write<H: Hal>(kernel: &Kernel<H>, _pid: Pid, frame: &mut Registers) -> SyscallResult {
    let [fd, buf, count, _] = frame.syscall_args();
    if fd != STDOUT && fd != STDERR {
        return Err(Errno::EBADF);
    }
    let count = usize::try_from(count).map_err(|_| Errno::EINVAL)?;
    check_user_range(buf, count)?;

    let mut chunk = [0u8; WRITE_CHUNK];
    let mut written = 0;
    while written < count {
        let len = (count - written).min(WRITE_CHUNK);
        let copied = kernel
            .hal()
            .copy_from_user(buf + written as u64, &mut chunk[..len]);
        match copied {
            Ok(()) => {}
            // Bytes already on the console stay written.
            Err(_) if written > 0 => break,
            Err(err) => return Err(err),
        }
        kernel.hal().write_bytes(fd as usize, &chunk[..len]);
        written += len;
    }
    Ok(written)
}
