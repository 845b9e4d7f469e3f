//! User pointer validation.
//!
//! Every pointer a syscall receives is checked here before the memory
//! manager is asked to copy through it. The check only proves the range is
//! in the lower half; whether it is mapped is for the copy to find out.

use crate::config::USER_SPACE_END;
use crate::errno::Errno;

/// Checks that `[addr, addr + len)` lies entirely in user space.
///
/// Zero-length ranges are accepted anywhere, null is rejected otherwise.
pub fn check_user_range(addr: u64, len: usize) -> Result<(), Errno> {
    if len == 0 {
        return Ok(());
    }
    if addr == 0 {
        return Err(Errno::EFAULT);
    }
    let end = addr.checked_add(len as u64).ok_or(Errno::EFAULT)?;
    if end > USER_SPACE_END {
        return Err(Errno::EFAULT);
    }
    Ok(())
}
