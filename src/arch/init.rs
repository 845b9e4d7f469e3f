//! The first user program. Runs in ring 3 out of the kernel image, so it
//! only touches its own stack and talks to the kernel through `int 0x80`.
//!
//! Buffers handed to the kernel must live on the user stack: kernel data
//! is outside the range syscalls accept.

use core::arch::asm;
use core::fmt::{self, Write};

use crate::syscall::{SYS_EXIT, SYS_FORK, SYS_GETPID, SYS_KILL, SYS_SIGNAL, SYS_WAITPID, SYS_WRITE};

const STDOUT: u64 = 1;
const CHILD_EXIT_STATUS: u64 = 43;

#[inline(always)]
fn syscall(number: u64, a: u64, b: u64, c: u64) -> i64 {
    let ret: i64;
    unsafe {
        asm!(
            "int 0x80",
            inlateout("rax") number as i64 => ret,
            in("rdi") a,
            in("rsi") b,
            in("rdx") c,
            in("r10") 0u64,
            options(nostack)
        );
    }
    ret
}

fn write(bytes: &[u8]) -> i64 {
    syscall(SYS_WRITE, STDOUT, bytes.as_ptr() as u64, bytes.len() as u64)
}

fn exit(status: u64) -> ! {
    syscall(SYS_EXIT, status, 0, 0);
    loop {
        core::hint::spin_loop();
    }
}

/// Formats into a fixed buffer so the text stays on the stack.
struct StackBuf {
    bytes: [u8; 96],
    len: usize,
}

impl StackBuf {
    fn new() -> Self {
        StackBuf { bytes: [0; 96], len: 0 }
    }

    fn flush(&mut self) {
        write(&self.bytes[..self.len]);
        self.len = 0;
    }
}

impl Write for StackBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.bytes.len() - self.len;
        if s.len() > room {
            return Err(fmt::Error);
        }
        self.bytes[self.len..self.len + s.len()].copy_from_slice(s.as_bytes());
        self.len += s.len();
        Ok(())
    }
}

extern "C" fn on_signal(sig: u64) {
    let mut out = StackBuf::new();
    let _ = writeln!(out, "process {} caught signal {}", syscall(SYS_GETPID, 0, 0, 0), sig);
    out.flush();
}

/// Entry point of init. Never returns.
pub extern "C" fn main() -> ! {
    let mut out = StackBuf::new();
    let _ = out.write_str("Hello world!\n");
    out.flush();

    let pid = syscall(SYS_FORK, 0, 0, 0);
    if pid == 0 {
        syscall(SYS_SIGNAL, 0, on_signal as usize as u64, 0);
        let me = syscall(SYS_GETPID, 0, 0, 0);
        syscall(SYS_KILL, me as u64, 0, 0);
        exit(CHILD_EXIT_STATUS);
    }

    if pid < 0 {
        let _ = writeln!(out, "fork failed: {}", pid);
        out.flush();
        exit(1);
    }

    let mut status: i32 = 0;
    let reaped = syscall(SYS_WAITPID, -1i64 as u64, &mut status as *mut i32 as u64, 0);
    let _ = writeln!(out, "waitpid: child {} exited with status {}", reaped, status);
    out.flush();
    exit(0);
}
