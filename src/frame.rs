//! Saved CPU state of a trapped context.
//!
//! The entry stubs build a [`Registers`] on the kernel stack: the CPU pushes
//! `ss, rsp, rflags, cs, rip` (and sometimes an error code), the stub pushes
//! a placeholder error code when needed and the vector, then the common entry
//! pushes `rax, rbx, rcx, rdx, rsi, rdi, rbp, r8..r15` and finally `ds`.
//! Field order below is therefore the reverse push order: lowest address first.

use x86_64::registers::rflags::RFlags;

use crate::config;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Registers {
    pub ds: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    // Pushed by the CPU
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Number of 8-byte words in a frame.
pub const FRAME_WORDS: usize = core::mem::size_of::<Registers>() / 8;

impl Registers {
    /// A fresh context starting at `entry` with interrupts enabled.
    ///
    /// The privilege level follows from the selectors' RPL: user selectors
    /// give a ring 3 context, kernel selectors a ring 0 one (the idle loop).
    pub fn new_context(entry: u64, stack_top: u64, code_sel: u16, data_sel: u16) -> Self {
        Registers {
            ds: data_sel as u64,
            rip: entry,
            cs: code_sel as u64,
            rflags: (RFlags::INTERRUPT_FLAG | RFlags::from_bits_retain(0x2)).bits(),
            rsp: stack_top,
            ss: data_sel as u64,
            ..Registers::default()
        }
    }

    /// Whether the trap came from ring 3.
    #[inline]
    pub fn is_user_mode(&self) -> bool {
        self.cs & 0b11 == 0b11
    }

    #[inline]
    pub fn interrupts_enabled(&self) -> bool {
        RFlags::from_bits_retain(self.rflags).contains(RFlags::INTERRUPT_FLAG)
    }

    // --- SYSCALL CALLING CONVENTION ---
    // number in rax, arguments in rdi, rsi, rdx, r10, result back in rax.

    #[inline]
    pub fn syscall_number(&self) -> u64 {
        self.rax
    }

    #[inline]
    pub fn syscall_args(&self) -> [u64; 4] {
        [self.rdi, self.rsi, self.rdx, self.r10]
    }

    #[inline]
    pub fn set_return_value(&mut self, value: u64) {
        self.rax = value;
    }

    /// Moves `rip` back onto the `int 0x80` so the call is re-issued on resume.
    #[inline]
    pub fn rewind_syscall(&mut self) {
        self.rip = self.rip.wrapping_sub(config::SYSCALL_INSN_LEN);
    }
}

/// Whether the CPU pushes a real error code for `vector`.
pub const fn has_hardware_error_code(vector: u8) -> bool {
    vector < config::EXCEPTION_VECTORS && config::ERROR_CODE_MASK & (1 << vector) != 0
}
