//! Compile-time kernel configuration.

use log::LevelFilter;

// --- VECTORS ---

/// Number of architecture-defined exception vectors (0..32).
pub const EXCEPTION_VECTORS: u8 = 32;

/// The master PIC is remapped right after the exceptions.
pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Number of remapped IRQ lines (two chained 8259s).
pub const IRQ_LINES: u8 = 16;

/// Software interrupt used by user programs to enter the kernel.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Length of the `int 0x80` instruction (CD 80). Used to restart a syscall.
pub const SYSCALL_INSN_LEN: u64 = 2;

/// Exceptions for which the CPU pushes a genuine error code:
/// #DF, #TS, #NP, #SS, #GP, #PF, #AC, #CP, #VC, #SX.
pub const ERROR_CODE_VECTORS: [u8; 10] = [8, 10, 11, 12, 13, 14, 17, 21, 29, 30];

/// Same set as a bitmask, consumed by the entry stub generator.
pub const ERROR_CODE_MASK: u32 = {
    let mut mask = 0u32;
    let mut i = 0;
    while i < ERROR_CODE_VECTORS.len() {
        mask |= 1 << ERROR_CODE_VECTORS[i];
        i += 1;
    }
    mask
};

/// Every entry stub occupies exactly this many bytes.
pub const TRAP_STUB_SIZE: usize = 16;

// --- PROCESSES ---

pub const INIT_PID: usize = 1;
pub const MAX_PROCESSES: usize = 64;

/// Number of signal slots per process (signals 0..NSIG).
pub const NSIG: usize = 32;

/// Exit status of a process killed by an unrecoverable fault is this plus the vector.
pub const FAULT_EXIT_BASE: i32 = 128;

/// Exit status of a process terminated by a signal's default disposition.
pub const SIGNAL_EXIT_BASE: i32 = 128;

// --- TIME ---

pub const PIT_FREQUENCY_HZ: u32 = 100;

/// Timer ticks a process may run before it is preempted.
pub const TIMESLICE_TICKS: u64 = 5;

// --- MEMORY ---

pub const KERNEL_STACK_SIZE: usize = 4096 * 5;
pub const IDLE_STACK_SIZE: usize = 4096 * 2;
pub const HEAP_SIZE: usize = 1024 * 1024;

/// The user stack lives alone in its own PML4 slot so fork can deep-copy it.
pub const USER_STACK_TOP: u64 = 0x0000_7000_0001_0000;
pub const USER_STACK_PAGES: u64 = 4;

/// Upper bound (exclusive) of user-accessible addresses.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Span of the kernel image that is exposed to ring 3 so the init program can run.
pub const KERNEL_IMAGE_SPAN: u64 = 4 * 1024 * 1024;

/// Largest piece of a user buffer copied into the kernel at once by `write`.
pub const WRITE_CHUNK: usize = 256;

// --- LOGGING ---

pub const LOG_LEVEL: LevelFilter = LevelFilter::Info;
