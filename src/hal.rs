//! Interfaces to the collaborators the trap core relies on.
//!
//! The core never touches hardware directly. On bare metal these are
//! implemented by `arch::X86Hal`; host tests use `testing::MockHal`.

use crate::errno::Errno;
use crate::frame::Registers;

/// Opaque handle of an address space, owned by the memory manager.
/// On x86_64 this is the physical address of the PML4.
pub type AddressSpace = u64;

/// Local interrupt-enable flag.
pub trait InterruptMask {
    fn interrupts_enabled(&self) -> bool;
    fn enable_interrupts(&self);
    fn disable_interrupts(&self);
}

/// The interrupt controller the IRQ lines are routed through.
pub trait InterruptController {
    /// Acknowledges `irq` (0-based line number, not the vector).
    fn end_of_interrupt(&self, irq: u8);
}

pub trait Console {
    /// Writes `bytes` to the stream behind `fd` (1 or 2).
    fn write_bytes(&self, fd: usize, bytes: &[u8]);
}

pub trait MemoryManager {
    /// Creates a copy of `space` for a forked child.
    fn duplicate(&self, space: AddressSpace) -> Result<AddressSpace, Errno>;

    /// Makes `space` the active address space.
    fn activate(&self, space: AddressSpace);

    /// Gives back everything owned by `space`. Never called on the active one.
    fn release(&self, space: AddressSpace);

    /// Copies user memory of the active address space into `buf`.
    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), Errno>;

    /// Copies `bytes` into user memory of the active address space.
    fn copy_to_user(&self, addr: u64, bytes: &[u8]) -> Result<(), Errno>;

    /// Address that caused the last page fault.
    fn fault_address(&self) -> u64;

    /// Tries to fix a user page fault. Returns `true` if the access can be retried.
    fn resolve_page_fault(&self, space: AddressSpace, addr: u64, error_code: u64) -> bool;
}

/// Everything the kernel context needs from the platform.
pub trait Hal: InterruptMask + InterruptController + Console + MemoryManager {
    /// Context resumed when no process is runnable.
    fn idle_frame(&self) -> Registers;

    /// User-visible address of the code that issues `sigreturn`.
    fn signal_trampoline(&self) -> u64;
}
