//! Interrupt and exception dispatch.
//!
//! Every vector funnels into [`Kernel::handle_trap`](crate::kernel::Kernel::handle_trap),
//! which uses [`classify`] to route it here or to the syscall layer.

use crate::config::{self, EXCEPTION_VECTORS, IRQ_LINES, PIC_1_OFFSET, SYSCALL_VECTOR};
use crate::frame::Registers;
use crate::hal::Hal;
use crate::kernel::Kernel;

pub const DIVIDE_ERROR: u8 = 0;
pub const DEBUG: u8 = 1;
pub const NMI: u8 = 2;
pub const BREAKPOINT: u8 = 3;
pub const INVALID_OPCODE: u8 = 6;
pub const DOUBLE_FAULT: u8 = 8;
pub const GENERAL_PROTECTION: u8 = 13;
pub const PAGE_FAULT: u8 = 14;
pub const MACHINE_CHECK: u8 = 18;

pub const TIMER_IRQ: u8 = 0;
pub const KEYBOARD_IRQ: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    Exception(u8),
    /// Line number on the PIC, not the vector.
    Irq(u8),
    Syscall,
    Unexpected(u8),
}

pub fn classify(vector: u8) -> TrapKind {
    match vector {
        v if v < EXCEPTION_VECTORS => TrapKind::Exception(v),
        v if (PIC_1_OFFSET..PIC_1_OFFSET + IRQ_LINES).contains(&v) => TrapKind::Irq(v - PIC_1_OFFSET),
        SYSCALL_VECTOR => TrapKind::Syscall,
        v => TrapKind::Unexpected(v),
    }
}

static EXCEPTION_NAMES: [&str; EXCEPTION_VECTORS as usize] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating-point exception",
    "alignment check",
    "machine check",
    "SIMD floating-point exception",
    "virtualization exception",
    "control protection exception",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection exception",
    "VMM communication exception",
    "security exception",
    "reserved",
];

pub fn exception_name(vector: u8) -> &'static str {
    EXCEPTION_NAMES
        .get(vector as usize)
        .copied()
        .unwrap_or("unknown")
}

/// Exceptions that mean the machine itself is in trouble, whoever caused them.
pub fn is_always_fatal(vector: u8) -> bool {
    matches!(vector, NMI | DOUBLE_FAULT | MACHINE_CHECK)
}

/// Handles CPU exception `vector`.
///
/// Faults raised by a user process kill only that process. Anything raised
/// in kernel context, or while another trap is being handled, halts the
/// system through a panic.
pub(crate) fn handle_exception<H: Hal>(kernel: &Kernel<H>, frame: &Registers, vector: u8, depth: usize) {
    let name = exception_name(vector);
    let current = kernel.processes().current();

    let pid = match current {
        Some(pid) if frame.is_user_mode() && depth == 1 && !is_always_fatal(vector) => pid,
        _ => {
            log::error!(
                "{} (vector {}) at {:#x}, error code {:#x}, cs {:#x}, depth {}",
                name,
                vector,
                frame.rip,
                frame.error_code,
                frame.cs,
                depth
            );
            panic!("unrecoverable {} in kernel context", name);
        }
    };

    match vector {
        DEBUG | BREAKPOINT => {
            log::debug!("process {} hit {} at {:#x}", pid, name, frame.rip);
            return;
        }
        PAGE_FAULT => {
            let addr = kernel.hal().fault_address();
            let space = kernel.processes().get(pid).map(|p| p.address_space);
            if let Some(space) = space {
                if kernel.hal().resolve_page_fault(space, addr, frame.error_code) {
                    return;
                }
            }
            log::warn!(
                "process {} page fault at {:#x} (rip {:#x}, error code {:#x})",
                pid,
                addr,
                frame.rip,
                frame.error_code
            );
        }
        _ => {}
    }

    log::warn!("process {} killed by {} at {:#x}", pid, name, frame.rip);
    kernel.terminate(pid, config::FAULT_EXIT_BASE + vector as i32);
}

/// Runs the handler registered for `irq`, then acknowledges the line.
pub(crate) fn handle_irq<H: Hal>(kernel: &Kernel<H>, irq: u8) {
    match kernel.irq_handler(irq) {
        Some(handler) => handler(kernel, irq),
        None => log::trace!("spurious irq {}", irq),
    }
    kernel.hal().end_of_interrupt(irq);
}

/// IRQ 0: counts ticks and asks for a switch once the slice is used up.
pub(crate) fn timer_tick<H: Hal>(kernel: &Kernel<H>, _irq: u8) {
    kernel.tick();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_fall_into_their_ranges() {
        assert_eq!(classify(0), TrapKind::Exception(0));
        assert_eq!(classify(31), TrapKind::Exception(31));
        assert_eq!(classify(32), TrapKind::Irq(0));
        assert_eq!(classify(47), TrapKind::Irq(15));
        assert_eq!(classify(48), TrapKind::Unexpected(48));
        assert_eq!(classify(0x80), TrapKind::Syscall);
        assert_eq!(classify(255), TrapKind::Unexpected(255));
    }

    #[test]
    fn names_cover_every_exception() {
        assert_eq!(exception_name(DIVIDE_ERROR), "divide error");
        assert_eq!(exception_name(PAGE_FAULT), "page fault");
        assert_eq!(exception_name(GENERAL_PROTECTION), "general protection fault");
        assert_eq!(exception_name(200), "unknown");
    }

    #[test]
    fn machine_level_faults_are_fatal() {
        assert!(is_always_fatal(DOUBLE_FAULT));
        assert!(is_always_fatal(NMI));
        assert!(is_always_fatal(MACHINE_CHECK));
        assert!(!is_always_fatal(PAGE_FAULT));
        assert!(!is_always_fatal(INVALID_OPCODE));
    }
}
