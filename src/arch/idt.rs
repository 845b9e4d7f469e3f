use lazy_static::lazy_static;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::PrivilegeLevel;

use super::entry::stub_address;
use super::gdt::DOUBLE_FAULT_IST_INDEX;
use crate::config::{EXCEPTION_VECTORS, SYSCALL_VECTOR};
use crate::interrupts::BREAKPOINT;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        // SAFETY: every stub saves a full frame and ends in iretq.
        unsafe {
            idt.divide_error.set_handler_addr(stub_address(0));
            idt.debug.set_handler_addr(stub_address(1));
            idt.non_maskable_interrupt.set_handler_addr(stub_address(2));
            idt.breakpoint
                .set_handler_addr(stub_address(BREAKPOINT))
                .set_privilege_level(PrivilegeLevel::Ring3);
            idt.overflow.set_handler_addr(stub_address(4));
            idt.bound_range_exceeded.set_handler_addr(stub_address(5));
            idt.invalid_opcode.set_handler_addr(stub_address(6));
            idt.device_not_available.set_handler_addr(stub_address(7));
            idt.double_fault
                .set_handler_addr(stub_address(8))
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
            idt.invalid_tss.set_handler_addr(stub_address(10));
            idt.segment_not_present.set_handler_addr(stub_address(11));
            idt.stack_segment_fault.set_handler_addr(stub_address(12));
            idt.general_protection_fault.set_handler_addr(stub_address(13));
            idt.page_fault.set_handler_addr(stub_address(14));
            idt.x87_floating_point.set_handler_addr(stub_address(16));
            idt.alignment_check.set_handler_addr(stub_address(17));
            idt.machine_check.set_handler_addr(stub_address(18));
            idt.simd_floating_point.set_handler_addr(stub_address(19));
            idt.virtualization.set_handler_addr(stub_address(20));
            idt.cp_protection_exception.set_handler_addr(stub_address(21));
            idt.hv_injection_exception.set_handler_addr(stub_address(28));
            idt.vmm_communication_exception.set_handler_addr(stub_address(29));
            idt.security_exception.set_handler_addr(stub_address(30));

            for vector in EXCEPTION_VECTORS..=u8::MAX {
                idt[vector].set_handler_addr(stub_address(vector));
            }
            // User programs may raise the syscall vector themselves.
            idt[SYSCALL_VECTOR].set_privilege_level(PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}
