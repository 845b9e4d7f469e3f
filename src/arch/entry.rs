//! Assembly side of trap entry and exit.
//!
//! `trap_stubs` is an array of 256 stubs, `TRAP_STUB_SIZE` bytes apart. Stub
//! `v` pushes a zero error code unless the CPU already pushed one for `v`,
//! pushes `v` and jumps to `trap_common`. That saves the rest of a
//! [`Registers`] frame, calls [`trap_dispatch`] with a pointer to it and
//! restores whatever the frame holds afterwards.

use core::arch::global_asm;

use x86_64::VirtAddr;

use super::gdt::KERNEL_DATA_SELECTOR;
use crate::config::{ERROR_CODE_MASK, TRAP_STUB_SIZE};
use crate::frame::{Registers, FRAME_WORDS};
use crate::syscall::SYS_SIGRETURN;

global_asm!(
    r#"
    .pushsection .text.trap, "ax"
    .balign {stub_size}
    .global trap_stubs
trap_stubs:
    .set vector, 0
    .rept 256
    .balign {stub_size}
    .if vector < 32
        .if ((({error_mask} >> vector) & 1) == 0)
            pushq $0
        .endif
    .else
        pushq $0
    .endif
    pushq $vector
    jmp trap_common
    .set vector, vector + 1
    .endr

trap_common:
    pushq %rax
    pushq %rbx
    pushq %rcx
    pushq %rdx
    pushq %rsi
    pushq %rdi
    pushq %rbp
    pushq %r8
    pushq %r9
    pushq %r10
    pushq %r11
    pushq %r12
    pushq %r13
    pushq %r14
    pushq %r15
    movq %ds, %rax
    pushq %rax
    movw ${kernel_ds}, %ax
    movw %ax, %ds
    movw %ax, %es

    cld
    movq %rsp, %rdi
    movq %rsp, %rbx
    andq $-16, %rsp
    call {dispatch}
    movq %rbx, %rsp

    .global trap_restore
trap_restore:
    popq %rax
    movw %ax, %ds
    movw %ax, %es
    popq %r15
    popq %r14
    popq %r13
    popq %r12
    popq %r11
    popq %r10
    popq %r9
    popq %r8
    popq %rbp
    popq %rdi
    popq %rsi
    popq %rdx
    popq %rcx
    popq %rbx
    popq %rax
    addq $16, %rsp
    iretq

    .global signal_trampoline
signal_trampoline:
    movq ${sigreturn}, %rax
    int $0x80
    ud2
    .popsection
    "#,
    stub_size = const TRAP_STUB_SIZE,
    error_mask = const ERROR_CODE_MASK,
    kernel_ds = const KERNEL_DATA_SELECTOR,
    sigreturn = const SYS_SIGRETURN,
    dispatch = sym trap_dispatch,
    options(att_syntax)
);

extern "C" {
    fn trap_stubs();
    fn trap_restore();
    fn signal_trampoline();
}

/// Address of the entry stub for `vector`.
pub fn stub_address(vector: u8) -> VirtAddr {
    VirtAddr::new(trap_stubs as usize as u64 + vector as u64 * TRAP_STUB_SIZE as u64)
}

/// Where signal handlers return to. Lives in kernel text, which is
/// exposed to ring 3.
pub fn signal_trampoline_address() -> u64 {
    signal_trampoline as usize as u64
}

extern "C" fn trap_dispatch(frame: &mut Registers) {
    match super::KERNEL.get() {
        Some(kernel) => kernel.handle_trap(frame),
        None => panic!(
            "trap {} at {:#x} before the kernel was ready",
            frame.vector, frame.rip
        ),
    }
}

/// Leaves the boot path for good by restoring `frame` through the trap
/// exit path.
///
/// # Safety
/// `frame` must describe a valid context whose address space is active.
pub unsafe fn enter_user(frame: Registers) -> ! {
    // The frame goes on top of the current stack, like a trap would leave it.
    let mut slot = [0u64; FRAME_WORDS];
    core::ptr::write(slot.as_mut_ptr() as *mut Registers, frame);
    core::arch::asm!(
        "mov rsp, {frame}",
        "jmp {restore}",
        frame = in(reg) slot.as_ptr(),
        restore = sym trap_restore,
        options(noreturn)
    );
}
