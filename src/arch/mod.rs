//! x86_64 bare-metal side: descriptor tables, entry stubs, PIC/PIT,
//! paging and the serial console.

pub mod allocator;
pub mod entry;
pub mod gdt;
pub mod idt;
pub mod init;
pub mod keyboard;
pub mod logger;
pub mod memory;
pub mod serial;
pub mod timer;

use pic8259::ChainedPics;
use spin::{Mutex, Once};

use crate::config::{IDLE_STACK_SIZE, KERNEL_IMAGE_SPAN, PIC_1_OFFSET, PIC_2_OFFSET, USER_STACK_TOP};
use crate::errno::Errno;
use crate::frame::Registers;
use crate::hal::{AddressSpace, Console, Hal, InterruptController, InterruptMask, MemoryManager};
use crate::interrupts::KEYBOARD_IRQ;
use crate::kernel::Kernel;

/// The one kernel context, published once boot is done.
pub static KERNEL: Once<Kernel<X86Hal>> = Once::new();

pub static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[repr(align(16))]
struct IdleStack([u8; IDLE_STACK_SIZE]);

static mut IDLE_STACK: IdleStack = IdleStack([0; IDLE_STACK_SIZE]);

/// Remaps both PICs and unmasks the timer, the keyboard and the cascade line.
pub fn init_pics() {
    let mut pics = PICS.lock();
    unsafe {
        pics.initialize();
        pics.write_masks(0b1111_1000, 0b1111_1111);
    }
}

/// Where the CPU waits for interrupts when no process can run.
extern "C" fn idle_loop() -> ! {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

pub fn halt_forever() -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

pub struct X86Hal;

impl InterruptMask for X86Hal {
    fn interrupts_enabled(&self) -> bool {
        x86_64::instructions::interrupts::are_enabled()
    }

    fn enable_interrupts(&self) {
        x86_64::instructions::interrupts::enable();
    }

    fn disable_interrupts(&self) {
        x86_64::instructions::interrupts::disable();
    }
}

impl InterruptController for X86Hal {
    fn end_of_interrupt(&self, irq: u8) {
        unsafe { PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + irq) };
    }
}

impl Console for X86Hal {
    fn write_bytes(&self, _fd: usize, bytes: &[u8]) {
        serial::write_bytes(bytes);
    }
}

impl MemoryManager for X86Hal {
    fn duplicate(&self, space: AddressSpace) -> Result<AddressSpace, Errno> {
        memory::duplicate(space)
    }

    fn activate(&self, space: AddressSpace) {
        memory::activate(space);
    }

    fn release(&self, space: AddressSpace) {
        // Boot frames are never reclaimed.
        log::debug!("address space {:#x} dropped", space);
    }

    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), Errno> {
        memory::copy_from_user(addr, buf)
    }

    fn copy_to_user(&self, addr: u64, bytes: &[u8]) -> Result<(), Errno> {
        memory::copy_to_user(addr, bytes)
    }

    fn fault_address(&self) -> u64 {
        x86_64::registers::control::Cr2::read_raw()
    }

    fn resolve_page_fault(&self, _space: AddressSpace, _addr: u64, _error_code: u64) -> bool {
        // No demand paging: every user page is mapped up front.
        false
    }
}

impl Hal for X86Hal {
    fn idle_frame(&self) -> Registers {
        let (code, data) = gdt::kernel_selectors();
        let stack_top = (&raw const IDLE_STACK) as u64 + IDLE_STACK_SIZE as u64;
        Registers::new_context(idle_loop as usize as u64, stack_top - 8, code, data)
    }

    fn signal_trampoline(&self) -> u64 {
        entry::signal_trampoline_address()
    }
}

/// Builds the kernel, creates init inside the boot address space and
/// drops into the first scheduled context.
///
/// `kernel_base` is the virtual address the image was loaded at.
pub fn launch(kernel_base: u64) -> ! {
    let mut kernel = Kernel::new(X86Hal);
    kernel.register_irq(KEYBOARD_IRQ, keyboard::on_irq);
    let kernel = KERNEL.call_once(|| kernel);

    memory::expose_to_user(kernel_base, KERNEL_IMAGE_SPAN);
    if let Err(err) = memory::map_user_stack() {
        panic!("cannot map the init stack: {:?}", err);
    }

    let (code, data) = gdt::user_selectors();
    // Entered as if called: rsp is 8 off 16-byte alignment.
    let frame = Registers::new_context(init::main as usize as u64, USER_STACK_TOP - 8, code, data);
    match kernel.spawn_init(frame, memory::active_space()) {
        Ok(pid) => log::info!("init is pid {}", pid),
        Err(err) => panic!("cannot create init: {:?}", err),
    }

    let first = kernel.start();
    unsafe { entry::enter_user(first) }
}
