#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

// The kernel only boots on the bare-metal target; a host build gets a stub.
#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("trapline must be built for a bare-metal x86_64 target");
    std::process::exit(1);
}

#[cfg(target_os = "none")]
mod boot {
    use limine::request::{ExecutableAddressRequest, HhdmRequest, MemoryMapRequest};
    use limine::BaseRevision;

    use trapline::arch::{self, allocator, gdt, idt, logger, memory, timer};
    use trapline::config::PIT_FREQUENCY_HZ;
    use trapline::serial_println;

    // --- LIMINE BOOTLOADER REQUESTS ---
    #[used]
    static BASE_REVISION: BaseRevision = BaseRevision::new();

    #[used]
    static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

    #[used]
    static KERNEL_ADDR_REQUEST: ExecutableAddressRequest = ExecutableAddressRequest::new();

    #[used]
    static MEMMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

    // --- PANIC HANDLER ---
    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        x86_64::instructions::interrupts::disable();
        serial_println!("\n[KERNEL PANIC] {}", info);
        arch::halt_forever()
    }

    // --- KERNEL ENTRY POINT ---
    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        // -----------------------------------------------------------------------
        // 1. CPU TABLES
        // -----------------------------------------------------------------------
        gdt::init();
        idt::init();

        // -----------------------------------------------------------------------
        // 2. HEAP & LOGGING
        // -----------------------------------------------------------------------
        allocator::init_heap();
        logger::init();
        if !BASE_REVISION.is_supported() {
            panic!("limine base revision not supported");
        }

        // -----------------------------------------------------------------------
        // 3. MEMORY
        // -----------------------------------------------------------------------
        let Some(hhdm) = HHDM_REQUEST.get_response() else {
            panic!("no higher-half direct map from the bootloader");
        };
        let Some(memmap) = MEMMAP_REQUEST.get_response() else {
            panic!("no memory map from the bootloader");
        };
        let Some(kernel_addr) = KERNEL_ADDR_REQUEST.get_response() else {
            panic!("no kernel address from the bootloader");
        };
        memory::init(hhdm.offset(), memmap);
        let (used, total) = allocator::heap_usage();
        log::info!("heap ready: {} of {} bytes in use", used, total);

        // -----------------------------------------------------------------------
        // 4. INTERRUPT HARDWARE
        // -----------------------------------------------------------------------
        arch::init_pics();
        timer::init(PIT_FREQUENCY_HZ);

        // Interrupts come on with the first iretq.
        arch::launch(kernel_addr.virtual_base())
    }
}
