//! Host-side stand-in for the hardware, shared by the unit tests.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use crate::config::{USER_STACK_PAGES, USER_STACK_TOP};
use crate::errno::Errno;
use crate::frame::Registers;
use crate::hal::{AddressSpace, Console, Hal, InterruptController, InterruptMask, MemoryManager};
use crate::kernel::Kernel;
use crate::syscall::SyscallTable;

pub const USER_CS: u16 = 0x23;
pub const USER_SS: u16 = 0x1b;
pub const USER_ENTRY: u64 = 0x40_1000;
/// Start of a zeroed, mapped page of user data.
pub const USER_DATA: u64 = 0x60_0000;
pub const SIGNAL_TRAMPOLINE: u64 = 0x40_0f00;
pub const INIT_SPACE: AddressSpace = 0x1000;

const PAGE: u64 = 4096;

pub fn user_frame(entry: u64) -> Registers {
    Registers::new_context(entry, USER_STACK_TOP, USER_CS, USER_SS)
}

type UserMemory = BTreeMap<u64, u8>;

pub struct MockHal {
    interrupts: Cell<bool>,
    acked: RefCell<Vec<u8>>,
    console: RefCell<Vec<u8>>,
    spaces: RefCell<BTreeMap<AddressSpace, UserMemory>>,
    active: Cell<AddressSpace>,
    next_space: Cell<AddressSpace>,
    released: RefCell<Vec<AddressSpace>>,
    fail_duplicate: Cell<bool>,
    fault: Cell<(u64, bool)>,
}

impl MockHal {
    pub fn new() -> Self {
        MockHal {
            interrupts: Cell::new(false),
            acked: RefCell::new(Vec::new()),
            console: RefCell::new(Vec::new()),
            spaces: RefCell::new(BTreeMap::new()),
            active: Cell::new(0),
            next_space: Cell::new(INIT_SPACE + 1),
            released: RefCell::new(Vec::new()),
            fail_duplicate: Cell::new(false),
            fault: Cell::new((0, false)),
        }
    }

    /// Maps `len` zeroed bytes at `addr` in `space`.
    pub fn map(&self, space: AddressSpace, addr: u64, len: u64) {
        let mut spaces = self.spaces.borrow_mut();
        let memory = spaces.entry(space).or_default();
        for a in addr..addr + len {
            memory.entry(a).or_insert(0);
        }
    }

    pub fn poke(&self, space: AddressSpace, addr: u64, bytes: &[u8]) {
        let mut spaces = self.spaces.borrow_mut();
        let memory = spaces.entry(space).or_default();
        for (a, b) in (addr..).zip(bytes) {
            memory.insert(a, *b);
        }
    }

    pub fn peek(&self, space: AddressSpace, addr: u64, len: usize) -> Option<Vec<u8>> {
        let spaces = self.spaces.borrow();
        let memory = spaces.get(&space)?;
        (addr..addr + len as u64).map(|a| memory.get(&a).copied()).collect()
    }

    pub fn console_output(&self) -> String {
        String::from_utf8_lossy(&self.console.borrow()).into_owned()
    }

    pub fn acked_irqs(&self) -> Vec<u8> {
        self.acked.borrow().clone()
    }

    pub fn active_space(&self) -> AddressSpace {
        self.active.get()
    }

    pub fn released(&self) -> Vec<AddressSpace> {
        self.released.borrow().clone()
    }

    pub fn fail_next_duplicate(&self) {
        self.fail_duplicate.set(true);
    }

    pub fn set_fault_address(&self, addr: u64, resolvable: bool) {
        self.fault.set((addr, resolvable));
    }
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptMask for MockHal {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts.get()
    }

    fn enable_interrupts(&self) {
        self.interrupts.set(true);
    }

    fn disable_interrupts(&self) {
        self.interrupts.set(false);
    }
}

impl InterruptController for MockHal {
    fn end_of_interrupt(&self, irq: u8) {
        self.acked.borrow_mut().push(irq);
    }
}

impl Console for MockHal {
    fn write_bytes(&self, _fd: usize, bytes: &[u8]) {
        self.console.borrow_mut().extend_from_slice(bytes);
    }
}

impl MemoryManager for MockHal {
    fn duplicate(&self, space: AddressSpace) -> Result<AddressSpace, Errno> {
        if self.fail_duplicate.replace(false) {
            return Err(Errno::ENOMEM);
        }
        let copy = self.next_space.get();
        self.next_space.set(copy + 1);
        let mut spaces = self.spaces.borrow_mut();
        let memory = spaces.get(&space).cloned().unwrap_or_default();
        spaces.insert(copy, memory);
        Ok(copy)
    }

    fn activate(&self, space: AddressSpace) {
        self.active.set(space);
    }

    fn release(&self, space: AddressSpace) {
        assert_ne!(space, self.active.get(), "released the active address space");
        self.spaces.borrow_mut().remove(&space);
        self.released.borrow_mut().push(space);
    }

    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), Errno> {
        let bytes = self.peek(self.active.get(), addr, buf.len()).ok_or(Errno::EFAULT)?;
        buf.copy_from_slice(&bytes);
        Ok(())
    }

    fn copy_to_user(&self, addr: u64, bytes: &[u8]) -> Result<(), Errno> {
        let mut spaces = self.spaces.borrow_mut();
        let memory = spaces.get_mut(&self.active.get()).ok_or(Errno::EFAULT)?;
        if !(addr..addr + bytes.len() as u64).all(|a| memory.contains_key(&a)) {
            return Err(Errno::EFAULT);
        }
        for (a, b) in (addr..).zip(bytes) {
            memory.insert(a, *b);
        }
        Ok(())
    }

    fn fault_address(&self) -> u64 {
        self.fault.get().0
    }

    fn resolve_page_fault(&self, _space: AddressSpace, addr: u64, _error_code: u64) -> bool {
        let (fault, resolvable) = self.fault.get();
        resolvable && fault == addr
    }
}

impl Hal for MockHal {
    fn idle_frame(&self) -> Registers {
        Registers::new_context(0xffff_8000_0000_1000, 0xffff_8000_0020_0000, 0x08, 0x10)
    }

    fn signal_trampoline(&self) -> u64 {
        SIGNAL_TRAMPOLINE
    }
}

/// Gives `kernel` an init process with a user stack and a data page, then
/// makes it current.
pub fn boot(kernel: &Kernel<MockHal>) {
    let hal = kernel.hal();
    hal.map(INIT_SPACE, USER_STACK_TOP - USER_STACK_PAGES * PAGE, USER_STACK_PAGES * PAGE);
    hal.map(INIT_SPACE, USER_DATA, PAGE);
    kernel.spawn_init(user_frame(USER_ENTRY), INIT_SPACE).unwrap();
    let first = kernel.start();
    assert_eq!(first, user_frame(USER_ENTRY));
}

pub fn booted_kernel() -> Kernel<MockHal> {
    booted_kernel_with(SyscallTable::standard())
}

pub fn booted_kernel_with(syscalls: SyscallTable<MockHal>) -> Kernel<MockHal> {
    let kernel = Kernel::with_syscalls(MockHal::new(), syscalls);
    boot(&kernel);
    kernel
}
