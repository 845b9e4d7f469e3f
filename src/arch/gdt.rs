use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::config::KERNEL_STACK_SIZE;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Kernel data selector as the entry stubs load it into `ds`/`es`.
/// Checked against the real GDT in [`init`].
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;

/// Every trap from ring 3 lands on this stack (TSS RSP0).
static mut KERNEL_STACK: [u8; KERNEL_STACK_SIZE] = [0; KERNEL_STACK_SIZE];
static mut DOUBLE_FAULT_STACK: [u8; KERNEL_STACK_SIZE] = [0; KERNEL_STACK_SIZE];

fn stack_top(stack: *const [u8; KERNEL_STACK_SIZE]) -> VirtAddr {
    VirtAddr::from_ptr(stack) + KERNEL_STACK_SIZE as u64
}

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.privilege_stack_table[0] = stack_top(&raw const KERNEL_STACK);
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            stack_top(&raw const DOUBLE_FAULT_STACK);
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let user_data_selector = gdt.append(Descriptor::user_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                user_code_selector,
                user_data_selector,
                tss_selector,
            },
        )
    };
}

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

pub fn init() {
    GDT.0.load();
    assert_eq!(GDT.1.data_selector.0, KERNEL_DATA_SELECTOR);
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        SS::set_reg(GDT.1.data_selector);
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }
}

/// `(code, data)` selectors for ring 0.
pub fn kernel_selectors() -> (u16, u16) {
    (GDT.1.code_selector.0, GDT.1.data_selector.0)
}

/// `(code, data)` selectors for ring 3, RPL included.
pub fn user_selectors() -> (u16, u16) {
    (GDT.1.user_code_selector.0 | 3, GDT.1.user_data_selector.0 | 3)
}
