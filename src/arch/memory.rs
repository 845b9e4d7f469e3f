//! Physical frames, page tables and user memory access.
//!
//! Page tables are reached through the higher-half direct map Limine sets
//! up. Address spaces share everything but the PML4 slot holding the user
//! stack, which fork deep-copies.

use core::sync::atomic::{AtomicU64, Ordering};

use limine::memory_map::{Entry, EntryType};
use limine::response::MemoryMapResponse;
use spin::Mutex;
use x86_64::registers::control::{Cr3, Cr3Flags, Cr4, Cr4Flags};
use x86_64::structures::paging::{FrameAllocator, PageTable, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{USER_STACK_PAGES, USER_STACK_TOP};
use crate::errno::Errno;
use crate::hal::AddressSpace;
use crate::syscall::validate::check_user_range;

const PAGE_SIZE: u64 = 4096;

static FRAME_ALLOCATOR: Mutex<Option<BootFrameAllocator>> = Mutex::new(None);
static HHDM: AtomicU64 = AtomicU64::new(0);

pub fn init(hhdm_offset: u64, memmap: &'static MemoryMapResponse) {
    HHDM.store(hhdm_offset, Ordering::Relaxed);
    *FRAME_ALLOCATOR.lock() = Some(BootFrameAllocator::new(memmap));

    // Kernel text is shared with ring 3, so supervisor protections must be off.
    unsafe {
        Cr4::update(|flags| {
            flags.remove(
                Cr4Flags::SUPERVISOR_MODE_EXECUTION_PROTECTION
                    | Cr4Flags::SUPERVISOR_MODE_ACCESS_PREVENTION,
            )
        });
    }
}

fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + HHDM.load(Ordering::Relaxed))
}

/// Gets a zeroed physical frame from the system memory map.
pub fn alloc_frame() -> Result<PhysAddr, Errno> {
    let frame = x86_64::instructions::interrupts::without_interrupts(|| {
        FRAME_ALLOCATOR
            .lock()
            .as_mut()
            .and_then(|allocator| allocator.allocate_frame())
    })
    .ok_or(Errno::ENOMEM)?;
    let addr = frame.start_address();
    unsafe { zero_frame(addr) };
    Ok(addr)
}

unsafe fn zero_frame(phys: PhysAddr) {
    let ptr = phys_to_virt(phys).as_mut_ptr::<u8>();
    core::ptr::write_bytes(ptr, 0, PAGE_SIZE as usize);
}

unsafe fn table<'a>(phys: PhysAddr) -> &'a mut PageTable {
    &mut *phys_to_virt(phys).as_mut_ptr::<PageTable>()
}

pub fn active_space() -> AddressSpace {
    Cr3::read().0.start_address().as_u64()
}

pub fn activate(space: AddressSpace) {
    if active_space() == space {
        return;
    }
    let frame = PhysFrame::containing_address(PhysAddr::new(space));
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

/// Walks `pml4` down to the level 1 entry for `virt`, creating missing
/// tables on the way. Intermediate entries get `flags` added.
unsafe fn map_page(pml4: PhysAddr, virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<(), Errno> {
    let indices = [virt.p4_index(), virt.p3_index(), virt.p2_index()];
    let mut current = table(pml4);
    for index in indices {
        let entry = &mut current[index];
        if entry.is_unused() {
            let frame = alloc_frame()?;
            entry.set_addr(frame, flags | PageTableFlags::PRESENT);
        } else {
            entry.set_flags(entry.flags() | flags);
        }
        current = table(entry.addr());
    }
    current[virt.p1_index()].set_addr(phys, flags | PageTableFlags::PRESENT);
    x86_64::instructions::tlb::flush(virt);
    Ok(())
}

/// Sets `USER_ACCESSIBLE` on every level covering `[start, start + len)` in
/// the active address space. Huge pages are handled at their own level.
pub fn expose_to_user(start: u64, len: u64) {
    let pml4 = PhysAddr::new(active_space());
    let first = start & !(PAGE_SIZE - 1);
    for page in (first..start + len).step_by(PAGE_SIZE as usize) {
        let virt = VirtAddr::new(page);
        let indices = [virt.p4_index(), virt.p3_index(), virt.p2_index(), virt.p1_index()];
        let mut current = unsafe { table(pml4) };
        for index in indices {
            let entry = &mut current[index];
            if entry.is_unused() {
                break;
            }
            entry.set_flags(entry.flags() | PageTableFlags::USER_ACCESSIBLE);
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                break;
            }
            current = unsafe { table(entry.addr()) };
        }
        x86_64::instructions::tlb::flush(virt);
    }
}

/// Maps a zeroed user stack ending at `USER_STACK_TOP` into the active space.
pub fn map_user_stack() -> Result<(), Errno> {
    let pml4 = PhysAddr::new(active_space());
    let flags = PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE | PageTableFlags::NO_EXECUTE;
    for page in 0..USER_STACK_PAGES {
        let virt = VirtAddr::new(USER_STACK_TOP - (page + 1) * PAGE_SIZE);
        let frame = alloc_frame()?;
        unsafe { map_page(pml4, virt, frame, flags)? };
    }
    Ok(())
}

/// Recursively copies the table at `src` (`level` 1 to 3), data pages included.
unsafe fn copy_table(src: PhysAddr, level: u8) -> Result<PhysAddr, Errno> {
    let copy = alloc_frame()?;
    let (from, to) = (table(src), table(copy));
    for (index, entry) in from.iter().enumerate() {
        if entry.is_unused() {
            continue;
        }
        let target = if level == 1 || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            if level != 1 {
                // Never produced by map_user_stack
                return Err(Errno::EINVAL);
            }
            let page = alloc_frame()?;
            core::ptr::copy_nonoverlapping(
                phys_to_virt(entry.addr()).as_ptr::<u8>(),
                phys_to_virt(page).as_mut_ptr::<u8>(),
                PAGE_SIZE as usize,
            );
            page
        } else {
            copy_table(entry.addr(), level - 1)?
        };
        to[index].set_addr(target, entry.flags());
    }
    Ok(copy)
}

/// New address space for a forked child: a private copy of the user stack,
/// everything else shared with `space`.
pub fn duplicate(space: AddressSpace) -> Result<AddressSpace, Errno> {
    let stack_slot = VirtAddr::new(USER_STACK_TOP - 1).p4_index();
    let copy = alloc_frame()?;
    unsafe {
        let (from, to) = (table(PhysAddr::new(space)), table(copy));
        for (index, entry) in from.iter().enumerate() {
            to[index] = entry.clone();
        }
        if !from[stack_slot].is_unused() {
            let stack = copy_table(from[stack_slot].addr(), 3)?;
            to[stack_slot].set_addr(stack, from[stack_slot].flags());
        }
    }
    Ok(copy.as_u64())
}

/// Physical address behind `virt` in the active space, if ring 3 may touch it.
fn translate_user(virt: VirtAddr, write: bool) -> Option<PhysAddr> {
    let mut required = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if write {
        required |= PageTableFlags::WRITABLE;
    }
    let indices = [virt.p4_index(), virt.p3_index(), virt.p2_index(), virt.p1_index()];
    let mut current = unsafe { table(PhysAddr::new(active_space())) };
    for (depth, index) in indices.into_iter().enumerate() {
        let entry = &current[index];
        if !entry.flags().contains(required) {
            return None;
        }
        let is_leaf = depth == 3 || entry.flags().contains(PageTableFlags::HUGE_PAGE);
        if is_leaf {
            let level_size = PAGE_SIZE << (9 * (3 - depth));
            return Some(entry.addr() + (virt.as_u64() & (level_size - 1)));
        }
        current = unsafe { table(entry.addr()) };
    }
    None
}

/// Walks `[addr, addr + len)` page by page and hands each piece of
/// kernel-visible memory to `f` along with its offset in the range.
fn for_each_user_chunk(
    addr: u64,
    len: usize,
    write: bool,
    mut f: impl FnMut(*mut u8, usize, usize),
) -> Result<(), Errno> {
    check_user_range(addr, len)?;
    let mut done = 0;
    while done < len {
        let virt = VirtAddr::new(addr + done as u64);
        let in_page = (PAGE_SIZE - (virt.as_u64() & (PAGE_SIZE - 1))) as usize;
        let chunk = in_page.min(len - done);
        let phys = translate_user(virt, write).ok_or(Errno::EFAULT)?;
        f(phys_to_virt(phys).as_mut_ptr::<u8>(), done, chunk);
        done += chunk;
    }
    Ok(())
}

pub fn copy_from_user(addr: u64, buf: &mut [u8]) -> Result<(), Errno> {
    let len = buf.len();
    for_each_user_chunk(addr, len, false, |src, offset, chunk| unsafe {
        core::ptr::copy_nonoverlapping(src, buf[offset..].as_mut_ptr(), chunk);
    })
}

pub fn copy_to_user(addr: u64, bytes: &[u8]) -> Result<(), Errno> {
    for_each_user_chunk(addr, bytes.len(), true, |dst, offset, chunk| unsafe {
        core::ptr::copy_nonoverlapping(bytes[offset..].as_ptr(), dst, chunk);
    })
}

/// Hands out the usable frames of the Limine memory map in order. Frames
/// are never given back.
pub struct BootFrameAllocator {
    entries: &'static [&'static Entry],
    region: usize,
    offset: u64,
}

impl BootFrameAllocator {
    pub fn new(memmap: &'static MemoryMapResponse) -> Self {
        BootFrameAllocator {
            entries: memmap.entries(),
            region: 0,
            offset: 0,
        }
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        while let Some(entry) = self.entries.get(self.region) {
            // Skip the first megabyte, firmware still lives there.
            let usable = entry.entry_type == EntryType::USABLE && entry.base >= 0x100_000;
            if usable && self.offset + PAGE_SIZE <= entry.length {
                let addr = PhysAddr::new(entry.base + self.offset);
                self.offset += PAGE_SIZE;
                return Some(PhysFrame::containing_address(addr));
            }
            self.region += 1;
            self.offset = 0;
        }
        None
    }
}
