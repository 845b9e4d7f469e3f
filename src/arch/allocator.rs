use linked_list_allocator::LockedHeap;

use crate::config::HEAP_SIZE;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

// The heap is a chunk of the kernel's own BSS.
static mut HEAP_MEM: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

pub fn init_heap() {
    unsafe {
        ALLOCATOR
            .lock()
            .init((&raw mut HEAP_MEM).cast::<u8>(), HEAP_SIZE);
    }
}

/// `(used, total)` bytes.
pub fn heap_usage() -> (usize, usize) {
    let heap = ALLOCATOR.lock();
    (heap.used(), heap.size())
}
