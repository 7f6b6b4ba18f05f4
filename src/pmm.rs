//! Binary-buddy physical page allocator, grounded on `pmm.c`. Manages the
//! physical range `[HEAP_START, MEMORY_END)`; the head of that range holds a
//! bit-indexed allocation map, one bit per frame, and every free run of
//! `2^order` frames is threaded onto bucket `order`'s intrusive list through
//! an in-place header written at the run's first frame.

use crate::list::{List, ListNode};
use crate::param::{page_round_up, BUCKET_COUNT, PAGE_SIZE};
use crate::symbols;
use spin::Mutex;

#[repr(C)]
struct BlockHeader {
    node: ListNode,
    order: usize,
}

struct Pmm {
    bitmap: *mut u8,
    total_frames: usize,
    heap_start: usize,
    buckets: [List; BUCKET_COUNT],
}

unsafe impl Send for Pmm {}

impl Pmm {
    const fn new() -> Self {
        Pmm {
            bitmap: core::ptr::null_mut(),
            total_frames: 0,
            heap_start: 0,
            buckets: [
                List::new(),
                List::new(),
                List::new(),
                List::new(),
                List::new(),
                List::new(),
                List::new(),
                List::new(),
                List::new(),
            ],
        }
    }

    fn frame_of(&self, addr: usize) -> usize {
        (addr - self.heap_start) / PAGE_SIZE
    }

    fn addr_of(&self, frame: usize) -> usize {
        self.heap_start + frame * PAGE_SIZE
    }

    fn bit_test(&self, frame: usize) -> bool {
        unsafe {
            let byte = *self.bitmap.add(frame / 8);
            (byte & (1 << (frame % 8))) != 0
        }
    }

    fn bit_set_range(&mut self, start: usize, count: usize) {
        for frame in start..start + count {
            unsafe {
                let ptr = self.bitmap.add(frame / 8);
                *ptr |= 1 << (frame % 8);
            }
        }
    }

    fn bit_clear_range(&mut self, start: usize, count: usize) {
        for frame in start..start + count {
            unsafe {
                let ptr = self.bitmap.add(frame / 8);
                *ptr &= !(1 << (frame % 8));
            }
        }
    }

    unsafe fn write_header(&self, addr: usize, order: usize) -> *mut BlockHeader {
        let hdr = addr as *mut BlockHeader;
        (*hdr).order = order;
        hdr
    }

    unsafe fn push_block(&mut self, addr: usize, order: usize) {
        let hdr = self.write_header(addr, order);
        let node: *mut ListNode = &mut (*hdr).node;
        self.buckets[order].push_head(node);
    }

    unsafe fn pop_block(&mut self, order: usize) -> Option<usize> {
        let node = self.buckets[order].pop_head()?;
        Some(node.as_ptr() as usize)
    }

    unsafe fn remove_block(&mut self, addr: usize, order: usize) {
        let node = addr as *mut ListNode;
        self.buckets[order].delete(node);
    }

    unsafe fn block_order(&self, addr: usize) -> usize {
        (*(addr as *const BlockHeader)).order
    }

    fn init(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.init();
        }

        let heap_start = symbols::heap_start();
        let memory_end = symbols::memory_end();
        self.heap_start = heap_start;
        self.total_frames = (memory_end - heap_start) / PAGE_SIZE;

        let bitmap_bytes = (self.total_frames + 7) / 8;
        self.bitmap = heap_start as *mut u8;

        unsafe {
            core::ptr::write_bytes(self.bitmap, 0xff, bitmap_bytes);
        }

        let usable_base = page_round_up(heap_start + bitmap_bytes);
        let mut base = usable_base;
        let mut remaining = (memory_end - usable_base) / PAGE_SIZE;

        let base_frame = self.frame_of(usable_base);
        self.bit_clear_range(base_frame, remaining);

        while remaining > 0 {
            let mut order = BUCKET_COUNT - 1;
            while (1usize << order) > remaining {
                order -= 1;
            }
            unsafe { self.push_block(base, order) };
            base += (1 << order) * PAGE_SIZE;
            remaining -= 1 << order;
        }
    }

    fn alloc(&mut self, order: usize) -> Option<usize> {
        debug_assert!(order < BUCKET_COUNT);
        let mut j = order;
        while j < BUCKET_COUNT && self.buckets[j].is_empty() {
            j += 1;
        }
        if j == BUCKET_COUNT {
            return None;
        }

        let mut addr = unsafe { self.pop_block(j)? };
        while j > order {
            j -= 1;
            let buddy = addr + (1 << j) * PAGE_SIZE;
            unsafe { self.push_block(buddy, j) };
        }

        let frame = self.frame_of(addr);
        self.bit_set_range(frame, 1 << order);

        unsafe {
            core::ptr::write_bytes(addr as *mut u8, 0, (1 << order) * PAGE_SIZE);
        }

        Some(addr)
    }

    fn free(&mut self, addr: usize, order: usize) {
        let frame = self.frame_of(addr);
        self.bit_clear_range(frame, 1 << order);

        let mut addr = addr;
        let mut frame = frame;
        let mut order = order;

        while order < BUCKET_COUNT - 1 {
            let buddy_frame = frame ^ (1 << order);
            let buddy_addr = self.addr_of(buddy_frame);

            if self.bit_test(buddy_frame) {
                break;
            }
            let buddy_order = unsafe { self.block_order(buddy_addr) };
            if buddy_order != order {
                break;
            }

            unsafe { self.remove_block(buddy_addr, order) };
            order += 1;
            if buddy_frame < frame {
                addr = buddy_addr;
                frame = buddy_frame;
            }
        }

        unsafe { self.push_block(addr, order) };
    }
}

static PMM: Mutex<Pmm> = Mutex::new(Pmm::new());

/// Initializes the buddy allocator over `[HEAP_START, MEMORY_END)`. Must run
/// once, before any other hart (were one ever started) could race it.
pub fn pmm_init() {
    PMM.lock().init();
}

/// Allocates `2^order` contiguous, zeroed pages. `order` must be `< 9`.
/// Returns `None` on exhaustion.
pub fn alloc_pages(order: usize) -> Option<usize> {
    PMM.lock().alloc(order)
}

/// Returns a `2^order`-page run previously obtained from [`alloc_pages`]
/// with the same `order`. Passing a pair that was not actually returned
/// together is undefined behavior.
pub fn free_pages(addr: usize, order: usize) {
    PMM.lock().free(addr, order);
}

#[cfg(test)]
mod tests {
    // The real allocator reads linker-provided HEAP_START/MEMORY_END symbols
    // that only exist when linked against virt.lds, so these tests exercise
    // the buddy bookkeeping directly against a fake backing region instead
    // of going through pmm_init().
    use super::*;

    fn fresh_pmm(region: &mut [u8], frames: usize) -> Pmm {
        let mut pmm = Pmm::new();
        for bucket in pmm.buckets.iter_mut() {
            bucket.init();
        }
        pmm.heap_start = region.as_mut_ptr() as usize;
        pmm.total_frames = frames;
        let bitmap_bytes = (frames + 7) / 8;
        pmm.bitmap = region.as_mut_ptr();
        unsafe { core::ptr::write_bytes(pmm.bitmap, 0xff, bitmap_bytes) };
        pmm
    }

    #[test]
    fn scenario_buddy_merge_order() {
        const FRAMES: usize = 32;
        let mut region = vec![0u8; FRAMES * PAGE_SIZE];
        let mut pmm = fresh_pmm(&mut region, FRAMES);

        // Hand the whole region to bucket[5] (32 pages) as one free block.
        let base = pmm.heap_start;
        pmm.bit_clear_range(0, FRAMES);
        unsafe { pmm.push_block(base, 5) };

        let p1 = pmm.alloc(0).unwrap();
        let p2 = pmm.alloc(0).unwrap();
        let p3 = pmm.alloc(0).unwrap();

        pmm.free(p2, 0);
        pmm.free(p3, 0);
        pmm.free(p1, 0);

        assert_eq!(pmm.buckets[0].size(), 1);
        assert_eq!(pmm.buckets[1].size(), 1);
    }

    #[test]
    fn round_trip_alloc_free_restores_state() {
        const FRAMES: usize = 16;
        let mut region = vec![0u8; FRAMES * PAGE_SIZE];
        let mut pmm = fresh_pmm(&mut region, FRAMES);
        let base = pmm.heap_start;
        pmm.bit_clear_range(0, FRAMES);
        unsafe { pmm.push_block(base, 4) };

        for order in 0..4 {
            let before = pmm.buckets[4].size();
            let _ = before;
            let addr = pmm.alloc(order).unwrap();
            pmm.free(addr, order);
            assert_eq!(pmm.buckets[4].size(), 1);
        }
    }
}
