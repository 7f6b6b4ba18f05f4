//! Slab-like heap allocator layered on the page allocator, grounded on
//! `malloc.c`. Small requests are carved out of page-sized superblocks into
//! fixed-size blocks (`MULTIBLOCK`); large requests get a dedicated run of
//! pages (`UNIBLOCK`). Bucket free lists are protected by sleeping locks, so
//! `malloc`/`free` must never be called from interrupt context.

use crate::list::{List, ListNode};
use crate::param::{MIN_BLOCK_ORDER, NUM_HEAP_BUCKET, PAGE_SIZE, SBLOCK_MAGIC};
use crate::pmm;
use crate::synch::Lock;
use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Multiblock,
    Uniblock,
}

#[repr(C)]
struct SblockHeader {
    magic: u32,
    kind_tag: u32,
    // MULTIBLOCK
    bucket: usize,
    free_blocks: usize,
    // UNIBLOCK
    page_order: usize,
}

impl SblockHeader {
    fn kind(&self) -> Kind {
        if self.kind_tag == 0 {
            Kind::Multiblock
        } else {
            Kind::Uniblock
        }
    }
}

struct Bucket {
    free_list: List,
    lock: Lock,
    block_size: usize,
}

impl Bucket {
    const fn new(block_size: usize) -> Self {
        Bucket {
            free_list: List::new(),
            lock: Lock::new(),
            block_size,
        }
    }
}

/// Each bucket carries its own sleeping [`Lock`], so unrelated bucket sizes
/// never contend with one another; a fixed `static mut` array (rather than
/// one outer `spin::Mutex` wrapping all of them) is what makes that
/// independence real instead of nominal.
static mut BUCKETS: [Bucket; NUM_HEAP_BUCKET] = bucket_array();

fn bucket(i: usize) -> &'static mut Bucket {
    unsafe { &mut BUCKETS[i] }
}

const fn bucket_array() -> [Bucket; NUM_HEAP_BUCKET] {
    let mut i = 0;
    let mut arr: [Bucket; NUM_HEAP_BUCKET] = [
        Bucket::new(0),
        Bucket::new(0),
        Bucket::new(0),
        Bucket::new(0),
        Bucket::new(0),
        Bucket::new(0),
        Bucket::new(0),
    ];
    while i < NUM_HEAP_BUCKET {
        arr[i] = Bucket::new(1 << (MIN_BLOCK_ORDER + i));
        i += 1;
    }
    arr
}

/// Initializes every bucket's free list and lock. Must run once, before any
/// other hart (were one ever started) could race it.
pub fn malloc_init() {
    for i in 0..NUM_HEAP_BUCKET {
        let b = bucket(i);
        b.free_list.init();
        b.lock.init();
    }
}

fn bucket_index_for(n: usize) -> Option<usize> {
    for i in 0..NUM_HEAP_BUCKET {
        let block_size = 1 << (MIN_BLOCK_ORDER + i);
        if n < block_size {
            return Some(i);
        }
    }
    None
}

fn blocks_per_sblock(block_size: usize) -> usize {
    (PAGE_SIZE - size_of::<SblockHeader>()) / block_size
}

fn ceil_log2_pages(bytes: usize) -> usize {
    let pages = (bytes + PAGE_SIZE - 1) / PAGE_SIZE;
    let mut order = 0;
    while (1usize << order) < pages {
        order += 1;
    }
    order
}

/// Allocates at least `n` bytes, or returns a null pointer on exhaustion or
/// `n == 0`.
pub fn malloc(n: usize) -> *mut u8 {
    if n == 0 {
        return core::ptr::null_mut();
    }

    match bucket_index_for(n) {
        None => {
            let total = n + size_of::<SblockHeader>();
            let order = ceil_log2_pages(total);
            let addr = match pmm::alloc_pages(order) {
                Some(a) => a,
                None => return core::ptr::null_mut(),
            };
            unsafe {
                let hdr = addr as *mut SblockHeader;
                (*hdr).magic = SBLOCK_MAGIC;
                (*hdr).kind_tag = 1;
                (*hdr).page_order = order;
                hdr.add(1) as *mut u8
            }
        }
        Some(i) => {
            let b = bucket(i);
            let block_size = b.block_size;
            b.lock.acquire();

            if b.free_list.is_empty() {
                let addr = match pmm::alloc_pages(0) {
                    Some(a) => a,
                    None => {
                        b.lock.release();
                        return core::ptr::null_mut();
                    }
                };
                let count = blocks_per_sblock(block_size);
                unsafe {
                    let hdr = addr as *mut SblockHeader;
                    (*hdr).magic = SBLOCK_MAGIC;
                    (*hdr).kind_tag = 0;
                    (*hdr).bucket = i;
                    (*hdr).free_blocks = count;

                    let payload = hdr.add(1) as *mut u8;
                    for k in 0..count {
                        let block = payload.add(k * block_size) as *mut ListNode;
                        b.free_list.push_tail(block);
                    }
                }
            }

            let node = unsafe { b.free_list.pop_head() };
            let block = node.map(|n| n.as_ptr() as usize);

            if let Some(addr) = block {
                let page = crate::param::page_round_down(addr);
                unsafe {
                    let hdr = page as *mut SblockHeader;
                    (*hdr).free_blocks -= 1;
                }
            }

            b.lock.release();

            match block {
                Some(addr) => addr as *mut u8,
                None => core::ptr::null_mut(),
            }
        }
    }
}

pub fn calloc(n: usize, size: usize) -> *mut u8 {
    let total = n.saturating_mul(size);
    let ptr = malloc(total);
    if !ptr.is_null() {
        unsafe { core::ptr::write_bytes(ptr, 0, total) };
    }
    ptr
}

/// Frees `p`, which must have been returned by [`malloc`]/[`calloc`]/
/// [`realloc`] and not yet freed. Panics (heap corruption) if the
/// superblock's magic is wrong.
pub fn free(p: *mut u8) {
    if p.is_null() {
        return;
    }

    let page = crate::param::page_round_down(p as usize);
    let hdr = page as *mut SblockHeader;
    unsafe {
        assert_eq!((*hdr).magic, SBLOCK_MAGIC, "heap corruption: bad superblock magic");

        match (*hdr).kind() {
            Kind::Uniblock => {
                pmm::free_pages(page, (*hdr).page_order);
            }
            Kind::Multiblock => {
                let i = (*hdr).bucket;
                let b = bucket(i);
                let block_size = b.block_size;
                let count = blocks_per_sblock(block_size);

                b.lock.acquire();

                core::ptr::write_bytes(p, 0, block_size);
                let node = p as *mut ListNode;
                b.free_list.push_head(node);
                (*hdr).free_blocks += 1;

                if (*hdr).free_blocks == count {
                    let payload = hdr.add(1) as *mut u8;
                    for k in 0..count {
                        let block = payload.add(k * block_size) as *mut ListNode;
                        b.free_list.delete(block);
                    }
                    b.lock.release();
                    pmm::free_pages(page, 0);
                } else {
                    b.lock.release();
                }
            }
        }
    }
}

fn block_user_size(p: *mut u8) -> usize {
    let page = crate::param::page_round_down(p as usize);
    let hdr = page as *mut SblockHeader;
    unsafe {
        match (*hdr).kind() {
            Kind::Uniblock => ((1usize << (*hdr).page_order) * PAGE_SIZE) - size_of::<SblockHeader>(),
            Kind::Multiblock => {
                let i = (*hdr).bucket;
                bucket(i).block_size
            }
        }
    }
}

pub fn realloc(p: *mut u8, size: usize) -> *mut u8 {
    if p.is_null() {
        return malloc(size);
    }
    if size == 0 {
        free(p);
        return core::ptr::null_mut();
    }

    let old_size = block_user_size(p);
    let new_p = malloc(size);
    if new_p.is_null() {
        return core::ptr::null_mut();
    }
    unsafe {
        core::ptr::copy_nonoverlapping(p, new_p, core::cmp::min(old_size, size));
    }
    free(p);
    new_p
}

/// Wires this allocator in as the kernel's `#[global_allocator]` so
/// `extern crate alloc` (`Box`, `Vec`, ...) works throughout the kernel.
/// Alignments beyond a block's natural alignment are satisfied by
/// over-allocating into the next bucket, since every bucket size here is
/// already a power of two and therefore self-aligned.
pub struct KernelAlloc;

unsafe impl GlobalAlloc for KernelAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(layout.align());
        malloc(size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        realloc(ptr, new_size)
    }
}

#[cfg(test)]
mod tests {
    // These exercise bucket arithmetic only; the full malloc/free path goes
    // through the real page allocator and is covered by in-kernel smoke
    // tests instead (see param/pmm tests for the host-testable slice).
    use super::*;

    #[test]
    fn bucket_index_picks_smallest_covering_bucket() {
        assert_eq!(bucket_index_for(1), Some(0));
        assert_eq!(bucket_index_for(16), Some(1));
        assert_eq!(bucket_index_for(17), Some(1));
        assert_eq!(bucket_index_for(2048), None);
    }

    #[test]
    fn ceil_log2_pages_rounds_up() {
        assert_eq!(ceil_log2_pages(PAGE_SIZE), 0);
        assert_eq!(ceil_log2_pages(PAGE_SIZE + 1), 1);
        assert_eq!(ceil_log2_pages(PAGE_SIZE * 3), 2);
    }
}
