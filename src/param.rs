//! Kernel-wide constants: page geometry, allocator bucket counts, scheduling
//! quantum, and the fixed MMIO windows for this machine (QEMU `virt`).

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of buddy-allocator order buckets: orders 0..=8, i.e. runs of up to
/// 256 pages (1 MiB) in one allocation.
pub const BUCKET_COUNT: usize = 9;

/// Smallest heap-allocator block order (16 bytes).
pub const MIN_BLOCK_ORDER: usize = 4;
/// Largest heap-allocator block order before a request is handed to the page
/// allocator directly as a UNIBLOCK.
pub const MAX_BLOCK_ORDER: usize = PAGE_SHIFT - 1;
pub const NUM_HEAP_BUCKET: usize = MAX_BLOCK_ORDER - MIN_BLOCK_ORDER;

pub const SBLOCK_MAGIC: u32 = 0x9a548eed;
pub const THREAD_MAGIC: u64 = 0xe87ab59efc899600;

/// Timer ticks granted to a thread before preemption.
pub const TIME_SLICE: u64 = 10_000;

/// mtime increments per second on QEMU's virt CLINT; the interval below is
/// roughly a 10ms tick at that frequency.
pub const TIMER_FREQ: u64 = 10_000_000;
pub const TIMER_INTERVAL: u64 = TIMER_FREQ / 100;

/// Only hart 0 is ever brought up (see Non-goals), but arrays are sized for
/// more in case that changes.
pub const NUM_HART: usize = 4;

pub const UART0: usize = 0x1000_0000;

pub const PLIC_START: usize = 0x0c00_0000;
pub const PLIC_SIZE: usize = 0x0400_0000;
pub const PLIC_UART0_IRQ: u32 = 10;

pub const CLINT_START: usize = 0x0200_0000;
pub const CLINT_SIZE: usize = 0x0001_0000;

pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub const fn page_round_up(addr: usize) -> usize {
    page_round_down(addr + PAGE_SIZE - 1)
}

pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}
