//! CLINT driver (C12), grounded on `timer.c`. Owns the single free-running
//! `mtime` counter and the per-hart `mtimecmp` comparator; arming is a
//! read-add-write of `mtimecmp`.

use crate::param::{CLINT_START, NUM_HART, TIMER_INTERVAL};
use crate::riscv;
use core::sync::atomic::{AtomicU64, Ordering};

const CLINT_MTIMECMP_BASE: usize = CLINT_START + 0x4000;
const CLINT_MTIME: usize = CLINT_START + 0xbff8;

fn mtimecmp_addr(hartid: usize) -> usize {
    CLINT_MTIMECMP_BASE + 8 * hartid
}

fn mtime() -> u64 {
    unsafe { (CLINT_MTIME as *const u64).read_volatile() }
}

/// Per-hart scratch array the machine-mode trap vector uses, laid out to
/// match the assembly in [`crate::boot`]: `[&mtimecmp, t1, t2, t3, interval]`.
#[repr(C)]
struct MscratchArea([u64; 5]);

static mut MSCRATCH: [MscratchArea; NUM_HART] = [
    MscratchArea([0; 5]),
    MscratchArea([0; 5]),
    MscratchArea([0; 5]),
    MscratchArea([0; 5]),
];

static TICKS: AtomicU64 = AtomicU64::new(0);

extern "C" {
    fn m_trap_vec();
}

/// Arms the first tick, installs the machine-mode timer vector, and enables
/// `mie.MTIE`. Must run once per hart, in machine mode, before `mret`.
pub fn timer_init() {
    let hartid = riscv::r_mhartid() as usize;
    let addr = mtimecmp_addr(hartid);

    unsafe {
        (addr as *mut u64).write_volatile(mtime() + TIMER_INTERVAL);

        MSCRATCH[hartid].0[0] = addr as u64;
        MSCRATCH[hartid].0[4] = TIMER_INTERVAL;
        riscv::w_mscratch(core::ptr::addr_of!(MSCRATCH[hartid]) as u64);
    }

    riscv::w_mtvec(riscv::stvec(m_trap_vec as u64, riscv::STVEC_MODE_DIRECT));
}

/// Monotonic tick counter, incremented once per scheduler tick.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Called from the supervisor side once `mip.SSIP` has been dispatched back
/// to a supervisor-timer cause; advances the tick count and hands off to
/// the scheduler.
pub fn timer_handle_interrupt() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::scheduler_tick();
}
