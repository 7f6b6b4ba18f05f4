//! Platform-Level Interrupt Controller driver (C11), grounded on the
//! teacher's `ch2/plic.rs` for the register API shape and on
//! `original_source`'s PLIC usage for the per-hart S-mode context
//! addressing QEMU's `virt` machine actually requires (the teacher's flat
//! addressing only ever targets hart 0's M-mode context).
//!
//! Only the UART0 interrupt is enabled (see SPEC_FULL.md Non-goals: no
//! virtio/GPU/input devices survive the transformation).

use crate::param::{PLIC_START, PLIC_UART0_IRQ};
use crate::riscv;

const PLIC_PRIORITY: usize = PLIC_START;
const PLIC_PENDING: usize = PLIC_START + 0x1000;
const PLIC_SENABLE_BASE: usize = PLIC_START + 0x2080;
const PLIC_SPRIORITY_BASE: usize = PLIC_START + 0x20_1000;
const PLIC_SCLAIM_BASE: usize = PLIC_START + 0x20_1004;

const HART_CONTEXT_STRIDE: usize = 0x2000;

fn senable(hartid: usize) -> *mut u32 {
    (PLIC_SENABLE_BASE + HART_CONTEXT_STRIDE * hartid) as *mut u32
}

fn spriority(hartid: usize) -> *mut u32 {
    (PLIC_SPRIORITY_BASE + HART_CONTEXT_STRIDE * hartid) as *mut u32
}

fn sclaim(hartid: usize) -> *mut u32 {
    (PLIC_SCLAIM_BASE + HART_CONTEXT_STRIDE * hartid) as *mut u32
}

/// Sets a global interrupt's priority; priority 0 disables it regardless of
/// the enable bit. Valid range is [0, 7].
pub fn set_priority(id: u32, prio: u8) {
    let reg = (PLIC_PRIORITY as *mut u32).wrapping_add(id as usize);
    unsafe { reg.write_volatile((prio & 7) as u32) };
}

/// Enables interrupt `id` for the supervisor context of the calling hart.
pub fn enable(id: u32) {
    let hartid = riscv::r_hartid() as usize;
    let reg = senable(hartid);
    unsafe { reg.write_volatile(reg.read_volatile() | (1 << id)) };
}

/// Masks every interrupt at or below `threshold` for the calling hart's
/// supervisor context. Valid range is [0, 7]; 0 lets everything through.
pub fn set_threshold(threshold: u8) {
    let hartid = riscv::r_hartid() as usize;
    unsafe { spriority(hartid).write_volatile((threshold & 7) as u32) };
}

pub fn is_pending(id: u32) -> bool {
    let reg = PLIC_PENDING as *const u32;
    unsafe { reg.read_volatile() & (1 << id) != 0 }
}

/// Claims the highest-priority pending interrupt for the calling hart's
/// context, or `None` if nothing is pending.
fn claim() -> Option<u32> {
    let hartid = riscv::r_hartid() as usize;
    let id = unsafe { sclaim(hartid).read_volatile() };
    if id == 0 {
        None
    } else {
        Some(id)
    }
}

fn complete(id: u32) {
    let hartid = riscv::r_hartid() as usize;
    unsafe { sclaim(hartid).write_volatile(id) };
}

/// Dispatches the claimed external interrupt, if any, to its owning driver
/// and completes it. Called from [`crate::trap::s_intr_handler`] on
/// `CAUSE_SEI`.
pub fn handle_interrupt() {
    if let Some(id) = claim() {
        if id == PLIC_UART0_IRQ {
            crate::uart::handle_interrupt();
        } else {
            panic!("unhandled external interrupt: {}", id);
        }
        complete(id);
    }
}
