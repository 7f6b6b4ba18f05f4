//! Trap frame layout and the supervisor trap dispatcher, grounded on
//! `trap.c`/`interrupt.c`/`trap.h`. The machine-mode side (timer only) lives
//! in [`crate::timer`] and [`crate::boot`]; everything that reaches
//! supervisor mode funnels through [`s_trap`].

use crate::riscv;

pub const NUM_GP_REGS: usize = 32;
pub const NUM_FP_REGS: usize = 32;

/// Exact byte layout required by the assembly trap vector: 32 GP regs
/// (0-255), 32 FP regs (256-511), then `status, epc, tval, cause`
/// (512-543), all `u64`.
#[repr(C)]
pub struct TrapFrame {
    pub regs: [u64; NUM_GP_REGS],
    pub fp_regs: [u64; NUM_FP_REGS],
    pub status: u64,
    pub epc: u64,
    pub tval: u64,
    pub cause: u64,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        TrapFrame {
            regs: [0; NUM_GP_REGS],
            fp_regs: [0; NUM_FP_REGS],
            status: 0,
            epc: 0,
            tval: 0,
            cause: 0,
        }
    }
}

extern "C" {
    /// Entry point for every trap taken while the supervisor trap vector is
    /// installed. Pushes a [`TrapFrame`] to the interrupted stack (or swaps
    /// in the thread's scratch stack pointer first, on a kernel-from-kernel
    /// trap this swap is a no-op) and calls [`s_trap`].
    pub fn s_trap_vec();

    /// Pops a (possibly fabricated) [`TrapFrame`] and executes `sret`. Used
    /// both for normal trap return and, via `__schedule_tail_entry`, to give
    /// a freshly created thread its first taste of execution.
    pub fn s_ret_trap() -> !;

    /// Machine-mode vector installed in `mtvec`; rearms `mtimecmp` and
    /// raises `mip.SSIP` so the supervisor side picks up the tick. Lives in
    /// [`crate::boot`]/[`crate::timer`].
    pub fn m_trap_vec();
}

/// Interrupt state is a two-valued observable mirroring `sstatus.SIE`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum IntrState {
    Off,
    On,
}

pub fn intr_get_state() -> IntrState {
    if riscv::r_sstatus() & riscv::SSTATUS_SIE_MASK != 0 {
        IntrState::On
    } else {
        IntrState::Off
    }
}

pub fn intr_enable() -> IntrState {
    let prev = intr_get_state();
    riscv::w_sstatus(riscv::r_sstatus() | riscv::SSTATUS_SIE);
    prev
}

pub fn intr_disable() -> IntrState {
    let prev = intr_get_state();
    riscv::w_sstatus(riscv::r_sstatus() & !riscv::SSTATUS_SIE_MASK);
    prev
}

pub fn intr_set_state(state: IntrState) {
    match state {
        IntrState::On => {
            intr_enable();
        }
        IntrState::Off => {
            intr_disable();
        }
    }
}

/// Installs the supervisor trap handling path on this hart: enables the
/// timer/software/external bits in `sie` and turns on `sstatus.SIE`.
pub fn trap_init() {
    riscv::w_sie(riscv::r_sie() | riscv::SIE_STIE | riscv::SIE_SSIE | riscv::SIE_SEIE);
    intr_enable();
}

/// Points `stvec` at the direct-mode supervisor trap vector. Must run on
/// every hart that will take supervisor traps.
pub fn trap_hart_init() {
    riscv::w_stvec(riscv::stvec(s_trap_vec as u64, riscv::STVEC_MODE_DIRECT));
}

pub fn dump_trap_frame(tf: &TrapFrame) {
    let is_interrupt = riscv::scause_interrupt(tf.cause);
    let cause = riscv::scause_exception(tf.cause);
    crate::info!(
        "trap frame: hart={} status={:#x} epc={:#x} interrupt={} cause={} tval={:#x}",
        riscv::r_hartid(),
        tf.status,
        tf.epc,
        is_interrupt,
        cause,
        tf.tval
    );
}

fn s_intr_handler(tf: &mut TrapFrame) {
    let cause = riscv::scause_exception(tf.cause);
    match cause {
        riscv::CAUSE_STI => crate::sched::scheduler_tick(),
        riscv::CAUSE_SEI => crate::plic::handle_interrupt(),
        _ => {
            dump_trap_frame(tf);
            panic!("unexpected interrupt");
        }
    }
}

fn s_exc_handler(tf: &mut TrapFrame) {
    let cause = riscv::scause_exception(tf.cause);
    match cause {
        riscv::CAUSE_INST_ADDR_MISALIGNED
        | riscv::CAUSE_LOAD_ADDR_MISALIGNED
        | riscv::CAUSE_STORE_ADDR_MISALIGNED => {
            panic!(
                "address misaligned: hart={} epc={:#x} tval={:#x}",
                riscv::r_hartid(),
                tf.epc,
                tf.tval
            );
        }
        riscv::CAUSE_INST_PAGE_FAULT | riscv::CAUSE_LOAD_PAGE_FAULT | riscv::CAUSE_STORE_PAGE_FAULT => {
            panic!(
                "page fault: hart={} epc={:#x} tval={:#x}",
                riscv::r_hartid(),
                tf.epc,
                tf.tval
            );
        }
        riscv::CAUSE_INST_ACCESS_FAULT | riscv::CAUSE_LOAD_ACCESS_FAULT | riscv::CAUSE_STORE_ACCESS_FAULT => {
            panic!(
                "access fault: hart={} epc={:#x} tval={:#x}",
                riscv::r_hartid(),
                tf.epc,
                tf.tval
            );
        }
        riscv::CAUSE_UECALL | riscv::CAUSE_SECALL | riscv::CAUSE_MECALL => {
            panic!(
                "e-call: hart={} epc={:#x} tval={:#x}",
                riscv::r_hartid(),
                tf.epc,
                tf.tval
            );
        }
        riscv::CAUSE_ILLEGAL_INST => {
            panic!(
                "illegal instruction: hart={} epc={:#x} tval={:#x}",
                riscv::r_hartid(),
                tf.epc,
                tf.tval
            );
        }
        riscv::CAUSE_BREAKPOINT => {
            panic!(
                "breakpoint: hart={} epc={:#x} tval={:#x}",
                riscv::r_hartid(),
                tf.epc,
                tf.tval
            );
        }
        _ => dump_trap_frame(tf),
    }
}

/// Dispatches every supervisor trap: interrupts go through
/// [`s_intr_handler`], exceptions through [`s_exc_handler`]. Called from
/// assembly (`s_trap_vec`) with `tf` pointing at the frame just pushed.
#[no_mangle]
pub extern "C" fn s_trap(tf: *mut TrapFrame) {
    let tf = unsafe { &mut *tf };
    debug_assert!(tf.status & riscv::SSTATUS_SPP_MASK != 0, "s_trap from non-supervisor privilege");

    if riscv::scause_interrupt(tf.cause) {
        s_intr_handler(tf);
    } else {
        s_exc_handler(tf);
    }
}
