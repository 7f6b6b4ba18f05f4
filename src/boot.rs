//! Machine-mode bootstrap (C8) and the hand-written assembly underneath the
//! trap/context-switch contract (C5): the M→S transition, the two trap
//! vectors, the trap-return path, and `switch_contexts`.
//!
//! The teacher repo keeps this kind of code in a dedicated assembly module
//! pulled in with `global_asm!(include_str!(...))`; the `llvm_asm!` bodies
//! those `.S` files would have contained are long gone from stable Rust, so
//! this module uses `global_asm!` with inline assembly text instead — still
//! the same "assembly lives in one place, Rust calls into it by symbol"
//! shape, just with syntax that actually compiles today.

use core::arch::global_asm;

global_asm!(
    r#"
.section .text.init
.global _boot
_boot:
    // Only hart 0 is brought up; every other hart parks itself (multi-hart
    // bring-up is a non-goal, see SPEC_FULL.md Non-goals).
    csrr    t0, mhartid
    mv      tp, t0
    bnez    t0, park

    .option push
    .option norelax
    la      gp, __global_pointer$
    .option pop

    la      sp, _boot_stack_top

    // Zero .bss before any Rust code runs.
    la      t0, BSS_START
    la      t1, BSS_END
1:
    bgeu    t0, t1, 2f
    sd      zero, 0(t0)
    addi    t0, t0, 8
    j       1b
2:

    call    boot_init
    j       park

park:
    wfi
    j       park

.section .bss
.align 12
.global _boot_stack_bottom
_boot_stack_bottom:
    .skip 4096 * 4
.global _boot_stack_top
_boot_stack_top:
"#
);

global_asm!(
    r#"
.section .text
.align 4
.global m_trap_vec
m_trap_vec:
    // mscratch holds a per-hart 5-word scratch array:
    //   [0] = &mtimecmp, [8] = t1 save, [16] = t2 save, [24] = t3 save, [32] = interval
    csrrw   t0, mscratch, t0
    sd      t1, 8(t0)
    sd      t2, 16(t0)
    sd      t3, 24(t0)

    ld      t1, 0(t0)       // CLINT mtimecmp address for this hart
    ld      t2, 32(t0)      // rearm interval
    ld      t3, 0(t1)
    add     t3, t3, t2
    sd      t3, 0(t1)

    li      t1, 2           // mip.SSIP
    csrs    mip, t1

    ld      t1, 8(t0)
    ld      t2, 16(t0)
    ld      t3, 24(t0)
    csrrw   t0, mscratch, t0
    mret
"#
);

global_asm!(
    r#"
.section .text
.align 4
.global s_trap_vec
s_trap_vec:
    // sscratch holds the current thread's page-top address (set by
    // sched.rs on every context switch); swapping it into sp and then
    // subtracting the trap frame's size lands exactly on this thread's
    // fixed tf_addr, whether the trap is from U-mode or from the kernel
    // itself.
    csrrw   sp, sscratch, sp
    addi    sp, sp, -544   // size_of::<TrapFrame>()

    .irp n,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31
    sd      x\n, 8*\n(sp)
    .endr

    csrr    t0, sstatus
    sd      t0, 512(sp)
    csrr    t0, sepc
    sd      t0, 520(sp)
    csrr    t0, stval
    sd      t0, 528(sp)
    csrr    t0, scause
    sd      t0, 536(sp)

    mv      a0, sp
    call    s_trap

    j       s_ret_trap

.global s_ret_trap
s_ret_trap:
    ld      t0, 512(sp)
    csrw    sstatus, t0
    ld      t0, 520(sp)
    csrw    sepc, t0

    .irp n,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31
    ld      x\n, 8*\n(sp)
    .endr

    addi    sp, sp, 544
    csrrw   sp, sscratch, sp
    sret
"#
);

global_asm!(
    r#"
.section .text
.align 4
.global switch_contexts
switch_contexts:
    // a0 = &mut *mut Context (prev), a1 = *mut Context (next)
    addi    sp, sp, -104
    sd      ra, 0(sp)
    .irp n,0,1,2,3,4,5,6,7,8,9,10,11
    sd      s\n, 8+8*\n(sp)
    .endr

    sd      sp, 0(a0)
    mv      sp, a1

    ld      ra, 0(sp)
    .irp n,0,1,2,3,4,5,6,7,8,9,10,11
    ld      s\n, 8+8*\n(sp)
    .endr
    addi    sp, sp, 104
    ret
"#
);

extern "C" {
    fn s_trap_vec();
}

/// Runs on hart 0, in machine mode, right after `.bss` is zeroed. Drops to
/// supervisor mode at `kmain`: sets `mstatus.MPP = S`, delegates every
/// exception/interrupt, arms the first timer tick, installs the
/// machine-mode timer vector, and executes `mret`.
#[no_mangle]
extern "C" fn boot_init() -> ! {
    use crate::riscv;

    riscv::w_mstatus((riscv::r_mstatus() & !riscv::MSTATUS_MPP_MASK) | riscv::MSTATUS_MPP_S);
    riscv::w_medeleg(0xffff);
    riscv::w_mideleg(0xffff);
    riscv::w_mepc(crate::kmain as usize as u64);

    crate::timer::timer_init();

    riscv::w_mstatus(riscv::r_mstatus() | riscv::MSTATUS_MIE);
    riscv::w_mie(riscv::r_mie() | riscv::MIE_MTIE);

    unsafe {
        core::arch::asm!("mret", options(noreturn));
    }
}
