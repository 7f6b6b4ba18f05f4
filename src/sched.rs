//! Preemptive round-robin thread scheduler, grounded on `thread.c`. Each
//! thread owns a single page: a [`Thread`] header at the page's base, a
//! kernel stack growing down from the page's top, a fabricated
//! [`crate::trap::TrapFrame`] just below the top, and a [`Context`] just
//! below that. `thread_current()` recovers the header by masking the
//! current stack pointer down to the page boundary.

use crate::list::{List, ListNode};
use crate::param::{PAGE_SIZE, THREAD_MAGIC, TIME_SLICE};
use crate::pmm;
use crate::trap::TrapFrame;
use core::arch::asm;
use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    New,
    Ready,
    Running,
    Blocked,
    Dead,
}

/// Minimal save area for a voluntary context switch: a return address and
/// the 12 callee-saved integer registers (`s0..=s11`).
#[repr(C)]
pub struct Context {
    pub ra: u64,
    pub s: [u64; 12],
}

impl Context {
    const fn empty() -> Self {
        Context { ra: 0, s: [0; 12] }
    }
}

#[repr(C)]
pub struct Process {
    pub name: [u8; 32],
    pub page_table: usize,
    pub thread_count: usize,
}

#[repr(C)]
pub struct Thread {
    pub node: ListNode,
    pub tid: u64,
    pub name: [u8; 32],
    pub state: ThreadState,
    pub proc: *mut Process,
    pub exit_code: i32,
    pub ctx: *mut Context,
    pub remaining_ticks: u64,
    pub magic: u64,
}

/// A `Copy`-able, comparable handle to a thread header. All real access goes
/// through `unsafe` dereferences; the type exists so locks and waiter lists
/// can store "which thread" without fighting the borrow checker over a
/// structure whose lifetime is "as long as its page is allocated."
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadPtr(*mut Thread);

impl ThreadPtr {
    pub unsafe fn as_mut(&self) -> &mut Thread {
        &mut *self.0
    }
    pub fn as_ptr(&self) -> *mut Thread {
        self.0
    }
}

static TID_LOCK: spin::Mutex<()> = spin::Mutex::new(());
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

fn allocate_tid() -> u64 {
    let _guard = TID_LOCK.lock();
    NEXT_TID.fetch_add(1, Ordering::SeqCst)
}

static READY_QUEUE: spin::Mutex<List> = spin::Mutex::new(List::new());
static mut IDLE_THREAD: Option<ThreadPtr> = None;
static mut KERNEL_PROCESS: Process = Process {
    name: *b"kernel\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0",
    page_table: 0,
    thread_count: 0,
};

fn read_sp() -> usize {
    let sp: usize;
    unsafe { asm!("mv {0}, sp", out(reg) sp) };
    sp
}

fn thread_current_unchecked() -> ThreadPtr {
    let page = crate::param::page_round_down(read_sp());
    ThreadPtr(page as *mut Thread)
}

/// Recovers the currently running thread by masking `sp` down to its page.
/// A `magic` mismatch means the stack overflowed into the thread header and
/// is a fatal condition.
pub fn thread_current() -> ThreadPtr {
    let current = thread_current_unchecked();
    unsafe {
        assert_eq!((*current.0).magic, THREAD_MAGIC, "stack overflow: thread magic mismatch");
    }
    current
}

pub unsafe fn thread_list_node(t: ThreadPtr) -> *mut ListNode {
    &mut (*t.as_ptr()).node as *mut ListNode
}

pub fn thread_from_list_node(node: *mut ListNode) -> ThreadPtr {
    ThreadPtr(node as *mut Thread)
}

/// Initializes the scheduler's global state: the ready queue and the tid
/// counter. Must run before any thread is created.
pub fn scheduler_init() {
    READY_QUEUE.lock().init();
}

/// Appends `t` to the ready queue. `t.state` must be one of
/// `{New, Running, Blocked}`.
pub fn scheduler_push(t: ThreadPtr) {
    unsafe {
        let th = t.as_mut();
        debug_assert!(matches!(
            th.state,
            ThreadState::New | ThreadState::Running | ThreadState::Blocked
        ));
        th.state = ThreadState::Ready;
        READY_QUEUE.lock().push_tail(&mut th.node);
    }
}

/// Pops the front of the ready queue, or the idle thread if it is empty.
pub fn scheduler_pop() -> ThreadPtr {
    let popped = unsafe { READY_QUEUE.lock().pop_head() };
    match popped {
        Some(node) => thread_from_list_node(node.as_ptr()),
        None => unsafe { IDLE_THREAD.expect("idle thread not installed") },
    }
}

extern "C" {
    /// Saves callee-saved state and `ra` into `*prev`, loads `*next`, and
    /// "returns" into whatever `next.ra` points at — the normal case being
    /// the instruction after the switch in the previous call, and the
    /// first-run case being `__schedule_tail_entry`.
    fn switch_contexts(prev: *mut *mut Context, next: *mut Context);
}

static mut SCHEDULE_TAIL_PREV: Option<ThreadPtr> = None;

fn schedule_tail(prev: Option<ThreadPtr>) {
    let current = thread_current_unchecked();
    unsafe {
        let th = current.as_mut();
        th.state = ThreadState::Running;
        th.remaining_ticks = TIME_SLICE;
    }

    // `current.as_ptr()` is already page-aligned (thread_current_unchecked
    // derives it by rounding sp down to the page), so the page top is just
    // one PAGE_SIZE up. sscratch must point here so s_trap_vec's
    // `csrrw sp, sscratch, sp` lands the next trap frame at this thread's
    // `tf_addr`, not whichever thread ran last.
    let page_top = current.as_ptr() as usize + PAGE_SIZE;
    crate::riscv::w_sscratch(page_top as u64);

    if let Some(prev) = prev {
        let was_dead = unsafe { prev.as_mut().state == ThreadState::Dead };
        if was_dead {
            let page = crate::param::page_round_down(prev.as_ptr() as usize);
            unsafe {
                (*(*prev.as_ptr()).proc).thread_count -= 1;
            }
            pmm::free_pages(page, 0);
        }
    }
}

/// Entry point a freshly created thread's context fabricates as its `ra`:
/// finishes scheduler bookkeeping for the just-switched-in thread, then
/// falls through to the trap-return path that pops its prepared
/// [`TrapFrame`] and jumps to the thread's real entry function.
#[no_mangle]
extern "C" fn __schedule_tail_entry() -> ! {
    let prev_ptr = unsafe { SCHEDULE_TAIL_PREV.take() };
    schedule_tail(prev_ptr);
    unsafe { crate::trap::s_ret_trap() }
}

/// Requires interrupts off and `current.state != Running`. Picks the next
/// thread, context-switches if it differs from the current one, then runs
/// the schedule-tail bookkeeping.
pub fn schedule() {
    let prev = thread_current_unchecked();
    debug_assert_ne!(unsafe { prev.as_mut().state }, ThreadState::Running);

    let next = scheduler_pop();

    unsafe {
        SCHEDULE_TAIL_PREV = Some(prev);
    }

    if next.as_ptr() != prev.as_ptr() {
        unsafe {
            let prev_ctx_slot = &mut (*prev.as_ptr()).ctx as *mut *mut Context;
            let next_ctx = (*next.as_ptr()).ctx;
            switch_contexts(prev_ctx_slot, next_ctx);
        }
        // Execution resumes here once some other thread switches back into
        // `prev`, now current again. A brand-new thread's first resumption
        // runs schedule_tail via __schedule_tail_entry instead, but every
        // later resumption comes back through here, so schedule_tail (and
        // its sscratch rearm) must run on this path too.
        schedule_tail(unsafe { SCHEDULE_TAIL_PREV.take() });
        return;
    }

    schedule_tail(unsafe { SCHEDULE_TAIL_PREV.take() });
}

/// Re-enqueues the current thread (unless it is the idle thread) and yields
/// the hart to the scheduler.
pub fn thread_yield() {
    let old = crate::trap::intr_disable();
    let current = thread_current();
    let is_idle = unsafe { IDLE_THREAD == Some(current) };
    if !is_idle {
        scheduler_push(current);
    }
    schedule();
    crate::trap::intr_set_state(old);
}

/// Marks the current thread blocked and yields. The caller must have
/// already placed the thread on the relevant waiter list, or it will never
/// be woken.
pub fn thread_block() {
    let old = crate::trap::intr_disable();
    unsafe { thread_current().as_mut().state = ThreadState::Blocked };
    schedule();
    crate::trap::intr_set_state(old);
}

/// Moves a blocked thread back onto the ready queue. `t.state` must be
/// `Blocked`.
pub fn thread_unblock(t: ThreadPtr) {
    let old = crate::trap::intr_disable();
    debug_assert_eq!(unsafe { t.as_mut().state }, ThreadState::Blocked);
    scheduler_push(t);
    crate::trap::intr_set_state(old);
}

/// Terminates the current thread. Never returns.
pub fn thread_exit(code: i32) -> ! {
    crate::trap::intr_disable();
    let current = thread_current();
    unsafe {
        let th = current.as_mut();
        th.state = ThreadState::Dead;
        th.exit_code = code;
    }
    schedule();
    unreachable!("schedule() must not return into a dead thread");
}

/// Decrements the current thread's quantum; yields if it has run out.
pub fn scheduler_tick() {
    let current = thread_current();
    let out_of_time = unsafe {
        let th = current.as_mut();
        th.remaining_ticks -= 1;
        th.remaining_ticks == 0
    };
    if out_of_time {
        thread_yield();
    }
}

extern "C" fn entry_trampoline(function: usize, arg: usize) -> ! {
    let f: fn(usize) -> i32 = unsafe { core::mem::transmute(function) };
    let code = f(arg);
    thread_exit(code);
}

/// Allocates a one-page thread, fabricates its trap frame and context so
/// that its first scheduling transfers control into `entry_trampoline`
/// (which calls `function(arg)`), and leaves it `New` until the caller
/// unblocks it.
pub fn kthread_create(name: &str, function: fn(usize) -> i32, arg: usize) -> Option<ThreadPtr> {
    let page = pmm::alloc_pages(0)?;
    let thread_ptr = page as *mut Thread;

    let page_top = page + PAGE_SIZE;
    let tf_addr = page_top - size_of::<TrapFrame>();
    let ctx_addr = tf_addr - size_of::<Context>();

    unsafe {
        (*thread_ptr).node = ListNode::empty();
        (*thread_ptr).tid = allocate_tid();
        (*thread_ptr).name = [0; 32];
        let bytes = name.as_bytes();
        let n = bytes.len().min(31);
        (&mut (*thread_ptr).name)[..n].copy_from_slice(&bytes[..n]);
        (*thread_ptr).state = ThreadState::New;
        (*thread_ptr).proc = core::ptr::addr_of_mut!(KERNEL_PROCESS);
        (*thread_ptr).exit_code = 0;
        (*thread_ptr).remaining_ticks = TIME_SLICE;
        (*thread_ptr).magic = THREAD_MAGIC;
        (*thread_ptr).ctx = ctx_addr as *mut Context;

        KERNEL_PROCESS.thread_count += 1;

        let tf = tf_addr as *mut TrapFrame;
        core::ptr::write_bytes(tf as *mut u8, 0, size_of::<TrapFrame>());
        (*tf).regs[10] = function as usize as u64; // a0
        (*tf).regs[11] = arg as u64; // a1
        (*tf).epc = entry_trampoline as usize as u64;
        (*tf).status = crate::riscv::MSTATUS_SPP_MASK | crate::riscv::MSTATUS_SPIE;
        (*tf).regs[2] = tf_addr as u64; // sp, just below the trap frame on return

        let ctx = ctx_addr as *mut Context;
        *ctx = Context::empty();
        (*ctx).ra = __schedule_tail_entry as usize as u64;
    }

    Some(ThreadPtr(thread_ptr))
}

/// The idle thread: parks itself forever. `scheduler_pop` falls back to it
/// whenever the ready queue is empty, so it must never truly block on
/// anything external.
fn idle_entry(_arg: usize) -> i32 {
    loop {
        thread_block();
    }
}

/// Spawns and installs the idle thread. Must run after [`scheduler_init`].
pub fn spawn_idle_thread() {
    let idle = kthread_create("idle", idle_entry, 0).expect("failed to allocate idle thread");
    unsafe {
        idle.as_mut().state = ThreadState::Blocked;
        IDLE_THREAD = Some(idle);
    }
}

/// Converts the currently executing flow (the boot stack `kmain` is still
/// running on) into a real, `thread_current()`-visible thread. Must run
/// after [`scheduler_init`] but before interrupts are enabled — otherwise a
/// timer tick landing on the boot stack would find no [`Thread`] header at
/// its base and trip the magic-number assertion in [`thread_current`].
///
/// The boot flow's own `ctx` slot is left null: it is only ever read once
/// this thread is switched *out* for the first time, at which point
/// `switch_contexts` overwrites it before anything reads the old value.
pub fn thread_hart_init() {
    let page = crate::param::page_round_down(read_sp());
    let thread_ptr = page as *mut Thread;

    unsafe {
        (*thread_ptr).node = ListNode::empty();
        (*thread_ptr).tid = allocate_tid();
        (*thread_ptr).name = *b"main\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";
        (*thread_ptr).state = ThreadState::Running;
        (*thread_ptr).proc = core::ptr::addr_of_mut!(KERNEL_PROCESS);
        (*thread_ptr).exit_code = 0;
        (*thread_ptr).remaining_ticks = TIME_SLICE;
        (*thread_ptr).magic = THREAD_MAGIC;
        (*thread_ptr).ctx = core::ptr::null_mut();

        KERNEL_PROCESS.thread_count += 1;
    }

    crate::riscv::w_sscratch((page + PAGE_SIZE) as u64);
}

/// Starts the scheduler running on the now-registered boot thread: yields
/// forever, relying entirely on [`schedule`]/[`switch_contexts`] to carry it
/// into whatever thread the ready queue (or the idle thread) produces. Never
/// returns.
pub fn scheduler_start() -> ! {
    loop {
        thread_yield();
    }
}
